use crate::world::Entity;

bitflags::bitflags! {
    /// How a recorded command affects rollback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RollbackEntryKind: u8 {
        /// First-time application of a command.
        const INIT = 0b0000_0001;
        /// The entry's presence forces a resimulation from its frame.
        const RESTORE = 0b0000_0010;
        /// Originates locally; restore may not be rebased past it.
        const LOCAL = 0b0000_0100;
    }
}

/// One recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub kind: RollbackEntryKind,
    pub key: i64,
    pub entity: Entity,
    pub frame_index: u32,
}

impl Entry {
    pub fn new(kind: RollbackEntryKind, key: i64, entity: Entity) -> Self {
        Self {
            kind,
            key,
            entity,
            frame_index: 0,
        }
    }
}

/// A recorded (frame, entry) pairing waiting to be merged into the frame map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntryKey {
    pub frame_index: u32,
    pub entry_index: usize,
}

/// Ledger mutation as it travels through a [`Recorder`](super::Recorder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Record { frame_index: u32, entry: Entry },
    Move { key: i64, from: u32, to: u32 },
}

/// Mutation held by the ledger until the next merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Record(FrameEntryKey),
    Move { key: i64, from: u32, to: u32 },
}

/// Entries merged at one frame plus the union of their kinds.
///
/// `kind` only ever gains bits, even when entries are evicted.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameSlot {
    pub kind: RollbackEntryKind,
    pub entries: Vec<Entry>,
}

impl FrameSlot {
    pub fn take(&mut self, key: i64) -> Option<Entry> {
        let idx = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(idx))
    }
}

/// A merged (or vacated) entry queued for the hit test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HitCandidate {
    pub frame_index: u32,
    pub entity: Entity,
    pub forced: bool,
}
