//! Frame-indexed command ledger.
//!
//! Commands are recorded now and merged later. `record` and `move_entry` only append to a
//! pending list (or, from other threads, to a [`Recorder`] wheel); [`CommandLedger::test`]
//! merges everything once per tick and derives the earliest frame that must be replayed.
//!
//! A test pass has three strictly ordered phases:
//! 1. init: merge pending records and moves into the frame map, evicting older entries
//!    with the same key, and lower `command` to the earliest touched frame.
//! 2. hit test: for every merged or vacated entry, scan forward from its frame to the
//!    current `restore` and lower `restore` to the first frame the tester reports as
//!    changed. Runs in parallel; `restore` only ever moves down.
//! 3. command: mark the restore frame, honour a minimum restore request unless a local
//!    entry blocks it, and pull `command` back over the contiguous run of touched frames
//!    that precedes it and was never a restore point.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering::AcqRel, Ordering::Acquire};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{error, trace, warn};
use rayon::prelude::*;

use crate::config::DEFAULT_INNERLOOP_BATCH_COUNT;
use crate::frame::FrameIndices;
use crate::world::Entity;

pub mod entry;
pub mod tester;
pub mod wheel;

pub use entry::{Entry, FrameEntryKey, LedgerOp, RollbackEntryKind};
pub use tester::{AlwaysHit, EntryTester, NeverHit};
pub use wheel::{Recorder, RecordWheel, RECORD_WHEEL_SLOTS};

use entry::{FrameSlot, HitCandidate, PendingOp};

/// Per-command frame bookkeeping and restore-point computation.
#[derive(Debug)]
pub struct CommandLedger {
    indices: FrameIndices,
    /// `real_frame + 1`; `restore` never exceeds it.
    upper: u32,
    innerloop_batch_count: usize,
    entries: Vec<Entry>,
    pending: Vec<PendingOp>,
    recorders: Vec<Arc<RecordWheel<RECORD_WHEEL_SLOTS, LedgerOp>>>,
    frames: BTreeMap<u32, FrameSlot>,
    key_frames: HashMap<i64, u32>,
    detached: HashMap<i64, Entry>,
}

impl Default for CommandLedger {
    fn default() -> Self {
        Self::new(DEFAULT_INNERLOOP_BATCH_COUNT)
    }
}

/// Scratch state of one init phase.
struct Merge {
    touched: u32,
    candidates: Vec<HitCandidate>,
}

impl Merge {
    fn touch(&mut self, frame_index: u32, entry: &Entry, forced: bool) {
        self.touched = self.touched.min(frame_index);
        self.candidates.push(HitCandidate {
            frame_index,
            entity: entry.entity,
            forced,
        });
    }
}

impl CommandLedger {
    pub fn new(innerloop_batch_count: usize) -> Self {
        Self {
            indices: FrameIndices::default(),
            upper: 1,
            innerloop_batch_count: innerloop_batch_count.max(1),
            entries: Vec::new(),
            pending: Vec::new(),
            recorders: Vec::new(),
            frames: BTreeMap::new(),
            key_frames: HashMap::new(),
            detached: HashMap::new(),
        }
    }

    pub fn indices(&self) -> FrameIndices {
        self.indices
    }

    pub fn min_frame(&self) -> u32 {
        self.indices.min
    }

    pub fn restore_frame(&self) -> u32 {
        self.indices.restore
    }

    pub fn command_frame(&self) -> u32 {
        self.indices.command
    }

    /// Number of records and moves waiting for the next merge, excluding recorder wheels.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Registers a new producer handle for recording from another thread.
    pub fn recorder(&mut self) -> Recorder {
        let wheel = Arc::new(RecordWheel::new());
        self.recorders.push(Arc::clone(&wheel));
        Recorder::new(wheel)
    }

    /// Queues `entry` for `frame_index`. Takes effect at the next [`test`](Self::test).
    pub fn record(&mut self, frame_index: u32, mut entry: Entry) {
        entry.frame_index = frame_index;
        let entry_index = self.entries.len();
        self.entries.push(entry);
        self.pending.push(PendingOp::Record(FrameEntryKey {
            frame_index,
            entry_index,
        }));
    }

    /// Queues a relocation of `key`. `from == 0` inserts only, `to == 0` removes only.
    pub fn move_entry(&mut self, key: i64, from: u32, to: u32) {
        self.pending.push(PendingOp::Move { key, from, to });
    }

    /// Runs the init, hit-test and command phases and returns the updated indices.
    ///
    /// `min_restore_requested` asks for `restore` to be no earlier than that frame; 0 means
    /// no request.
    pub fn test<T: EntryTester + ?Sized>(
        &mut self,
        tester: &T,
        min_restore_requested: u32,
    ) -> FrameIndices {
        let candidates = self.merge_pending();
        let restore = self.hit_test(tester, &candidates);
        self.command_pass(restore, min_restore_requested);
        debug_assert!(
            self.indices.is_ordered(self.upper - 1),
            "ledger indices out of order: {:?} (upper {})",
            self.indices,
            self.upper
        );
        self.indices
    }

    /// Confirms every frame up to `real_frame`: nothing below `real_frame + 1` needs replay.
    pub fn advance(&mut self, real_frame: u32) {
        let next = real_frame + 1;
        self.upper = next.max(self.indices.min);
        self.indices.restore = self.upper;
        self.indices.command = self.upper;
    }

    /// Retires every frame below `new_min`.
    pub fn clear(&mut self, new_min: u32) {
        if new_min <= self.indices.min {
            return;
        }
        self.indices.min = new_min;
        let kept = self.frames.split_off(&new_min);
        let retired = std::mem::replace(&mut self.frames, kept);
        trace!(
            "ledger retired {} frame slots below frame {new_min}",
            retired.len()
        );
        self.key_frames.retain(|_, frame| *frame >= new_min);
        self.upper = self.upper.max(new_min);
        self.indices.restore = self.indices.restore.max(new_min);
        self.indices.command = self.indices.command.max(new_min);
    }

    /// Entries live at `frame_index`.
    pub fn entries_at(&self, frame_index: u32) -> &[Entry] {
        self.frames
            .get(&frame_index)
            .map(|slot| slot.entries.as_slice())
            .unwrap_or(&[])
    }

    /// Union of the kinds ever merged at `frame_index`, including the restore mark.
    pub fn frame_kind(&self, frame_index: u32) -> RollbackEntryKind {
        self.frames
            .get(&frame_index)
            .map_or(RollbackEntryKind::empty(), |slot| slot.kind)
    }

    /// Frame currently holding the entry for `key`.
    pub fn frame_of(&self, key: i64) -> Option<u32> {
        self.key_frames.get(&key).copied()
    }

    fn merge_pending(&mut self) -> Vec<HitCandidate> {
        let mut remote = Vec::new();
        for wheel in &self.recorders {
            wheel.drain_into(&mut remote);
        }

        let mut pending = Vec::with_capacity(remote.len() + self.pending.len());
        for op in remote {
            match op {
                LedgerOp::Record { frame_index, entry } => {
                    let entry_index = self.entries.len();
                    self.entries.push(entry);
                    pending.push(PendingOp::Record(FrameEntryKey {
                        frame_index,
                        entry_index,
                    }));
                }
                LedgerOp::Move { key, from, to } => pending.push(PendingOp::Move { key, from, to }),
            }
        }
        pending.append(&mut self.pending);
        let entries = std::mem::take(&mut self.entries);

        let mut merge = Merge {
            touched: u32::MAX,
            candidates: Vec::with_capacity(pending.len()),
        };
        for op in pending {
            match op {
                PendingOp::Record(key) => {
                    self.insert(key.frame_index, entries[key.entry_index], &mut merge);
                }
                PendingOp::Move { key, from, to } => self.resolve_move(key, from, to, &mut merge),
            }
        }

        if merge.touched < self.indices.command {
            self.indices.command = merge.touched;
        }
        merge.candidates
    }

    fn insert(&mut self, frame_index: u32, mut entry: Entry, merge: &mut Merge) -> bool {
        if frame_index == 0 || frame_index < self.indices.min {
            warn!(
                "dropping entry key {} for frame {frame_index}: frames below {} are retired",
                entry.key, self.indices.min
            );
            return false;
        }
        entry.frame_index = frame_index;
        self.detached.remove(&entry.key);

        if let Some(previous) = self.key_frames.insert(entry.key, frame_index) {
            let evicted = self
                .frames
                .get_mut(&previous)
                .and_then(|slot| slot.take(entry.key));
            if let Some(old) = evicted {
                if previous != frame_index {
                    merge.touch(previous, &old, false);
                }
            }
        }

        let slot = self.frames.entry(frame_index).or_default();
        slot.kind |= entry.kind;
        slot.entries.push(entry);
        merge.touch(
            frame_index,
            &entry,
            entry.kind.contains(RollbackEntryKind::RESTORE),
        );
        true
    }

    fn detach(&mut self, key: i64, frame_index: u32, merge: &mut Merge) -> Option<Entry> {
        if self.key_frames.get(&key) != Some(&frame_index) {
            return None;
        }
        let entry = self.frames.get_mut(&frame_index)?.take(key)?;
        self.key_frames.remove(&key);
        merge.touch(frame_index, &entry, false);
        Some(entry)
    }

    fn resolve_move(&mut self, key: i64, from: u32, to: u32, merge: &mut Merge) {
        let entry = if from == 0 {
            match self.key_frames.get(&key).copied() {
                Some(live) => self.detach(key, live, merge),
                None => self.detached.remove(&key),
            }
        } else {
            self.detach(key, from, merge)
        };

        let Some(entry) = entry else {
            error!("move of key {key} from frame {from} to frame {to}: no entry found at frame {from}");
            return;
        };

        if to == 0 {
            self.detached.insert(key, entry);
        } else {
            self.insert(to, entry, merge);
        }
    }

    fn hit_test<T: EntryTester + ?Sized>(&self, tester: &T, candidates: &[HitCandidate]) -> u32 {
        let min = self.indices.min;
        let restore = AtomicU32::new(self.indices.restore);

        candidates
            .par_iter()
            .with_min_len(self.innerloop_batch_count)
            .for_each(|hit| {
                let start = hit.frame_index.max(min);
                if hit.forced {
                    restore.fetch_min(start, AcqRel);
                    return;
                }
                let mut frame = start;
                while frame < restore.load(Acquire) {
                    if tester.test(frame, hit.entity) {
                        restore.fetch_min(frame, AcqRel);
                        break;
                    }
                    frame += 1;
                }
            });

        restore.into_inner()
    }

    fn command_pass(&mut self, restore: u32, min_restore_requested: u32) {
        let min = self.indices.min;
        let mut restore = restore.max(min);

        if min_restore_requested > restore {
            let target = min_restore_requested.min(self.upper);
            let blocking = self
                .frames
                .range(restore..target)
                .find(|(_, slot)| slot.kind.contains(RollbackEntryKind::LOCAL))
                .map(|(&frame, _)| frame);
            match blocking {
                Some(local) => {
                    warn!(
                        "restore requested from frame {min_restore_requested} but a local entry at frame {local} blocks it; restoring from {local} instead of {restore}"
                    );
                    restore = local;
                }
                None => restore = restore.max(target),
            }
        }

        self.frames.entry(restore).or_default().kind |= RollbackEntryKind::RESTORE;

        let mut first = restore;
        while first > min {
            match self.frames.get(&(first - 1)) {
                Some(slot) if !slot.kind.contains(RollbackEntryKind::RESTORE) => first -= 1,
                _ => break,
            }
        }

        self.indices.restore = restore;
        self.indices.command = self.indices.command.min(first).max(min);
    }
}
