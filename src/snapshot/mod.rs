//! Per-frame snapshots of entity state.
//!
//! Each tracked type gets its own track: fixed-size components through
//! [`ComponentSnapshots`], variable-length buffers through [`BufferSnapshots`]. Both keep
//! one flat [`ChunkLog`] per frame range, so saving appends, restoring copies one chunk back
//! out and retiring old frames compacts the log in a single pass.
use hashbrown::HashSet;
use log::debug;

use crate::config::DEFAULT_INNERLOOP_BATCH_COUNT;
use crate::world::{BufferStore, ComponentStore, Entity, EntityStore};
use crate::RetraceError;

pub mod buffer;
pub mod chunk;
pub mod component;

pub use buffer::{BufferSlot, BufferSnapshots};
pub use chunk::{ChunkLog, RollbackChunk};
pub use component::ComponentSnapshots;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Folds `data` into a running FNV-1a hash.
pub(crate) fn fnv1a(mut hash: u64, data: &[u8]) -> u64 {
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Live entities of the store at the moment a restore starts.
///
/// Built once per restore and shared by every track, so liveness is never re-derived per
/// entity and per type.
#[derive(Debug, Clone, Default)]
pub struct EntityCorrelation {
    live: HashSet<Entity>,
}

impl EntityCorrelation {
    pub fn build<W: EntityStore>(world: &W) -> Self {
        let mut live = HashSet::new();
        world.for_each_live_entity(|entity| {
            live.insert(entity);
        });
        Self { live }
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.live.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// One tracked type's snapshot history.
pub trait RollbackSnapshot<W> {
    /// Human-readable name of the tracked type, for logs.
    fn name(&self) -> &'static str;

    /// Saves the state of every entity holding this type as `frame`.
    fn save(&mut self, frame: u32, world: &W, innerloop_batch_count: usize);

    /// Writes `frame`'s saved values back onto every entity still live. Returns how many
    /// entities were written.
    fn restore(
        &self,
        frame: u32,
        world: &mut W,
        correlation: &EntityCorrelation,
    ) -> Result<usize, RetraceError>;

    /// Drops `[frame, frame + frame_count)` (capped at `max_frame`) and compacts.
    fn clear(&mut self, max_frame: u32, frame: u32, frame_count: u32) -> usize;

    fn contains(&self, frame: u32) -> bool;

    /// FNV-1a hash of `frame`'s saved bytes.
    fn checksum(&self, frame: u32) -> Option<u64>;
}

/// Every tracked type's history, saved and restored together.
pub struct SnapshotStore<W> {
    tracks: Vec<Box<dyn RollbackSnapshot<W>>>,
    saved: Vec<u32>,
    innerloop_batch_count: usize,
}

impl<W> std::fmt::Debug for SnapshotStore<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("saved", &self.saved)
            .field("innerloop_batch_count", &self.innerloop_batch_count)
            .finish()
    }
}

impl<W: EntityStore> Default for SnapshotStore<W> {
    fn default() -> Self {
        Self::new(DEFAULT_INNERLOOP_BATCH_COUNT)
    }
}

impl<W: EntityStore> SnapshotStore<W> {
    pub fn new(innerloop_batch_count: usize) -> Self {
        Self {
            tracks: Vec::new(),
            saved: Vec::new(),
            innerloop_batch_count: innerloop_batch_count.max(1),
        }
    }

    /// Starts snapshotting component `T`. Frames saved earlier hold no values for it.
    pub fn track_component<T>(&mut self) -> &mut Self
    where
        T: bytemuck::Pod,
        W: ComponentStore<T>,
    {
        self.tracks.push(Box::new(ComponentSnapshots::<T>::new()));
        self
    }

    /// Starts snapshotting buffers of `T`.
    pub fn track_buffer<T>(&mut self) -> &mut Self
    where
        T: bytemuck::Pod + Send + Sync,
        W: BufferStore<T> + Sync,
    {
        self.tracks.push(Box::new(BufferSnapshots::<T>::new()));
        self
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Saves every track as `frame`. Saves for `frame` or later frames are replaced.
    pub fn save(&mut self, frame: u32, world: &W) {
        let keep = self.saved.partition_point(|f| *f < frame);
        self.saved.truncate(keep);
        for track in &mut self.tracks {
            track.save(frame, world, self.innerloop_batch_count);
        }
        self.saved.push(frame);
    }

    /// Writes `frame`'s snapshot back onto `world`. Returns how many entity values were
    /// written across all tracks.
    pub fn restore(&self, frame: u32, world: &mut W) -> Result<usize, RetraceError> {
        if !self.contains(frame) {
            return Err(RetraceError::FrameNotSaved { frame });
        }
        let correlation = EntityCorrelation::build(&*world);
        let mut written = 0;
        for track in &self.tracks {
            written += track.restore(frame, world, &correlation)?;
        }
        debug!(
            "restored frame {frame}: {written} values over {} live entities",
            correlation.len()
        );
        Ok(written)
    }

    /// Retires `[frame, frame + frame_count)`, capped at `max_frame`, from every track.
    pub fn clear(&mut self, max_frame: u32, frame: u32, frame_count: u32) -> usize {
        let end = frame
            .saturating_add(frame_count)
            .min(max_frame.saturating_add(1));
        self.saved.retain(|f| *f < frame || *f >= end);
        self.tracks
            .iter_mut()
            .map(|track| track.clear(max_frame, frame, frame_count))
            .sum()
    }

    pub fn contains(&self, frame: u32) -> bool {
        self.saved.binary_search(&frame).is_ok()
    }

    pub fn saved_frames(&self) -> &[u32] {
        &self.saved
    }

    /// Combined hash of every track's snapshot of `frame`.
    pub fn checksum(&self, frame: u32) -> Option<u64> {
        if !self.contains(frame) {
            return None;
        }
        Some(self.tracks.iter().fold(FNV_OFFSET_BASIS, |hash, track| {
            let track_hash = track.checksum(frame).unwrap_or(FNV_OFFSET_BASIS);
            fnv1a(hash, &track_hash.to_le_bytes())
        }))
    }
}
