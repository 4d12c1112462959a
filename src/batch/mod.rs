//! Frame-scoped command batches.
//!
//! Independently produced batches register against the frame they target. The first time a
//! frame is played its contributions are merged, ordered by `(priority, arrival)`, into one
//! pooled batch that is cached against the frame; replays of that frame re-apply the cached
//! merge instead of merging again. Any later append or cancel on the frame drops the cache.
use std::collections::BTreeMap;

use log::trace;

use crate::RetraceError;

pub mod pool;

pub use pool::{Batch, BatchHandle, BatchPool};

/// Applies a batch to the live store.
///
/// Re-applying a batch to a state restored from the same snapshot must give the same
/// result, since replayed frames apply their batch again.
pub trait CommandBackend<C> {
    /// Returns whether any operation took effect.
    fn apply(&mut self, frame: u32, batch: &Batch<C>, init_only: bool) -> bool;
}

impl<C, F> CommandBackend<C> for F
where
    F: FnMut(u32, &Batch<C>, bool) -> bool,
{
    fn apply(&mut self, frame: u32, batch: &Batch<C>, init_only: bool) -> bool {
        self(frame, batch, init_only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Contribution {
    handle: BatchHandle,
    priority: i32,
    seq: u64,
}

#[derive(Debug, Default)]
struct FrameBatches {
    contributions: Vec<Contribution>,
    merged: Option<BatchHandle>,
}

/// Pool of batches plus the frame → contributions map.
#[derive(Debug)]
pub struct BatchStore<C> {
    pool: BatchPool<C>,
    frames: BTreeMap<u32, FrameBatches>,
    seq: u64,
}

impl<C: Clone> Default for BatchStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone> BatchStore<C> {
    pub fn new() -> Self {
        Self {
            pool: BatchPool::new(),
            frames: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn pool(&self) -> &BatchPool<C> {
        &self.pool
    }

    /// Hands out an empty batch, recycled when possible.
    pub fn alloc(&mut self) -> BatchHandle {
        self.pool.alloc()
    }

    /// Returns a batch that was never appended to a frame.
    pub fn free(&mut self, handle: BatchHandle) -> Result<(), RetraceError> {
        self.pool.free(handle)
    }

    pub fn batch(&self, handle: BatchHandle) -> Option<&Batch<C>> {
        self.pool.get(handle)
    }

    pub fn batch_mut(&mut self, handle: BatchHandle) -> Option<&mut Batch<C>> {
        self.pool.get_mut(handle)
    }

    /// Registers `handle` as a contribution to `frame`. The store owns it from now on.
    pub fn append(&mut self, frame: u32, handle: BatchHandle) -> Result<(), RetraceError> {
        self.append_with_priority(frame, handle, 0)
    }

    /// Like [`append`](Self::append); lower priorities merge first, ties keep arrival order.
    pub fn append_with_priority(
        &mut self,
        frame: u32,
        handle: BatchHandle,
        priority: i32,
    ) -> Result<(), RetraceError> {
        if !self.pool.is_live(handle) {
            return Err(RetraceError::UnknownBatch(handle.index()));
        }
        let seq = self.seq;
        self.seq += 1;

        let slot = self.frames.entry(frame).or_default();
        debug_assert!(
            slot.contributions.iter().all(|c| c.handle != handle),
            "batch {} appended twice to frame {frame}",
            handle.index()
        );
        slot.contributions.push(Contribution {
            handle,
            priority,
            seq,
        });
        Self::invalidate(&mut self.pool, slot, frame);
        Ok(())
    }

    /// Withdraws one contribution from `frame` and frees it.
    pub fn cancel(&mut self, frame: u32, handle: BatchHandle) -> bool {
        if !self.withdraw(frame, handle) {
            return false;
        }
        let freed = self.pool.free(handle);
        debug_assert!(freed.is_ok());
        true
    }

    /// Withdraws one contribution from `frame` but keeps it allocated, so it can be appended
    /// to another frame.
    pub fn withdraw(&mut self, frame: u32, handle: BatchHandle) -> bool {
        let Some(slot) = self.frames.get_mut(&frame) else {
            return false;
        };
        let Some(idx) = slot.contributions.iter().position(|c| c.handle == handle) else {
            return false;
        };
        slot.contributions.remove(idx);
        Self::invalidate(&mut self.pool, slot, frame);
        if slot.contributions.is_empty() {
            self.frames.remove(&frame);
        }
        true
    }

    /// Applies the merged batch for `frame`, merging first if this is the frame's first play.
    /// Returns whether any operation took effect.
    pub fn apply<B>(&mut self, frame: u32, init_only: bool, backend: &mut B) -> bool
    where
        B: CommandBackend<C> + ?Sized,
    {
        let Some(slot) = self.frames.get_mut(&frame) else {
            return false;
        };

        let merged = match slot.merged {
            Some(merged) => merged,
            None => {
                if slot.contributions.is_empty() {
                    return false;
                }
                slot.contributions.sort_by_key(|c| (c.priority, c.seq));
                let sources: Vec<BatchHandle> =
                    slot.contributions.iter().map(|c| c.handle).collect();
                let merged = self.pool.alloc();
                self.pool.merge_into(merged, &sources);
                trace!(
                    "merged {} batches for frame {frame} into batch {}",
                    sources.len(),
                    merged.index()
                );
                slot.merged = Some(merged);
                merged
            }
        };

        match self.pool.get(merged) {
            Some(batch) if batch.commands(init_only).next().is_some() => {
                backend.apply(frame, batch, init_only)
            }
            _ => false,
        }
    }

    /// Cached merge for `frame`, if it has been played since its last change.
    pub fn merged(&self, frame: u32) -> Option<&Batch<C>> {
        let merged = self.frames.get(&frame)?.merged?;
        self.pool.get(merged)
    }

    pub fn contributions(&self, frame: u32) -> usize {
        self.frames
            .get(&frame)
            .map_or(0, |slot| slot.contributions.len())
    }

    pub fn contains(&self, frame: u32) -> bool {
        self.frames.contains_key(&frame)
    }

    /// Frees every batch of `frame`. Returns how many batches were freed.
    pub fn clear_frame(&mut self, frame: u32) -> usize {
        match self.frames.remove(&frame) {
            Some(slot) => self.release(slot),
            None => 0,
        }
    }

    /// Frees every batch of frames `start..start + count`.
    pub fn clear_range(&mut self, start: u32, count: u32) -> usize {
        let end = start.saturating_add(count);
        if count == 0 {
            return 0;
        }
        let tail = self.frames.split_off(&end);
        let cleared = self.frames.split_off(&start);
        self.frames.extend(tail);
        cleared.into_values().map(|slot| self.release(slot)).sum()
    }

    fn release(&mut self, slot: FrameBatches) -> usize {
        let handles = slot
            .contributions
            .iter()
            .map(|c| c.handle)
            .chain(slot.merged);
        let mut freed = 0;
        for handle in handles {
            let result = self.pool.free(handle);
            debug_assert!(result.is_ok(), "batch {} freed twice", handle.index());
            freed += usize::from(result.is_ok());
        }
        freed
    }

    fn invalidate(pool: &mut BatchPool<C>, slot: &mut FrameBatches, frame: u32) {
        if let Some(merged) = slot.merged.take() {
            trace!("dropping cached merge for frame {frame}");
            let result = pool.free(merged);
            debug_assert!(result.is_ok());
        }
    }
}
