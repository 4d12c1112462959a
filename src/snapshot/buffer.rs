use bytemuck::Pod;
use rayon::prelude::*;

use crate::world::{BufferStore, Entity};
use crate::RetraceError;

use super::chunk::ChunkLog;
use super::{fnv1a, EntityCorrelation, RollbackSnapshot, FNV_OFFSET_BASIS};

/// Where one entity's buffer sits inside its frame's element chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlot {
    pub entity: Entity,
    /// Relative to the start of the frame's element chunk.
    pub offset: usize,
    pub len: usize,
}

/// Snapshot history of variable-length buffers.
///
/// Two logs advance in lockstep: `slots` holds one [`BufferSlot`] per entity and frame,
/// `elements` holds the buffer contents back to back. Saving sizes the frame's element
/// chunk once from a prefix sum over buffer lengths, then copies every buffer into its own
/// disjoint slice in parallel.
#[derive(Debug, Clone)]
pub struct BufferSnapshots<T> {
    slots: ChunkLog<BufferSlot>,
    elements: ChunkLog<T>,
    lengths: Vec<(Entity, usize)>,
}

impl<T: Pod> Default for BufferSnapshots<T> {
    fn default() -> Self {
        Self {
            slots: ChunkLog::new(),
            elements: ChunkLog::new(),
            lengths: Vec::new(),
        }
    }
}

impl<T: Pod + Send + Sync> BufferSnapshots<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backing index of `entity`'s slot in `frame`. Scans the frame's chunk.
    pub fn index_of(&self, frame: u32, entity: Entity) -> Option<usize> {
        let chunk = self.slots.chunk(frame)?;
        self.slots.values()[chunk.range()]
            .iter()
            .position(|slot| slot.entity == entity)
            .map(|offset| chunk.start_index + offset)
    }

    /// `entity`'s buffer as saved in `frame`.
    pub fn buffer_at(&self, frame: u32, entity: Entity) -> Option<&[T]> {
        let slot = self.slots.value(self.index_of(frame, entity)?)?;
        let elements = self.elements.get(frame)?;
        elements.get(slot.offset..slot.offset + slot.len)
    }

    pub fn element_count(&self) -> usize {
        self.elements.values().len()
    }

    fn slot_pairs(&self, frame: u32) -> Option<(&[BufferSlot], &[T])> {
        Some((self.slots.get(frame)?, self.elements.get(frame)?))
    }
}

impl<T, W> RollbackSnapshot<W> for BufferSnapshots<T>
where
    T: Pod + Send + Sync,
    W: BufferStore<T> + Sync,
{
    fn name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn save(&mut self, frame: u32, world: &W, innerloop_batch_count: usize) {
        let lengths = &mut self.lengths;
        lengths.clear();
        world.for_each_live_entity(|entity| {
            if world.has_buffer(entity) {
                lengths.push((entity, 0));
            }
        });
        self.lengths
            .par_iter_mut()
            .with_min_len(innerloop_batch_count)
            .for_each(|(entity, len)| *len = world.buffer_len(*entity));

        let mut total = 0;
        let slots = self.lengths.iter().map(|(entity, len)| {
            let slot = BufferSlot {
                entity: *entity,
                offset: total,
                len: *len,
            };
            total += len;
            slot
        });
        let chunk = self.slots.push_frame(frame, slots);

        let dst = self.elements.push_zeroed(frame, total);
        let slots = &self.slots.values()[chunk.range()];
        let mut parts = Vec::with_capacity(slots.len());
        let mut rest = dst;
        for slot in slots {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(slot.len);
            parts.push((slot.entity, head));
            rest = tail;
        }

        parts
            .into_par_iter()
            .with_min_len(innerloop_batch_count)
            .for_each(|(entity, dst)| {
                if let Some(src) = world.buffer(entity) {
                    let n = dst.len().min(src.len());
                    dst[..n].copy_from_slice(&src[..n]);
                }
            });
    }

    fn restore(
        &self,
        frame: u32,
        world: &mut W,
        correlation: &EntityCorrelation,
    ) -> Result<usize, RetraceError> {
        let (slots, elements) = self
            .slot_pairs(frame)
            .ok_or(RetraceError::FrameNotSaved { frame })?;
        let mut written = 0;
        for slot in slots {
            if correlation.contains(slot.entity) {
                world.set_buffer(slot.entity, &elements[slot.offset..slot.offset + slot.len]);
                written += 1;
            }
        }
        Ok(written)
    }

    fn clear(&mut self, max_frame: u32, frame: u32, frame_count: u32) -> usize {
        self.slots.clear(max_frame, frame, frame_count);
        self.elements.clear(max_frame, frame, frame_count)
    }

    fn contains(&self, frame: u32) -> bool {
        self.slots.contains(frame)
    }

    fn checksum(&self, frame: u32) -> Option<u64> {
        let (slots, elements) = self.slot_pairs(frame)?;
        let hash = slots.iter().fold(FNV_OFFSET_BASIS, |hash, slot| {
            let hash = fnv1a(hash, bytemuck::bytes_of(&slot.entity));
            fnv1a(hash, &(slot.len as u64).to_le_bytes())
        });
        Some(fnv1a(hash, bytemuck::cast_slice(elements)))
    }
}
