//! The entity/component store the engine snapshots and restores.
//!
//! Storage itself lives outside this crate; snapshots reach it only through these traits.

use bytemuck::{Pod, Zeroable};

/// Generational reference to one entity of the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Entity {
    pub index: u32,
    pub version: u32,
}

impl Entity {
    pub const NULL: Entity = Entity {
        index: u32::MAX,
        version: 0,
    };

    pub fn new(index: u32, version: u32) -> Self {
        Self { index, version }
    }

    /// Packs index and version into one word (index in the low half).
    pub fn to_bits(self) -> u64 {
        (self.version as u64) << 32 | self.index as u64
    }
}

/// Enumeration and liveness of entities.
pub trait EntityStore {
    fn for_each_live_entity<F: FnMut(Entity)>(&self, f: F);
    fn contains(&self, entity: Entity) -> bool;
}

/// Fixed-size component values of type `T`.
pub trait ComponentStore<T>: EntityStore {
    fn has_component(&self, entity: Entity) -> bool;
    fn get_component(&self, entity: Entity) -> Option<T>;
    fn set_component(&mut self, entity: Entity, value: T);
}

/// Variable-length buffers of `T` attached to entities.
pub trait BufferStore<T>: EntityStore {
    fn has_buffer(&self, entity: Entity) -> bool;
    fn buffer(&self, entity: Entity) -> Option<&[T]>;
    fn set_buffer(&mut self, entity: Entity, values: &[T]);

    fn buffer_len(&self, entity: Entity) -> usize {
        self.buffer(entity).map_or(0, <[T]>::len)
    }
}
