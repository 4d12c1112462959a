use bytemuck::Pod;

use crate::world::{ComponentStore, Entity};
use crate::RetraceError;

use super::chunk::ChunkLog;
use super::{fnv1a, EntityCorrelation, RollbackSnapshot, FNV_OFFSET_BASIS};

/// Snapshot history of a fixed-size component: one `(entity, value)` pair per holder per frame.
#[derive(Debug, Clone)]
pub struct ComponentSnapshots<T: Pod> {
    log: ChunkLog<(Entity, T)>,
    scratch: Vec<(Entity, T)>,
}

impl<T: Pod> Default for ComponentSnapshots<T> {
    fn default() -> Self {
        Self {
            log: ChunkLog::new(),
            scratch: Vec::new(),
        }
    }
}

impl<T: Pod> ComponentSnapshots<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &ChunkLog<(Entity, T)> {
        &self.log
    }

    /// Backing index of `entity`'s value in `frame`. Scans the frame's chunk.
    pub fn index_of(&self, frame: u32, entity: Entity) -> Option<usize> {
        let chunk = self.log.chunk(frame)?;
        self.log.values()[chunk.range()]
            .iter()
            .position(|(e, _)| *e == entity)
            .map(|offset| chunk.start_index + offset)
    }

    pub fn value_at(&self, frame: u32, entity: Entity) -> Option<T> {
        let index = self.index_of(frame, entity)?;
        self.log.value(index).map(|(_, value)| *value)
    }
}

impl<T, W> RollbackSnapshot<W> for ComponentSnapshots<T>
where
    T: Pod,
    W: ComponentStore<T>,
{
    fn name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn save(&mut self, frame: u32, world: &W, _innerloop_batch_count: usize) {
        let scratch = &mut self.scratch;
        scratch.clear();
        world.for_each_live_entity(|entity| {
            if !world.has_component(entity) {
                return;
            }
            if let Some(value) = world.get_component(entity) {
                scratch.push((entity, value));
            }
        });
        self.log.push_frame(frame, self.scratch.drain(..));
    }

    fn restore(
        &self,
        frame: u32,
        world: &mut W,
        correlation: &EntityCorrelation,
    ) -> Result<usize, RetraceError> {
        let values = self
            .log
            .get(frame)
            .ok_or(RetraceError::FrameNotSaved { frame })?;
        let mut written = 0;
        for (entity, value) in values {
            if correlation.contains(*entity) {
                world.set_component(*entity, *value);
                written += 1;
            }
        }
        Ok(written)
    }

    fn clear(&mut self, max_frame: u32, frame: u32, frame_count: u32) -> usize {
        self.log.clear(max_frame, frame, frame_count)
    }

    fn contains(&self, frame: u32) -> bool {
        self.log.contains(frame)
    }

    fn checksum(&self, frame: u32) -> Option<u64> {
        let values = self.log.get(frame)?;
        Some(values.iter().fold(FNV_OFFSET_BASIS, |hash, (entity, value)| {
            let hash = fnv1a(hash, bytemuck::bytes_of(entity));
            fnv1a(hash, bytemuck::bytes_of(value))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryWorld, Position};

    fn saved_world() -> (MemoryWorld, ComponentSnapshots<Position>, Vec<Entity>) {
        let mut world = MemoryWorld::new();
        let entities: Vec<Entity> = (0..4)
            .map(|i| world.spawn(Position { x: i, y: i * 10 }))
            .collect();
        let mut snapshots = ComponentSnapshots::new();
        RollbackSnapshot::<MemoryWorld>::save(&mut snapshots, 1, &world, 1);
        (world, snapshots, entities)
    }

    #[test]
    fn index_of_scans_frame_chunk() {
        let (mut world, mut snapshots, entities) = saved_world();
        world.set_position(entities[2], Position { x: 50, y: 50 });
        RollbackSnapshot::<MemoryWorld>::save(&mut snapshots, 2, &world, 1);

        assert_eq!(snapshots.index_of(1, entities[2]), Some(2));
        assert_eq!(snapshots.index_of(2, entities[2]), Some(6));
        assert_eq!(
            snapshots.value_at(1, entities[2]),
            Some(Position { x: 2, y: 20 })
        );
        assert_eq!(
            snapshots.value_at(2, entities[2]),
            Some(Position { x: 50, y: 50 })
        );
        assert_eq!(snapshots.index_of(3, entities[2]), None);
        assert_eq!(snapshots.index_of(1, Entity::NULL), None);
    }

    #[test]
    fn entities_without_component_are_skipped() {
        let (mut world, _, entities) = saved_world();
        world.remove_position(entities[1]);

        let mut snapshots = ComponentSnapshots::<Position>::new();
        RollbackSnapshot::<MemoryWorld>::save(&mut snapshots, 1, &world, 1);
        assert_eq!(snapshots.log().get(1).unwrap().len(), 3);
        assert_eq!(snapshots.index_of(1, entities[1]), None);
    }

    #[test]
    fn restore_writes_saved_values() {
        let (mut world, snapshots, entities) = saved_world();
        for entity in &entities {
            world.set_position(*entity, Position { x: -1, y: -1 });
        }
        let correlation = EntityCorrelation::build(&world);
        let written = snapshots.restore(1, &mut world, &correlation).unwrap();
        assert_eq!(written, 4);
        assert_eq!(world.position(entities[3]), Some(Position { x: 3, y: 30 }));
    }
}
