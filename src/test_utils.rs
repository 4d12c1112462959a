//! Shared test fixtures: an in-memory entity store and a small deterministic simulation.
use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};

use crate::batch::{Batch, CommandBackend};
use crate::sync::{FrameTarget, Simulation};
use crate::world::{BufferStore, ComponentStore, Entity, EntityStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// Entities with an optional `Position` component and an optional `u16` path buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryWorld {
    alive: Vec<bool>,
    positions: BTreeMap<Entity, Position>,
    paths: BTreeMap<Entity, Vec<u16>>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, position: Position) -> Entity {
        let entity = Entity::new(self.alive.len() as u32, 0);
        self.alive.push(true);
        self.positions.insert(entity, position);
        entity
    }

    pub fn despawn(&mut self, entity: Entity) {
        if let Some(alive) = self.alive.get_mut(entity.index as usize) {
            *alive = false;
        }
        self.positions.remove(&entity);
        self.paths.remove(&entity);
    }

    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        self.for_each_live_entity(|entity| entities.push(entity));
        entities
    }

    pub fn position(&self, entity: Entity) -> Option<Position> {
        self.positions.get(&entity).copied()
    }

    pub fn set_position(&mut self, entity: Entity, position: Position) {
        self.positions.insert(entity, position);
    }

    pub fn remove_position(&mut self, entity: Entity) {
        self.positions.remove(&entity);
    }

    pub fn path(&self, entity: Entity) -> Option<&[u16]> {
        self.paths.get(&entity).map(Vec::as_slice)
    }

    pub fn set_path(&mut self, entity: Entity, path: &[u16]) {
        self.paths.insert(entity, path.to_vec());
    }
}

impl EntityStore for MemoryWorld {
    fn for_each_live_entity<F: FnMut(Entity)>(&self, mut f: F) {
        for (index, alive) in self.alive.iter().enumerate() {
            if *alive {
                f(Entity::new(index as u32, 0));
            }
        }
    }

    fn contains(&self, entity: Entity) -> bool {
        entity.version == 0 && self.alive.get(entity.index as usize).copied().unwrap_or(false)
    }
}

impl ComponentStore<Position> for MemoryWorld {
    fn has_component(&self, entity: Entity) -> bool {
        self.positions.contains_key(&entity)
    }

    fn get_component(&self, entity: Entity) -> Option<Position> {
        self.position(entity)
    }

    fn set_component(&mut self, entity: Entity, value: Position) {
        self.set_position(entity, value);
    }
}

impl BufferStore<u16> for MemoryWorld {
    fn has_buffer(&self, entity: Entity) -> bool {
        self.paths.contains_key(&entity)
    }

    fn buffer(&self, entity: Entity) -> Option<&[u16]> {
        self.path(entity)
    }

    fn set_buffer(&mut self, entity: Entity, values: &[u16]) {
        self.set_path(entity, values);
    }
}

/// Commands understood by [`DriverSim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    /// Adds `dx` to the entity's x.
    Nudge { entity: Entity, dx: i32 },
    /// Overwrites the entity's position.
    Place { entity: Entity, position: Position },
}

/// Each step adds x to y for every positioned entity and appends the new y (last four kept)
/// to its path, if it has one.
#[derive(Debug, Default)]
pub struct DriverSim {
    pub world: MemoryWorld,
    pub stepped: Vec<u32>,
    /// When stepping the first frame, raise the target to the second.
    pub raise_at: Option<(u32, FrameTarget, u32)>,
}

impl DriverSim {
    pub fn new(world: MemoryWorld) -> Self {
        Self {
            world,
            ..Default::default()
        }
    }
}

impl CommandBackend<SimCommand> for DriverSim {
    fn apply(&mut self, _frame: u32, batch: &Batch<SimCommand>, init_only: bool) -> bool {
        let mut applied = false;
        for command in batch.commands(init_only) {
            match *command {
                SimCommand::Nudge { entity, dx } => {
                    if let Some(mut position) = self.world.position(entity) {
                        position.x += dx;
                        self.world.set_position(entity, position);
                        applied = true;
                    }
                }
                SimCommand::Place { entity, position } => {
                    if self.world.contains(entity) {
                        self.world.set_position(entity, position);
                        applied = true;
                    }
                }
            }
        }
        applied
    }
}

impl Simulation<SimCommand> for DriverSim {
    type World = MemoryWorld;

    fn world(&self) -> &MemoryWorld {
        &self.world
    }

    fn world_mut(&mut self) -> &mut MemoryWorld {
        &mut self.world
    }

    fn step(&mut self, frame: u32) {
        for entity in self.world.entities() {
            let Some(mut position) = self.world.position(entity) else {
                continue;
            };
            position.y += position.x;
            self.world.set_position(entity, position);
            if let Some(path) = self.world.path(entity) {
                let mut path = path.to_vec();
                path.push(position.y as u16);
                if path.len() > 4 {
                    path.remove(0);
                }
                self.world.set_path(entity, &path);
            }
        }
        self.stepped.push(frame);

        if let Some((at, target, to)) = &self.raise_at {
            if *at == frame {
                target.request(*to);
            }
        }
    }
}
