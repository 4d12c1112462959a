use crate::world::Entity;

/// Decides whether `entity` actually changed at `frame_index`.
///
/// Called from the parallel hit-test phase, so implementations must be free of side
/// effects and safe to share between threads.
pub trait EntryTester: Sync {
    fn test(&self, frame_index: u32, entity: Entity) -> bool;
}

impl<F> EntryTester for F
where
    F: Fn(u32, Entity) -> bool + Sync,
{
    fn test(&self, frame_index: u32, entity: Entity) -> bool {
        self(frame_index, entity)
    }
}

/// Tester that reports every frame as affected.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHit;

impl EntryTester for AlwaysHit {
    fn test(&self, _frame_index: u32, _entity: Entity) -> bool {
        true
    }
}

/// Tester that never reports a change; only forced entries restore.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverHit;

impl EntryTester for NeverHit {
    fn test(&self, _frame_index: u32, _entity: Entity) -> bool {
        false
    }
}
