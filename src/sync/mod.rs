//! Per-tick sequencing of ledger, batches and snapshots.
//!
//! [`FrameSync`] runs once per tick: a ledger pass finds the earliest frame to redo, then the
//! driver either keeps saving forward or restores that frame and replays up to the target.
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering::AcqRel, Ordering::Acquire};
use std::sync::Arc;

use crate::batch::CommandBackend;
use crate::frame::FrameIndices;
use crate::world::EntityStore;

pub mod driver;

pub use driver::FrameSync;

/// The application as the driver sees it: a store to snapshot, a way to apply a frame's
/// batch and a deterministic step.
pub trait Simulation<C>: CommandBackend<C> {
    type World: EntityStore;

    fn world(&self) -> &Self::World;
    fn world_mut(&mut self) -> &mut Self::World;

    /// Advances the live state through `frame` after its batch has been applied.
    fn step(&mut self, frame: u32);
}

/// Highest frame the driver should reach, shareable across threads.
///
/// The replay loop re-reads it after every frame, so raising it mid-replay extends the
/// replay instead of restarting it.
#[derive(Debug, Clone, Default)]
pub struct FrameTarget(Arc<AtomicU32>);

impl FrameTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.0.load(Acquire)
    }

    /// Raises the target to at least `frame` and returns the resulting target.
    pub fn request(&self, frame: u32) -> u32 {
        self.0.fetch_max(frame, AcqRel).max(frame)
    }
}

/// What one [`FrameSync::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Ledger indices computed by this tick's pass.
    pub indices: FrameIndices,
    /// Frame restored from, when the tick rolled back.
    pub restored_from: Option<u32>,
    /// Frames below the restore point whose init-only operations were applied.
    pub init_applied: u32,
    /// Frames played whose batch had an operation take effect.
    pub batches_applied: u32,
    /// Frames played again.
    pub replayed: u32,
    /// Frames played for the first time.
    pub advanced: u32,
    /// Frames that left the retention window.
    pub retired: u32,
}

impl TickReport {
    pub fn rolled_back(&self) -> bool {
        self.restored_from.is_some()
    }
}

impl Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.restored_from {
            Some(frame) => write!(
                f,
                "restored from {frame}, replayed {}, advanced {}, retired {}",
                self.replayed, self.advanced, self.retired
            ),
            None => write!(
                f,
                "advanced {}, retired {}",
                self.advanced, self.retired
            ),
        }
    }
}
