//! Deterministic rollback and resimulation primitives for frame-stepped simulations.
//!
//! A simulation advances optimistically, learns later that a command belonged to a frame
//! already played, rewinds to the earliest affected frame and replays forward. Four pieces
//! cooperate to make that possible:
//! - [`ledger::CommandLedger`] tracks which frame each command targets and computes the
//!   earliest frame that must be restored.
//! - [`batch::BatchStore`] groups command batches by frame and merges late and early
//!   contributions into one applyable batch.
//! - [`snapshot::SnapshotStore`] saves per-entity state for every live frame, restores it on
//!   rewind and compacts history that leaves the retention window.
//! - [`sync::FrameSync`] sequences the three once per tick.
use thiserror::Error;

pub mod batch;
pub mod config;
pub mod frame;
pub mod ledger;
pub mod snapshot;
pub mod sync;
pub mod world;

#[cfg(test)]
pub(crate) mod test_utils;

pub use batch::{Batch, BatchHandle, BatchStore, CommandBackend};
pub use config::{RollbackConfig, WindowPolicy};
pub use frame::{FrameCounter, FrameIndices};
pub use ledger::{CommandLedger, Entry, EntryTester, Recorder, RollbackEntryKind};
pub use snapshot::{BufferSnapshots, ComponentSnapshots, EntityCorrelation, SnapshotStore};
pub use sync::{FrameSync, FrameTarget, Simulation, TickReport};
pub use world::{BufferStore, ComponentStore, Entity, EntityStore};

/// Error type for all rollback primitives
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetraceError {
    #[error("Null pointer found, must have written as null")]
    ExpectedUpdate,
    #[error("Nothing to read, no pending updates")]
    NoPendingUpdates,
    #[error("Buffer full, cannot write until read")]
    BuffersFull,
    #[error("No snapshot saved for frame {frame}")]
    FrameNotSaved { frame: u32 },
    #[error("Batch handle {0} is not allocated")]
    UnknownBatch(usize),
    #[error("Invalid rollback configuration: {reason}")]
    InvalidConfig { reason: String },
}
