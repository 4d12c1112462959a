//! Rollback configuration
//!
//! Provides configuration types and constants for the frame-sync driver.

use crate::RetraceError;

/// Default retention window (how many trailing frames stay restorable)
pub const DEFAULT_MAX_FRAME_COUNT: u32 = 256;

/// Default granularity hint for parallel loops over entries and entities
pub const DEFAULT_INNERLOOP_BATCH_COUNT: usize = 32;

/// What to do with a schedule whose target frame lies past the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowPolicy {
    /// Drop the command and log it.
    #[default]
    Discard,
    /// Move the command to the last frame inside the window and log it.
    Clamp,
}

/// Settings for creating a [`FrameSync`](crate::sync::FrameSync) driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackConfig {
    /// Number of trailing frames kept before snapshots and batches are cleared
    pub max_frame_count: u32,
    /// Minimum number of items handed to one parallel task; does not affect results
    pub innerloop_batch_count: usize,
    /// Handling of schedules beyond `real_frame + max_frame_count`
    pub window_policy: WindowPolicy,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_frame_count: DEFAULT_MAX_FRAME_COUNT,
            innerloop_batch_count: DEFAULT_INNERLOOP_BATCH_COUNT,
            window_policy: WindowPolicy::default(),
        }
    }
}

impl RollbackConfig {
    /// Create config with a specific retention window
    pub fn new(max_frame_count: u32) -> Self {
        Self {
            max_frame_count,
            ..Default::default()
        }
    }

    /// Set the parallel chunking hint
    pub fn with_innerloop_batch_count(mut self, innerloop_batch_count: usize) -> Self {
        self.innerloop_batch_count = innerloop_batch_count;
        self
    }

    /// Set the out-of-window schedule policy
    pub fn with_window_policy(mut self, window_policy: WindowPolicy) -> Self {
        self.window_policy = window_policy;
        self
    }

    /// Check the settings before a driver is built from them.
    pub fn validate(&self) -> Result<(), RetraceError> {
        if self.max_frame_count == 0 {
            return Err(RetraceError::InvalidConfig {
                reason: "max_frame_count must be greater than 0".to_string(),
            });
        }
        if self.innerloop_batch_count == 0 {
            return Err(RetraceError::InvalidConfig {
                reason: "innerloop_batch_count must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}
