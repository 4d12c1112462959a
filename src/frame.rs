//! Frame counters shared by the ledger and the driver.
//!
//! Frames are numbered from 1; frame 0 means "no frame".

/// The driver's three frame cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    /// Last frame played (or replayed) into the live state.
    pub frame: u32,
    /// Earliest frame that must be recomputed, as of the last ledger pass.
    pub restore_frame: u32,
    /// Highest frame ever played.
    pub real_frame: u32,
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCounter {
    pub fn new() -> Self {
        Self {
            frame: 0,
            restore_frame: 1,
            real_frame: 0,
        }
    }

    /// Mark `frame` as played, raising `real_frame` if it is new.
    pub fn play(&mut self, frame: u32) {
        self.frame = frame;
        self.real_frame = self.real_frame.max(frame);
    }

    /// Move the cursor back so the next frame played is `frame`.
    pub fn rewind(&mut self, frame: u32) {
        debug_assert!(frame >= 1 && frame <= self.real_frame + 1);
        self.frame = frame - 1;
    }

    /// True while the cursor is behind the highest frame reached.
    pub fn is_replaying(&self) -> bool {
        self.frame < self.real_frame
    }
}

/// Ledger bookkeeping: oldest retained frame, earliest frame to replay and earliest
/// frame with commands that must be replayed.
///
/// Ordering: `min <= command <= restore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIndices {
    pub min: u32,
    pub restore: u32,
    pub command: u32,
}

impl Default for FrameIndices {
    fn default() -> Self {
        Self {
            min: 1,
            restore: 1,
            command: 1,
        }
    }
}

impl FrameIndices {
    /// Whether the ordering holds, with `restore` bounded by `real_frame + 1`.
    pub fn is_ordered(&self, real_frame: u32) -> bool {
        self.min <= self.command && self.command <= self.restore && self.restore <= real_frame + 1
    }
}
