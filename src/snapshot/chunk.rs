//! Flat, frame-chunked backing storage shared by every snapshot track.
//!
//! Values for all retained frames live in one `Vec`; each frame owns one contiguous run of
//! it, described by a [`RollbackChunk`]. Frames are appended in increasing order and retired
//! oldest first, so a clear only ever has to close a single gap.
use std::ops::Range;

use bytemuck::Zeroable;
use log::trace;

/// A frame's run inside the backing array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackChunk {
    pub start_index: usize,
    pub count: usize,
}

impl RollbackChunk {
    pub fn end(&self) -> usize {
        self.start_index + self.count
    }

    pub fn range(&self) -> Range<usize> {
        self.start_index..self.end()
    }
}

/// Backing array plus the frame → chunk map, kept sorted by frame.
#[derive(Debug, Clone)]
pub struct ChunkLog<T> {
    values: Vec<T>,
    chunks: Vec<(u32, RollbackChunk)>,
}

impl<T> Default for ChunkLog<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            chunks: Vec::new(),
        }
    }
}

impl<T: Copy> ChunkLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one frame's values. Chunks at or after `frame` are stale and dropped first.
    pub fn push_frame<I>(&mut self, frame: u32, values: I) -> RollbackChunk
    where
        I: IntoIterator<Item = T>,
    {
        self.truncate_from(frame);
        let start_index = self.values.len();
        self.values.extend(values);
        let chunk = RollbackChunk {
            start_index,
            count: self.values.len() - start_index,
        };
        self.chunks.push((frame, chunk));
        chunk
    }

    /// Reserves `count` zeroed values for `frame` and hands them back for filling in place.
    pub fn push_zeroed(&mut self, frame: u32, count: usize) -> &mut [T]
    where
        T: Zeroable,
    {
        self.truncate_from(frame);
        let start_index = self.values.len();
        self.values.resize(start_index + count, T::zeroed());
        self.chunks.push((frame, RollbackChunk { start_index, count }));
        &mut self.values[start_index..]
    }

    /// Drops every chunk for `frame` and later, and the values behind them.
    pub fn truncate_from(&mut self, frame: u32) {
        let keep = self.chunks.partition_point(|(f, _)| *f < frame);
        if keep == self.chunks.len() {
            return;
        }
        let cut = self.chunks[keep].1.start_index;
        self.chunks.truncate(keep);
        self.values.truncate(cut);
        debug_assert!(self.is_contiguous());
    }

    pub fn chunk(&self, frame: u32) -> Option<RollbackChunk> {
        self.chunks
            .binary_search_by_key(&frame, |(f, _)| *f)
            .ok()
            .map(|idx| self.chunks[idx].1)
    }

    pub fn get(&self, frame: u32) -> Option<&[T]> {
        self.chunk(frame).map(|chunk| &self.values[chunk.range()])
    }

    pub fn contains(&self, frame: u32) -> bool {
        self.chunk(frame).is_some()
    }

    /// Values at absolute backing indices, as returned by lookups like `index_of`.
    pub fn value(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }

    pub fn frames(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks.iter().map(|(frame, _)| *frame)
    }

    pub fn chunks(&self) -> &[(u32, RollbackChunk)] {
        &self.chunks
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn first_frame(&self) -> Option<u32> {
        self.chunks.first().map(|(frame, _)| *frame)
    }

    pub fn last_frame(&self) -> Option<u32> {
        self.chunks.last().map(|(frame, _)| *frame)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Removes the chunks of `[frame, frame + frame_count)` that are not above `max_frame`,
    /// then compacts: the values above the removed span move down over it and every later
    /// chunk's start shifts by the span's length. Returns how many values were removed.
    pub fn clear(&mut self, max_frame: u32, frame: u32, frame_count: u32) -> usize {
        let end = frame
            .saturating_add(frame_count)
            .min(max_frame.saturating_add(1));
        let lo = self.chunks.partition_point(|(f, _)| *f < frame);
        let hi = self.chunks.partition_point(|(f, _)| *f < end);
        if lo >= hi {
            return 0;
        }

        let span = self.chunks[lo].1.start_index..self.chunks[hi - 1].1.end();
        let removed = span.len();
        self.values.drain(span);
        for (_, chunk) in &mut self.chunks[hi..] {
            chunk.start_index -= removed;
        }
        self.chunks.drain(lo..hi);
        trace!("cleared frames {frame}..{end}, compacted {removed} values");

        debug_assert!(self.is_contiguous());
        removed
    }

    /// Chunks tile the backing array from index 0 with no gaps or overlaps.
    fn is_contiguous(&self) -> bool {
        let mut expected = 0;
        for (_, chunk) in &self.chunks {
            if chunk.start_index != expected {
                return false;
            }
            expected = chunk.end();
        }
        expected == self.values.len()
    }
}
