//! Lock-free hand-off of ledger records from producer threads.
//!
//! Each producer owns one `Recorder`, backed by a single-producer, single-consumer
//! `RecordWheel`. The ledger is the only consumer: it drains every registered wheel at the
//! start of its next merge, so recording never takes a lock.

use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::Arc;

use crate::world::Entity;
use crate::RetraceError;

use super::entry::{Entry, LedgerOp, RollbackEntryKind};

/// Slots per recorder wheel. One slot always stays empty, so a wheel holds `N - 1` ops.
pub const RECORD_WHEEL_SLOTS: usize = 1024;

/// A fixed-size circular buffer for one producer and one consumer.
#[derive(Debug)]
pub struct RecordWheel<const N: usize, T> {
    buffers: [AtomicPtr<T>; N],
    read: AtomicUsize,
    write: AtomicUsize,
}

impl<const N: usize, T> Default for RecordWheel<N, T> {
    fn default() -> Self {
        RecordWheel::new()
    }
}

impl<const N: usize, T> RecordWheel<N, T> {
    pub fn new() -> Self {
        let buffers = array_init::array_init(|_| AtomicPtr::new(ptr::null_mut()));
        Self {
            buffers,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        }
    }

    fn after(index: usize) -> usize {
        (index + 1) % N
    }

    /// Moves `data` into the next free slot, or fails without consuming it when full.
    pub fn write(&self, data: T) -> Result<(), RetraceError> {
        let at = self.write.load(Relaxed);
        let next = Self::after(at);
        if next == self.read.load(Acquire) {
            return Err(RetraceError::BuffersFull);
        }

        let stale = self.buffers[at].swap(Box::into_raw(Box::new(data)), Release);
        debug_assert!(stale.is_null(), "record slot {at} still held an unread op");
        self.write.store(next, Release);
        Ok(())
    }

    /// Takes the oldest unread item.
    pub fn read(&self) -> Result<T, RetraceError> {
        let at = self.read.load(Relaxed);
        if at == self.write.load(Acquire) {
            return Err(RetraceError::NoPendingUpdates);
        }

        let taken = self.buffers[at].swap(ptr::null_mut(), Acquire);
        if taken.is_null() {
            return Err(RetraceError::ExpectedUpdate);
        }
        self.read.store(Self::after(at), Release);
        // The slot held the only pointer to a box leaked by `write`.
        Ok(*unsafe { Box::from_raw(taken) })
    }

    pub fn is_empty(&self) -> bool {
        self.read.load(Acquire) == self.write.load(Acquire)
    }

    /// Reads until the wheel is empty.
    pub fn drain_into(&self, out: &mut Vec<T>) {
        while let Ok(data) = self.read() {
            out.push(data);
        }
    }
}

impl<const N: usize, T> Drop for RecordWheel<N, T> {
    fn drop(&mut self) {
        for slot in &mut self.buffers {
            let leftover = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !leftover.is_null() {
                unsafe {
                    drop(Box::from_raw(leftover));
                }
            }
        }
    }
}

unsafe impl<const N: usize, T: Send> Send for RecordWheel<N, T> {}
unsafe impl<const N: usize, T: Send> Sync for RecordWheel<N, T> {}

/// Producer handle for recording into a [`CommandLedger`](super::CommandLedger) from
/// another thread. Obtained from [`CommandLedger::recorder`](super::CommandLedger::recorder).
#[derive(Debug)]
pub struct Recorder {
    wheel: Arc<RecordWheel<RECORD_WHEEL_SLOTS, LedgerOp>>,
}

impl Recorder {
    pub(crate) fn new(wheel: Arc<RecordWheel<RECORD_WHEEL_SLOTS, LedgerOp>>) -> Self {
        Self { wheel }
    }

    /// Queues `entry` for `frame_index`. Fails only when the wheel is full.
    pub fn record(&self, frame_index: u32, mut entry: Entry) -> Result<(), RetraceError> {
        entry.frame_index = frame_index;
        self.wheel.write(LedgerOp::Record { frame_index, entry })
    }

    /// Shorthand for recording a fresh entry.
    pub fn record_new(
        &self,
        frame_index: u32,
        kind: RollbackEntryKind,
        key: i64,
        entity: Entity,
    ) -> Result<(), RetraceError> {
        self.record(frame_index, Entry::new(kind, key, entity))
    }

    /// Queues a relocation of `key` from `from` to `to` (0 on either side means none).
    pub fn move_entry(&self, key: i64, from: u32, to: u32) -> Result<(), RetraceError> {
        self.wheel.write(LedgerOp::Move { key, from, to })
    }
}
