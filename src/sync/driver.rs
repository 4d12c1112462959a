use hashbrown::HashMap;
use log::{debug, trace, warn};

use crate::batch::{Batch, BatchHandle, BatchStore};
use crate::config::{RollbackConfig, WindowPolicy};
use crate::frame::FrameCounter;
use crate::ledger::{CommandLedger, Entry, EntryTester, Recorder};
use crate::snapshot::SnapshotStore;
use crate::world::EntityStore;
use crate::RetraceError;

use super::{FrameTarget, Simulation, TickReport};

/// The frame-sync loop.
///
/// Saves are taken at the start of a frame, before its batch is applied, so the snapshot of
/// frame `f` is exactly the state a replay of `f` starts from. Saved frames always span
/// `min_save_frame..=max_save_frame`, and the ledger's minimum tracks `min_save_frame`.
#[derive(Debug)]
pub struct FrameSync<W, C> {
    config: RollbackConfig,
    counter: FrameCounter,
    ledger: CommandLedger,
    batches: BatchStore<C>,
    snapshots: SnapshotStore<W>,
    min_save_frame: u32,
    max_save_frame: u32,
    min_restore_request: u32,
    target: FrameTarget,
    /// Batch scheduled under each ledger key, and the frame it applies at.
    keyed: HashMap<i64, (u32, BatchHandle)>,
    /// Batches whose key was moved to no frame.
    parked: HashMap<i64, BatchHandle>,
}

impl<W: EntityStore, C: Clone> FrameSync<W, C> {
    pub fn new(config: RollbackConfig) -> Result<Self, RetraceError> {
        config.validate()?;
        Ok(Self {
            counter: FrameCounter::new(),
            ledger: CommandLedger::new(config.innerloop_batch_count),
            batches: BatchStore::new(),
            snapshots: SnapshotStore::new(config.innerloop_batch_count),
            min_save_frame: 1,
            max_save_frame: 0,
            min_restore_request: 0,
            target: FrameTarget::new(),
            keyed: HashMap::new(),
            parked: HashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    pub fn counter(&self) -> FrameCounter {
        self.counter
    }

    pub fn frame(&self) -> u32 {
        self.counter.frame
    }

    pub fn real_frame(&self) -> u32 {
        self.counter.real_frame
    }

    pub fn min_save_frame(&self) -> u32 {
        self.min_save_frame
    }

    pub fn max_save_frame(&self) -> u32 {
        self.max_save_frame
    }

    pub fn ledger(&self) -> &CommandLedger {
        &self.ledger
    }

    /// Direct ledger access. Entries recorded or moved here carry no batch; use
    /// [`schedule`](Self::schedule) and [`move_entry`](Self::move_entry) to keep both in step.
    pub fn ledger_mut(&mut self) -> &mut CommandLedger {
        &mut self.ledger
    }

    pub fn batches(&self) -> &BatchStore<C> {
        &self.batches
    }

    pub fn batches_mut(&mut self) -> &mut BatchStore<C> {
        &mut self.batches
    }

    pub fn snapshots(&self) -> &SnapshotStore<W> {
        &self.snapshots
    }

    /// Register tracked types here before the first update.
    pub fn snapshots_mut(&mut self) -> &mut SnapshotStore<W> {
        &mut self.snapshots
    }

    /// Shared handle to the frame target, for raising it from another thread.
    pub fn target_handle(&self) -> FrameTarget {
        self.target.clone()
    }

    /// Producer handle for recording ledger entries from another thread.
    pub fn recorder(&mut self) -> Recorder {
        self.ledger.recorder()
    }

    pub fn alloc_batch(&mut self) -> BatchHandle {
        self.batches.alloc()
    }

    pub fn batch_mut(&mut self, handle: BatchHandle) -> Option<&mut Batch<C>> {
        self.batches.batch_mut(handle)
    }

    /// Hands `handle` to `frame` and records `entry` for it in the ledger.
    ///
    /// Frames already retired are refused. Frames past `real_frame + max_frame_count` follow
    /// the configured [`WindowPolicy`]. A refused batch is freed. Returns the frame the
    /// batch was scheduled for.
    pub fn schedule(
        &mut self,
        frame: u32,
        handle: BatchHandle,
        entry: Entry,
    ) -> Result<Option<u32>, RetraceError> {
        let min = self.ledger.min_frame();
        if frame < min {
            warn!(
                "refusing batch for frame {frame} (key {}): frames below {min} are retired",
                entry.key
            );
            self.batches.free(handle)?;
            return Ok(None);
        }

        let limit = self
            .counter
            .real_frame
            .saturating_add(self.config.max_frame_count);
        let frame = if frame > limit {
            match self.config.window_policy {
                WindowPolicy::Discard => {
                    warn!(
                        "discarding batch for frame {frame} (key {}): beyond window edge {limit}",
                        entry.key
                    );
                    self.batches.free(handle)?;
                    return Ok(None);
                }
                WindowPolicy::Clamp => {
                    warn!(
                        "clamping batch for frame {frame} (key {}) to window edge {limit}",
                        entry.key
                    );
                    limit
                }
            }
        } else {
            frame
        };

        self.batches.append(frame, handle)?;
        self.supersede(entry.key);
        self.keyed.insert(entry.key, (frame, handle));
        self.ledger.record(frame, entry);
        Ok(Some(frame))
    }

    /// Relocates the entry and batch of `key` from `from` to `to`.
    ///
    /// `from == 0` takes the key from wherever it lives, or from the parked set. `to == 0`
    /// parks the batch until a later move gives it a frame again. A key not found at `from`
    /// leaves both untouched. Returns whether the batch moved.
    pub fn move_entry(&mut self, key: i64, from: u32, to: u32) -> Result<bool, RetraceError> {
        let handle = match self.keyed.get(&key).copied() {
            Some((live, handle)) if from == 0 || from == live => {
                self.batches.withdraw(live, handle);
                self.keyed.remove(&key);
                Some(handle)
            }
            None if from == 0 => self.parked.remove(&key),
            _ => None,
        };
        self.ledger.move_entry(key, from, to);

        let Some(handle) = handle else {
            warn!("move of key {key} from frame {from} to frame {to}: no batch at frame {from}");
            return Ok(false);
        };
        if to == 0 {
            self.parked.insert(key, handle);
        } else if to < self.ledger.min_frame() {
            warn!("dropping batch of key {key}: frame {to} is retired");
            self.batches.free(handle)?;
        } else {
            self.batches.append(to, handle)?;
            self.keyed.insert(key, (to, handle));
        }
        Ok(true)
    }

    fn supersede(&mut self, key: i64) {
        if let Some((frame, handle)) = self.keyed.remove(&key) {
            trace!("key {key}: cancelling superseded batch at frame {frame}");
            self.batches.cancel(frame, handle);
        }
        if let Some(handle) = self.parked.remove(&key) {
            let freed = self.batches.free(handle);
            debug_assert!(freed.is_ok());
        }
    }

    /// Asks the next update not to restore earlier than `frame`.
    pub fn request_min_restore(&mut self, frame: u32) {
        self.min_restore_request = self.min_restore_request.max(frame);
    }

    /// Snapshot checksum of `frame`, if it is still saved.
    pub fn checksum(&self, frame: u32) -> Option<u64> {
        self.snapshots.checksum(frame)
    }

    /// Runs one tick: a ledger pass, then either forward saving or a restore and replay,
    /// until the target frame (at least `real_frame + frame_count`) has been played.
    pub fn update<S, T>(
        &mut self,
        sim: &mut S,
        tester: &T,
        frame_count: u32,
    ) -> Result<TickReport, RetraceError>
    where
        S: Simulation<C, World = W>,
        T: EntryTester + ?Sized,
    {
        let request = std::mem::take(&mut self.min_restore_request);
        let indices = self.ledger.test(tester, request);
        self.counter.restore_frame = indices.restore;
        let real_before = self.counter.real_frame;
        let mut report = TickReport {
            indices,
            ..Default::default()
        };

        self.target
            .request(real_before.saturating_add(frame_count));

        if indices.restore <= self.max_save_frame {
            let restore = indices.restore;
            self.snapshots.restore(restore, sim.world_mut())?;
            let stale = self.max_save_frame - restore;
            if stale > 0 {
                self.snapshots
                    .clear(self.max_save_frame, restore + 1, stale);
            }
            debug!(
                "rolling back from frame {} to frame {restore}, dropped {stale} stale snapshots",
                self.counter.frame
            );
            // Init-only operations land on the restored state, so the snapshot of `restore`
            // has to be taken again to hold them.
            if self.catch_up(sim, indices.command, restore, &mut report) > 0 {
                self.snapshots.save(restore, sim.world());
            }
            self.max_save_frame = restore;
            self.counter.rewind(restore);
            self.play(sim, restore, &mut report);
            report.restored_from = Some(restore);
            report.replayed += 1;
        } else {
            let end = indices.restore.min(real_before + 1);
            self.catch_up(sim, indices.command, end, &mut report);
        }

        loop {
            let frame = self.counter.frame + 1;
            if frame > self.target.get() {
                break;
            }
            self.save(sim.world(), frame, &mut report);
            self.play(sim, frame, &mut report);
            if frame <= real_before {
                report.replayed += 1;
            } else {
                report.advanced += 1;
            }
        }

        self.ledger.advance(self.counter.real_frame);
        trace!("tick done at frame {}: {report}", self.counter.frame);
        Ok(report)
    }

    /// Applies the init-only operations of the played frames `start..end` the hit test
    /// cleared. Returns how many frames had one take effect.
    fn catch_up<S>(&mut self, sim: &mut S, start: u32, end: u32, report: &mut TickReport) -> u32
    where
        S: Simulation<C, World = W>,
    {
        let mut applied = 0;
        for frame in start..end {
            if self.batches.apply(frame, true, sim) {
                applied += 1;
            }
        }
        report.init_applied += applied;
        applied
    }

    fn play<S>(&mut self, sim: &mut S, frame: u32, report: &mut TickReport)
    where
        S: Simulation<C, World = W>,
    {
        if self.batches.apply(frame, false, sim) {
            report.batches_applied += 1;
        }
        sim.step(frame);
        self.counter.play(frame);
    }

    fn save(&mut self, world: &W, frame: u32, report: &mut TickReport) {
        self.snapshots.save(frame, world);
        self.max_save_frame = frame;

        let window = self.config.max_frame_count;
        if frame - self.min_save_frame < window {
            return;
        }
        let new_min = frame + 1 - window;
        let count = new_min - self.min_save_frame;
        self.snapshots.clear(frame, self.min_save_frame, count);
        self.batches.clear_range(self.min_save_frame, count);
        self.keyed.retain(|_, (frame, _)| *frame >= new_min);
        self.ledger.clear(new_min);
        trace!(
            "retired frames {}..{new_min} from the retention window",
            self.min_save_frame
        );
        self.min_save_frame = new_min;
        report.retired += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AlwaysHit, NeverHit, RollbackEntryKind};
    use crate::test_utils::{DriverSim, MemoryWorld, Position, SimCommand};
    use crate::world::Entity;

    fn driver(config: RollbackConfig) -> FrameSync<MemoryWorld, SimCommand> {
        let mut sync = FrameSync::new(config).unwrap();
        sync.snapshots_mut()
            .track_component::<Position>()
            .track_buffer::<u16>();
        sync
    }

    fn fixture() -> (DriverSim, Entity) {
        let mut world = MemoryWorld::new();
        let entity = world.spawn(Position { x: 1, y: 0 });
        world.set_path(entity, &[0]);
        world.spawn(Position { x: -2, y: 7 });
        (DriverSim::new(world), entity)
    }

    fn nudge(
        sync: &mut FrameSync<MemoryWorld, SimCommand>,
        frame: u32,
        entity: Entity,
        dx: i32,
        kind: RollbackEntryKind,
        key: i64,
    ) -> Option<u32> {
        let handle = sync.alloc_batch();
        sync.batch_mut(handle)
            .unwrap()
            .push(SimCommand::Nudge { entity, dx });
        sync.schedule(frame, handle, Entry::new(kind, key, entity))
            .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let err = FrameSync::<MemoryWorld, SimCommand>::new(RollbackConfig::new(0)).unwrap_err();
        assert!(matches!(err, RetraceError::InvalidConfig { .. }));
    }

    #[test]
    fn steady_ticks_save_every_frame() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, _) = fixture();

        for tick in 1..=3 {
            let report = sync.update(&mut sim, &NeverHit, 1).unwrap();
            assert_eq!(report.advanced, 1);
            assert!(!report.rolled_back());
            assert_eq!(sync.real_frame(), tick);
        }
        assert_eq!(sync.snapshots().saved_frames(), &[1, 2, 3]);
        assert_eq!(sync.max_save_frame(), 3);
        assert_eq!(sim.stepped, vec![1, 2, 3]);

        let report = sync.update(&mut sim, &NeverHit, 0).unwrap();
        assert_eq!(report, TickReport {
            indices: report.indices,
            ..Default::default()
        });
        assert_eq!(sim.stepped.len(), 3);
    }

    #[test]
    fn late_command_matches_on_time_delivery() {
        let mut on_time = driver(RollbackConfig::default());
        let (mut on_time_sim, entity) = fixture();
        on_time.update(&mut on_time_sim, &AlwaysHit, 2).unwrap();
        nudge(&mut on_time, 5, entity, 3, RollbackEntryKind::INIT, 1);
        let report = on_time.update(&mut on_time_sim, &AlwaysHit, 6).unwrap();
        assert!(!report.rolled_back());
        assert_eq!(report.advanced, 6);

        let mut late = driver(RollbackConfig::default());
        let (mut late_sim, entity) = fixture();
        late.update(&mut late_sim, &AlwaysHit, 8).unwrap();
        assert_ne!(late_sim.world, on_time_sim.world);

        assert_eq!(
            nudge(&mut late, 5, entity, 3, RollbackEntryKind::INIT, 1),
            Some(5)
        );
        let report = late.update(&mut late_sim, &AlwaysHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(5));
        assert_eq!(report.replayed, 4);
        assert_eq!(report.advanced, 0);
        assert_eq!(report.indices.restore, 5);
        assert_eq!(&late_sim.stepped[8..], &[5, 6, 7, 8]);

        assert_eq!(late_sim.world, on_time_sim.world);
        assert_eq!(late.real_frame(), 8);
        for frame in 1..=8 {
            assert_eq!(late.checksum(frame), on_time.checksum(frame));
        }
    }

    #[test]
    fn target_raised_mid_replay_extends_it() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        sync.update(&mut sim, &AlwaysHit, 8).unwrap();

        nudge(&mut sync, 5, entity, 1, RollbackEntryKind::INIT, 1);
        sim.raise_at = Some((6, sync.target_handle(), 10));
        let report = sync.update(&mut sim, &AlwaysHit, 0).unwrap();

        assert_eq!(report.restored_from, Some(5));
        assert_eq!(report.replayed, 4);
        assert_eq!(report.advanced, 2);
        assert_eq!(sync.real_frame(), 10);
        assert_eq!(&sim.stepped[8..], &[5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn min_restore_request_and_local_block() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        sync.update(&mut sim, &NeverHit, 8).unwrap();

        nudge(&mut sync, 3, entity, 1, RollbackEntryKind::RESTORE, 1);
        sync.request_min_restore(6);
        let report = sync.update(&mut sim, &NeverHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(6));
        assert_eq!(report.replayed, 3);

        nudge(&mut sync, 3, entity, 1, RollbackEntryKind::RESTORE, 2);
        nudge(&mut sync, 4, entity, 1, RollbackEntryKind::LOCAL, 3);
        sync.request_min_restore(6);
        let report = sync.update(&mut sim, &NeverHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(4));
        assert_eq!(report.replayed, 5);
    }

    #[test]
    fn cleared_frames_only_apply_init_operations() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        sync.update(&mut sim, &NeverHit, 6).unwrap();
        let before = sim.world.position(entity).unwrap();

        let handle = sync.alloc_batch();
        {
            let batch = sync.batch_mut(handle).unwrap();
            batch.push_init(SimCommand::Nudge { entity, dx: 5 });
            batch.push(SimCommand::Nudge { entity, dx: 100 });
        }
        sync.schedule(3, handle, Entry::new(RollbackEntryKind::INIT, 9, entity))
            .unwrap();

        let report = sync.update(&mut sim, &NeverHit, 0).unwrap();
        assert!(!report.rolled_back());
        assert_eq!(report.indices.command, 3);
        assert_eq!(report.indices.restore, 7);
        assert_eq!(report.init_applied, 1);
        assert_eq!(
            sim.world.position(entity),
            Some(Position {
                x: before.x + 5,
                y: before.y
            })
        );
    }

    #[test]
    fn init_operations_survive_a_rollback_in_the_same_tick() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        sync.update(&mut sim, &NeverHit, 8).unwrap();

        let handle = sync.alloc_batch();
        sync.batch_mut(handle)
            .unwrap()
            .push_init(SimCommand::Nudge { entity, dx: 5 });
        sync.schedule(3, handle, Entry::new(RollbackEntryKind::INIT, 1, entity))
            .unwrap();
        nudge(&mut sync, 5, entity, 0, RollbackEntryKind::RESTORE, 2);

        let report = sync.update(&mut sim, &NeverHit, 0).unwrap();
        assert_eq!(report.indices.command, 3);
        assert_eq!(report.restored_from, Some(5));
        assert_eq!(report.init_applied, 1);
        assert_eq!(report.replayed, 4);
        assert_eq!(sim.world.position(entity).unwrap().x, 6);

        // Rolling back to the same frame again starts from the state holding the init op.
        let world = sim.world.clone();
        nudge(&mut sync, 5, entity, 0, RollbackEntryKind::RESTORE, 3);
        let report = sync.update(&mut sim, &NeverHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(5));
        assert_eq!(report.init_applied, 0);
        assert_eq!(sim.world, world);
    }

    #[test]
    fn rescheduled_key_replaces_its_batch() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        nudge(&mut sync, 5, entity, 3, RollbackEntryKind::INIT, 7);
        nudge(&mut sync, 5, entity, 4, RollbackEntryKind::INIT, 7);
        assert_eq!(sync.batches().contributions(5), 1);

        let report = sync.update(&mut sim, &NeverHit, 5).unwrap();
        assert_eq!(report.batches_applied, 1);
        assert_eq!(sync.ledger().entries_at(5).len(), 1);
        assert_eq!(sim.world.position(entity).unwrap().x, 5);

        nudge(&mut sync, 4, entity, 4, RollbackEntryKind::INIT, 7);
        assert!(!sync.batches().contains(5));
        let report = sync.update(&mut sim, &AlwaysHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(4));
        assert!(sync.ledger().entries_at(5).is_empty());
        assert_eq!(sim.world.position(entity).unwrap().x, 5);
    }

    #[test]
    fn moved_entry_takes_its_batch_along() {
        let mut on_time = driver(RollbackConfig::default());
        let (mut on_time_sim, entity) = fixture();
        nudge(&mut on_time, 3, entity, 2, RollbackEntryKind::INIT, 7);
        on_time.update(&mut on_time_sim, &AlwaysHit, 8).unwrap();

        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        nudge(&mut sync, 6, entity, 2, RollbackEntryKind::INIT, 7);
        sync.update(&mut sim, &AlwaysHit, 8).unwrap();
        assert_ne!(sim.world, on_time_sim.world);

        assert_eq!(sync.move_entry(7, 6, 3), Ok(true));
        assert_eq!(sync.batches().contributions(6), 0);
        assert_eq!(sync.batches().contributions(3), 1);
        let report = sync.update(&mut sim, &AlwaysHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(3));
        assert_eq!(sync.ledger().frame_of(7), Some(3));
        assert_eq!(sim.world, on_time_sim.world);

        assert_eq!(sync.move_entry(7, 5, 4), Ok(false));
        assert_eq!(sync.batches().contributions(3), 1);

        assert_eq!(sync.move_entry(7, 3, 0), Ok(true));
        assert!(!sync.batches().contains(3));
        sync.update(&mut sim, &AlwaysHit, 0).unwrap();
        assert_eq!(sim.world.position(entity).unwrap().x, 1);

        assert_eq!(sync.move_entry(7, 0, 3), Ok(true));
        let report = sync.update(&mut sim, &AlwaysHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(3));
        assert_eq!(sim.world, on_time_sim.world);
    }

    #[test]
    fn retention_window_retires_old_frames() {
        let mut sync = driver(RollbackConfig::new(4));
        let (mut sim, entity) = fixture();

        let mut retired = 0;
        for _ in 0..10 {
            let report = sync.update(&mut sim, &AlwaysHit, 1).unwrap();
            retired += report.retired;
            let real = sync.real_frame();
            assert!(sync.ledger().indices().is_ordered(real));
            assert!(report.indices.is_ordered(real - 1));
        }
        assert_eq!(retired, 6);
        assert_eq!(sync.snapshots().saved_frames(), &[7, 8, 9, 10]);
        assert_eq!(sync.min_save_frame(), 7);
        assert_eq!(sync.ledger().min_frame(), 7);

        let live = sync.batches().pool().live();
        assert_eq!(nudge(&mut sync, 6, entity, 1, RollbackEntryKind::INIT, 1), None);
        assert_eq!(sync.batches().pool().live(), live);

        assert_eq!(nudge(&mut sync, 7, entity, 1, RollbackEntryKind::INIT, 2), Some(7));
        let report = sync.update(&mut sim, &AlwaysHit, 0).unwrap();
        assert_eq!(report.restored_from, Some(7));
        assert_eq!(report.replayed, 4);
    }

    #[test]
    fn window_policy_for_far_future_frames() {
        let mut discard = driver(RollbackConfig::new(4));
        let (mut sim, entity) = fixture();
        discard.update(&mut sim, &NeverHit, 2).unwrap();
        assert_eq!(nudge(&mut discard, 20, entity, 1, RollbackEntryKind::INIT, 1), None);
        assert_eq!(nudge(&mut discard, 6, entity, 1, RollbackEntryKind::INIT, 2), Some(6));

        let mut clamp = driver(RollbackConfig::new(4).with_window_policy(WindowPolicy::Clamp));
        let (mut sim, entity) = fixture();
        clamp.update(&mut sim, &NeverHit, 2).unwrap();
        assert_eq!(nudge(&mut clamp, 20, entity, 7, RollbackEntryKind::INIT, 1), Some(6));
        assert_eq!(clamp.batches().contributions(6), 1);

        let x = sim.world.position(entity).unwrap().x;
        clamp.update(&mut sim, &NeverHit, 4).unwrap();
        assert_eq!(sim.world.position(entity).unwrap().x, x + 7);
    }

    #[test]
    fn restore_cursor_climbs_back_to_real_frame() {
        let mut sync = driver(RollbackConfig::default());
        let (mut sim, entity) = fixture();
        sync.update(&mut sim, &AlwaysHit, 12).unwrap();

        nudge(&mut sync, 4, entity, -1, RollbackEntryKind::INIT, 1);
        let report = sync.update(&mut sim, &AlwaysHit, 1).unwrap();
        assert_eq!(report.restored_from, Some(4));
        assert_eq!(report.replayed, 9);
        assert_eq!(report.advanced, 1);

        let replay = &sim.stepped[12..];
        assert!(replay.windows(2).all(|pair| pair[1] == pair[0] + 1));
        assert_eq!(replay.first(), Some(&4));
        assert_eq!(replay.last(), Some(&13));
        assert_eq!(sync.snapshots().saved_frames().len(), 13);
    }
}
