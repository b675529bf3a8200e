// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The pipelined Ring ORAM front end.
//!
//! Batches are issued from the caller's thread under the engine lock; the
//! physical I/O they schedule runs concurrently on the worker pool, ordered
//! by the dependency graph. A batch's completion fires once the issuing
//! thread has declared it fully scheduled *and* every counted task has
//! finished. The write batch that ends an epoch additionally persists the
//! recovery state before acknowledging, and construction runs the crash
//! recovery protocol before the first batch is accepted.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use rand::rngs::StdRng;

use crate::block::Block;
use crate::engine::{AccessObserver, NullObserver, OpType, RingOramCore};
use crate::mask::{MaskContext, RecoveryCipher};
use crate::processor::AsyncBlockProcessor;
use crate::recover::{ReadPath, WriteAheadLog};
use crate::scheduler::{BatchTracker, Scheduler, WorkerPool};
use crate::store::{
    AsyncBackingStore, ReadCompletion, Signal, WriteCompletion, WriteOp,
};
use crate::{LogicalKey, OramConfig, OramError, PhysicalKey};

/// A Ring ORAM that pipelines each batch's physical I/O through a worker
/// pool. Cheap to clone; all clones drive the same engine.
///
/// Itself an [`AsyncBackingStore`], so a layer above can treat it as an
/// ordinary callback-completing keyed store.
#[derive(Clone)]
pub struct AsyncRingOram {
    shared: Arc<Shared>,
}

struct Shared {
    core: Mutex<RingOramCore>,
    tracker: Arc<BatchTracker>,
    collectors: Mutex<HashMap<u64, Arc<ReadCollector>>>,
    config: OramConfig,
}

/// Gathers the values of one read batch as blocks are found in the stash or
/// their physical reads decrypt.
struct ReadCollector {
    keys: Vec<LogicalKey>,
    values: Mutex<HashMap<LogicalKey, Option<Vec<u8>>>>,
}

impl ReadCollector {
    fn new(keys: Vec<LogicalKey>) -> Self {
        Self {
            values: Mutex::new(HashMap::with_capacity(keys.len())),
            keys,
        }
    }

    fn add(&self, key: LogicalKey, value: Option<Vec<u8>>) {
        self.values.lock().insert(key, value);
    }

    fn finish(&self) -> Vec<Option<Vec<u8>>> {
        let values = self.values.lock();
        self.keys
            .iter()
            .map(|key| {
                values
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| panic!("read batch completed without a value for {key}"))
            })
            .collect()
    }
}

/// Read-batch hooks: decide, per access, whether the value is already in
/// hand or must be routed through the block-read listener when its
/// decryption lands.
struct AsyncReadObserver<'a> {
    collector: &'a Arc<ReadCollector>,
    registry: &'a Mutex<HashMap<u64, Arc<ReadCollector>>>,
}

impl AccessObserver for AsyncReadObserver<'_> {
    fn on_real_block_read(&mut self, block: &Arc<Block>, target_key: LogicalKey, op: OpType) {
        if op == OpType::Read
            && !block.is_dummy
            && !block.is_cached()
            && block.key() == target_key
        {
            // The value arrives with the pipelined physical read.
            self.registry
                .lock()
                .insert(block.id(), Arc::clone(self.collector));
        }
    }

    fn on_access_complete(
        &mut self,
        key: LogicalKey,
        op: OpType,
        stash_block: Option<&Arc<Block>>,
        was_in_tree: bool,
        was_cached: bool,
    ) {
        if op != OpType::Read {
            return;
        }
        let block = match stash_block {
            None => {
                self.collector.add(key, None);
                return;
            }
            Some(block) => block,
        };
        if was_in_tree && !was_cached {
            return; // registered by on_real_block_read
        }
        // The block was already in the stash (or delay-cached). Its value is
        // either present now or still decrypting from an earlier probe; the
        // registry lock arbitrates against the listener.
        let mut registry = self.registry.lock();
        match block.value_clone() {
            Some(value) => {
                drop(registry);
                self.collector.add(key, Some(value));
            }
            None => {
                registry.insert(block.id(), Arc::clone(self.collector));
            }
        }
    }
}

impl Shared {
    /// Routed from the scheduler whenever a real block's value decrypts.
    fn on_block_read(&self, block: &Arc<Block>) {
        if block.is_dummy {
            return;
        }
        let collector = self.collectors.lock().remove(&block.id());
        if let Some(collector) = collector {
            collector.add(block.key(), block.value_clone());
        }
    }

    /// Runs on a worker when a write batch's last task finishes: persist the
    /// epoch if durable, then acknowledge.
    fn finish_write_batch(this: &Arc<Self>, completion: WriteCompletion) {
        let mut core = this.core.lock();
        if core.wal.is_none() {
            drop(core);
            completion();
            return;
        }
        let weak = Arc::downgrade(this);
        let on_marker: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let mut core = shared.core.lock();
                if let Some(wal) = core.wal.as_mut() {
                    wal.finish_epoch();
                }
            }
            completion();
        });
        let core = &mut *core;
        if let Some(wal) = core.wal.as_mut() {
            wal.write_epoch(
                &mut core.position_map,
                &mut core.durable_maps,
                &core.stash,
                core.evict_path_count,
                on_marker,
            );
        }
    }
}

impl AsyncRingOram {
    /// Builds (and, when durability is enabled, recovers) an engine with the
    /// derived tree height.
    pub fn create(
        config: OramConfig,
        store: Arc<dyn AsyncBackingStore>,
        rng: StdRng,
    ) -> Result<Self, OramError> {
        let levels = config.derived_levels();
        Self::create_with_levels(config, levels, store, rng)
    }

    /// Builds an engine over an explicit tree height of `levels + 1` levels.
    pub fn create_with_levels(
        config: OramConfig,
        levels: usize,
        store: Arc<dyn AsyncBackingStore>,
        rng: StdRng,
    ) -> Result<Self, OramError> {
        config.validate()?;
        if config.buffer_sync_ops {
            return Err(OramError::InvalidConfiguration(
                "buffered store ops are a sync-engine optimization",
            ));
        }
        let mask = Arc::new(MaskContext::new(&config)?);
        let cipher = Arc::new(RecoveryCipher::new(&config.client_key)?);
        let pool = Arc::new(WorkerPool::new(config.threads, config.value_size));
        let tracker = Arc::new(BatchTracker::new(Arc::clone(&pool)));

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let listener_weak = weak.clone();
            let listener: Box<dyn Fn(&Arc<Block>) + Send + Sync> = Box::new(move |block| {
                if let Some(shared) = listener_weak.upgrade() {
                    shared.on_block_read(block);
                }
            });
            let scheduler = Scheduler::new(
                Arc::clone(&pool),
                Arc::clone(&store),
                Arc::clone(&mask),
                Arc::clone(&cipher),
                Arc::clone(&tracker),
                listener,
            );
            let processor = AsyncBlockProcessor::new(scheduler);
            let wal = config.durable.then(|| {
                WriteAheadLog::new(
                    Arc::clone(&store),
                    Arc::clone(&cipher),
                    Arc::clone(&pool),
                    &config,
                    levels + 1,
                )
            });
            let core = RingOramCore::new(
                config.clone(),
                levels,
                rng,
                Box::new(processor),
                wal,
            );
            Shared {
                core: Mutex::new(core),
                tracker: Arc::clone(&tracker),
                collectors: Mutex::new(HashMap::new()),
                config,
            }
        });

        let oram = Self { shared };
        oram.recover()?;
        Ok(oram)
    }

    /// Issues one padded read batch. `completion` receives the value of each
    /// requested key (in order) once the whole batch's physical I/O is done.
    pub fn read_batch(
        &self,
        keys: Vec<LogicalKey>,
        completion: ReadCompletion,
    ) -> Result<(), OramError> {
        let collector = Arc::new(ReadCollector::new(keys.clone()));
        let finisher = Arc::clone(&collector);
        self.shared
            .tracker
            .begin_batch(Box::new(move || completion(finisher.finish())));

        let result = {
            let mut core = self.shared.core.lock();
            let mut observer = AsyncReadObserver {
                collector: &collector,
                registry: &self.shared.collectors,
            };
            core.do_read_batch(&keys, &mut observer)
        };
        // On failure the batch is abandoned mid-issue, like a crash; the
        // completion never fires.
        result?;
        self.shared.tracker.metadata_ready();
        Ok(())
    }

    /// Issues one padded write batch; with durability enabled its completion
    /// also marks the epoch durable.
    pub fn write_batch(
        &self,
        writes: Vec<WriteOp>,
        completion: WriteCompletion,
    ) -> Result<(), OramError> {
        let weak = Arc::downgrade(&self.shared);
        self.shared.tracker.begin_batch(Box::new(move || {
            match weak.upgrade() {
                Some(shared) => Shared::finish_write_batch(&shared, completion),
                None => completion(),
            }
        }));

        let result = {
            let mut core = self.shared.core.lock();
            core.do_write_batch(writes, &mut NullObserver)
        };
        result?;
        self.shared.tracker.metadata_ready();
        Ok(())
    }

    /// The number of real blocks currently overflowed into the stash.
    pub fn stash_size(&self) -> usize {
        self.shared.core.lock().stash_size()
    }

    /// Makes the engine fail after the given number of operations into a
    /// batch. Crash tests only.
    pub fn inject_failure_after_batch_ops(&self, ops: usize) {
        self.shared.core.lock().inject_failure_after_batch_ops(ops);
    }

    /// Crash recovery: load the last completed epoch's state and replay the
    /// in-flight epoch's logged read paths, then a write batch, exactly as
    /// live execution would have shaped them.
    fn recover(&self) -> Result<(), OramError> {
        let state = {
            let mut core = self.shared.core.lock();
            match core.wal.as_mut() {
                None => return Ok(()),
                Some(wal) => wal.load_recovery_state()?,
            }
        };
        let Some(mut state) = state else {
            return Ok(());
        };

        let paths = std::mem::take(&mut state.logical_accesses);
        {
            let mut core = self.shared.core.lock();
            core.install_recovered_state(state);
        }

        let config = &self.shared.config;
        let num_strides = (config.total_batch_ops() - config.writes_size) / config.stride_size;
        for stride in 0..num_strides {
            let start = (stride * config.stride_size).min(paths.len());
            let end = ((stride + 1) * config.stride_size).min(paths.len());
            let chunk: Vec<ReadPath> = paths[start..end].to_vec();
            self.run_replay_read_batch(&chunk)?;
        }
        self.run_replay_write_batch()?;

        self.shared.core.lock().clear_changed_trackers();
        log::info!("engine recovered to a consistent state");
        Ok(())
    }

    fn run_replay_read_batch(&self, paths: &[ReadPath]) -> Result<(), OramError> {
        let signal = Arc::new(Signal::new());
        let notify = Arc::clone(&signal);
        self.shared
            .tracker
            .begin_batch(Box::new(move || notify.notify(())));
        {
            let mut core = self.shared.core.lock();
            core.recovery_read_replay(paths, &mut NullObserver)?;
        }
        self.shared.tracker.metadata_ready();
        signal.wait();
        Ok(())
    }

    fn run_replay_write_batch(&self) -> Result<(), OramError> {
        let signal = Arc::new(Signal::new());
        let notify = Arc::clone(&signal);
        let weak = Arc::downgrade(&self.shared);
        // The replayed write batch completes the crashed epoch, persisting a
        // fresh set of recovery state just as a live batch would.
        self.shared.tracker.begin_batch(Box::new(move || {
            match weak.upgrade() {
                Some(shared) => {
                    Shared::finish_write_batch(&shared, Box::new(move || notify.notify(())))
                }
                None => notify.notify(()),
            }
        }));
        {
            let mut core = self.shared.core.lock();
            core.recovery_write_replay(&mut NullObserver)?;
        }
        self.shared.tracker.metadata_ready();
        signal.wait();
        Ok(())
    }
}

impl AsyncBackingStore for AsyncRingOram {
    fn read(&self, key: PhysicalKey, completion: ReadCompletion) {
        self.read_many(vec![key], completion);
    }

    fn read_many(&self, keys: Vec<PhysicalKey>, completion: ReadCompletion) {
        self.read_batch(keys, completion)
            .unwrap_or_else(|err| panic!("read batch failed: {err}"));
    }

    fn write(&self, op: WriteOp, completion: WriteCompletion) {
        self.write_many(vec![op], completion);
    }

    fn write_many(&self, ops: Vec<WriteOp>, completion: WriteCompletion) {
        self.write_batch(ops, completion)
            .unwrap_or_else(|err| panic!("write batch failed: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AsyncOverSync, MemoryStore, SyncBackingStore};
    use crate::test_utils::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn async_config(durable: bool) -> OramConfig {
        OramConfig {
            max_blocks: 32,
            z: 4,
            s: 4,
            a: 4,
            value_size: 32,
            nonce_len: 8,
            write_without_read: true,
            write_end_batch: true,
            pad_batches: true,
            durable,
            durable_max_stash_size: 64,
            durable_max_data_size: 256,
            stride_size: 4,
            writes_size: 4,
            max_nb_stride: 2,
            client_key: vec![9u8; 16],
            threads: 4,
            ..OramConfig::default()
        }
    }

    /// Drives an [`AsyncRingOram`] from sequential test code, surfacing
    /// engine errors (for crash injection) instead of panicking.
    struct BlockingDriver {
        oram: AsyncRingOram,
    }

    impl SyncBackingStore for BlockingDriver {
        fn read(&mut self, key: LogicalKey) -> Result<Option<Vec<u8>>, OramError> {
            Ok(self.read_many(&[key])?.pop().flatten())
        }

        fn read_many(
            &mut self,
            keys: &[LogicalKey],
        ) -> Result<Vec<Option<Vec<u8>>>, OramError> {
            let signal = Arc::new(Signal::new());
            let notify = Arc::clone(&signal);
            self.oram
                .read_batch(keys.to_vec(), Box::new(move |values| notify.notify(values)))?;
            Ok(signal.wait())
        }

        fn write(&mut self, op: WriteOp) -> Result<(), OramError> {
            self.write_many(vec![op])
        }

        fn write_many(&mut self, ops: Vec<WriteOp>) -> Result<(), OramError> {
            let signal = Arc::new(Signal::new());
            let notify = Arc::clone(&signal);
            self.oram
                .write_batch(ops, Box::new(move || notify.notify(())))?;
            signal.wait();
            Ok(())
        }
    }

    fn fresh_engine(config: &OramConfig, store: &Arc<AsyncOverSync<MemoryStore>>) -> BlockingDriver {
        init_logger();
        let oram = AsyncRingOram::create(
            config.clone(),
            Arc::<AsyncOverSync<MemoryStore>>::clone(store) as Arc<dyn AsyncBackingStore>,
            StdRng::from_entropy(),
        )
        .unwrap();
        BlockingDriver { oram }
    }

    #[test]
    fn pipelined_batches_match_a_mirror() {
        let config = async_config(false);
        let store = Arc::new(AsyncOverSync::new(MemoryStore::new()));
        let mut driver = fresh_engine(&config, &store);
        let mut rng = StdRng::seed_from_u64(11);
        let mut mirror = HashMap::new();

        epoch_workload(&mut driver, &config, 24, 6, 0, &mut rng, &mut mirror);
        verify_mirror(&mut driver, &config, &mirror);
        assert!(driver.oram.stash_size() <= config.durable_max_stash_size);
    }

    #[test]
    fn durable_epochs_survive_a_restart() {
        let config = async_config(true);
        let store = Arc::new(AsyncOverSync::new(MemoryStore::new()));
        let mut rng = StdRng::seed_from_u64(12);
        let mut mirror = HashMap::new();

        {
            let mut driver = fresh_engine(&config, &store);
            epoch_workload(&mut driver, &config, 24, 3, 0, &mut rng, &mut mirror);
        }

        // A new engine over the same storage must recover every acknowledged
        // write.
        let mut driver = fresh_engine(&config, &store);
        verify_mirror(&mut driver, &config, &mirror);
    }

    #[test]
    fn crash_mid_read_stride_recovers_acknowledged_epochs() {
        let config = async_config(true);
        let store = Arc::new(AsyncOverSync::new(MemoryStore::new()));
        let mut rng = StdRng::seed_from_u64(13);
        let mut mirror = HashMap::new();

        {
            let mut driver = fresh_engine(&config, &store);
            epoch_workload(&mut driver, &config, 24, 2, 0, &mut rng, &mut mirror);

            // Fail two operations into the next epoch's first read stride.
            driver.oram.inject_failure_after_batch_ops(2);
            let err = driver.read_many(&[1, 2, 3, 4]).unwrap_err();
            assert!(matches!(err, OramError::SimulatedFailure(2)));
        }

        let mut driver = fresh_engine(&config, &store);
        verify_mirror(&mut driver, &config, &mirror);

        // The recovered engine keeps working across fresh epochs.
        epoch_workload(&mut driver, &config, 24, 2, 100, &mut rng, &mut mirror);
        verify_mirror(&mut driver, &config, &mirror);
    }

    #[test]
    fn crash_mid_write_batch_loses_only_the_unacknowledged_epoch() {
        let config = async_config(true);
        let store = Arc::new(AsyncOverSync::new(MemoryStore::new()));
        let mut rng = StdRng::seed_from_u64(14);
        let mut mirror = HashMap::new();

        {
            let mut driver = fresh_engine(&config, &store);
            epoch_workload(&mut driver, &config, 24, 2, 0, &mut rng, &mut mirror);

            // Complete the next epoch's read strides, then die inside its
            // write batch, before the delayed flush.
            driver
                .oram
                .inject_failure_after_batch_ops(2 * config.stride_size + 2);
            driver.read_many(&[1, 2, 3, 4]).unwrap();
            driver.read_many(&[5, 6, 7, 8]).unwrap();
            let doomed = vec![
                WriteOp::write(1, value_for(1, 200, config.value_size)),
                WriteOp::write(2, value_for(2, 200, config.value_size)),
            ];
            let err = driver.write_many(doomed).unwrap_err();
            assert!(matches!(err, OramError::SimulatedFailure(_)));
        }

        // The doomed writes were never acknowledged; the mirror still holds
        // the last durable values.
        let mut driver = fresh_engine(&config, &store);
        verify_mirror(&mut driver, &config, &mirror);
    }

    #[test]
    fn deletes_pipeline_like_writes() {
        let config = async_config(true);
        let store = Arc::new(AsyncOverSync::new(MemoryStore::new()));
        let mut driver = fresh_engine(&config, &store);

        let value = value_for(3, 0, config.value_size);
        driver
            .write_many(vec![
                WriteOp::write(3, value.clone()),
                WriteOp::write(4, value_for(4, 0, config.value_size)),
            ])
            .unwrap();
        assert_eq!(driver.read_many(&[3, 4]).unwrap()[0], Some(value));

        driver.write_many(vec![WriteOp::delete(3)]).unwrap();
        let values = driver.read_many(&[3, 4]).unwrap();
        assert_eq!(values[0], None);
        assert_eq!(values[1], Some(value_for(4, 0, config.value_size)));
    }
}
