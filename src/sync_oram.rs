// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The blocking Ring ORAM front end.

use std::sync::Arc;

use rand::rngs::StdRng;

use crate::block::Block;
use crate::engine::{AccessObserver, NullObserver, OpType, RingOramCore};
use crate::mask::MaskContext;
use crate::processor::SyncBlockProcessor;
use crate::store::{SyncBackingStore, WriteOp};
use crate::{LogicalKey, OramConfig, OramError, PhysicalKey};

/// A Ring ORAM driving its backing store with blocking calls.
///
/// Itself a [`SyncBackingStore`]: a layer above (a concurrency-control
/// manager, a cache) issues plain keyed reads and writes and this engine
/// turns each batch into the padded oblivious access sequence.
pub struct SyncRingOram {
    core: RingOramCore,
}

impl SyncRingOram {
    /// Builds an engine with the tree height derived from `max_blocks` and
    /// the eviction rate, as in the Ring ORAM paper.
    pub fn create(
        config: OramConfig,
        store: Box<dyn SyncBackingStore + Send>,
        rng: StdRng,
    ) -> Result<Self, OramError> {
        let levels = config.derived_levels();
        Self::create_with_levels(config, levels, store, rng)
    }

    /// Builds an engine over an explicit tree height of `levels + 1` levels.
    pub fn create_with_levels(
        config: OramConfig,
        levels: usize,
        store: Box<dyn SyncBackingStore + Send>,
        rng: StdRng,
    ) -> Result<Self, OramError> {
        config.validate()?;
        if config.durable {
            return Err(OramError::InvalidConfiguration(
                "durability requires the async engine",
            ));
        }
        let mask = Arc::new(MaskContext::new(&config)?);
        let processor = SyncBlockProcessor::new(store, mask);
        Ok(Self {
            core: RingOramCore::new(config, levels, rng, Box::new(processor), None),
        })
    }

    /// The number of real blocks currently overflowed into the stash.
    pub fn stash_size(&self) -> usize {
        self.core.stash_size()
    }

    /// Total read-path probes that found no unread slot to consume.
    pub fn total_buckets_skipped(&self) -> usize {
        self.core.total_buckets_skipped()
    }

    /// See [`crate::config::OramConfig`]: read-path probes consume exhausted
    /// real slots instead of dummies.
    pub fn enable_read_path_all_real(&mut self) {
        self.core.enable_read_path_all_real();
    }

    /// Testing hook: remap every block to a fresh leaf as it enters the
    /// stash.
    pub fn enable_remap_on_stash_add(&mut self) {
        self.core.enable_remap_on_stash_add();
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &RingOramCore {
        &self.core
    }
}

/// Collects the value of each real read, in access order.
#[derive(Default)]
struct CollectReads {
    values: Vec<Option<Vec<u8>>>,
}

impl AccessObserver for CollectReads {
    fn on_real_block_read(&mut self, _: &Arc<Block>, _: LogicalKey, _: OpType) {}

    fn on_access_complete(
        &mut self,
        _key: LogicalKey,
        op: OpType,
        stash_block: Option<&Arc<Block>>,
        _was_in_tree: bool,
        _was_cached: bool,
    ) {
        if op == OpType::Read {
            // The processor is synchronous, so the block in the stash holds
            // the decrypted value by the time the access returns.
            self.values
                .push(stash_block.and_then(|block| block.value_clone()));
        }
    }
}

impl SyncBackingStore for SyncRingOram {
    fn read(&mut self, key: PhysicalKey) -> Result<Option<Vec<u8>>, OramError> {
        Ok(self.read_many(&[key])?.pop().flatten())
    }

    fn read_many(&mut self, keys: &[PhysicalKey]) -> Result<Vec<Option<Vec<u8>>>, OramError> {
        let mut observer = CollectReads::default();
        self.core.do_read_batch(keys, &mut observer)?;
        Ok(observer.values)
    }

    fn write(&mut self, op: WriteOp) -> Result<(), OramError> {
        self.write_many(vec![op])
    }

    fn write_many(&mut self, ops: Vec<WriteOp>) -> Result<(), OramError> {
        self.core.do_write_batch(ops, &mut NullObserver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CountingStore, MemoryStore};
    use crate::test_utils::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn test_config(max_blocks: usize, z: usize, s: usize, a: usize) -> OramConfig {
        OramConfig {
            max_blocks,
            z,
            s,
            a,
            value_size: 32,
            nonce_len: 8,
            write_without_read: true,
            write_end_batch: true,
            pad_batches: false,
            stride_size: 100,
            writes_size: 500,
            max_nb_stride: 5,
            client_key: vec![3u8; 16],
            ..OramConfig::default()
        }
    }

    fn oram_over_memory(config: &OramConfig) -> SyncRingOram {
        init_logger();
        SyncRingOram::create(
            config.clone(),
            Box::new(MemoryStore::new()),
            rand::rngs::StdRng::seed_from_u64(0),
        )
        .unwrap()
    }

    #[test]
    fn random_workload_small_tree() {
        let config = test_config(64, 4, 3, 3);
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        random_workload(&mut oram, &config, 32, 400, &mut rng);
    }

    #[test]
    fn random_workload_wider_buckets() {
        // A short batch period, so the delayed-write flush fires mid-run.
        let config = OramConfig {
            stride_size: 100,
            writes_size: 100,
            max_nb_stride: 2,
            ..test_config(256, 8, 8, 8)
        };
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        random_workload(&mut oram, &config, 128, 600, &mut rng);
    }

    #[test]
    fn random_workload_with_read_path_writes() {
        // Writes piggyback on the read path instead of staleifying in place.
        let config = OramConfig {
            write_without_read: false,
            ..test_config(64, 4, 3, 3)
        };
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        random_workload(&mut oram, &config, 32, 400, &mut rng);
    }

    #[test]
    fn random_workload_buffered_store_ops() {
        let config = OramConfig {
            buffer_sync_ops: true,
            ..test_config(64, 4, 3, 3)
        };
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        random_workload(&mut oram, &config, 32, 400, &mut rng);
    }

    #[test]
    fn all_real_probes_with_remap_on_stash_add() {
        // Probes consume exhausted real slots instead of dummies, and every
        // block pulled into the stash is immediately re-assigned a leaf.
        let config = test_config(32, 4, 3, 4);
        let mut oram = oram_over_memory(&config);
        oram.enable_read_path_all_real();
        oram.enable_remap_on_stash_add();
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        random_workload(&mut oram, &config, 16, 200, &mut rng);
        // Exhausted buckets produce skips rather than wrong answers.
        let _ = oram.total_buckets_skipped();
    }

    #[test]
    fn twenty_writes_then_twenty_reads() {
        // Z = 4, S = 2, N = 16: every read must return the last value
        // written, however many evictions and reshuffles happen in between.
        let config = test_config(16, 4, 2, 3);
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);

        let mut last_written: HashMap<LogicalKey, Vec<u8>> = HashMap::new();
        for round in 0..20u8 {
            let key = rng.gen_range(1..=16);
            let value = value_for(key, round, config.value_size);
            oram.write(WriteOp::write(key, value.clone())).unwrap();
            last_written.insert(key, value);
        }

        let mut keys: Vec<LogicalKey> = last_written.keys().copied().collect();
        keys.shuffle(&mut rng);
        for key in keys {
            assert_eq!(oram.read(key).unwrap().as_ref(), last_written.get(&key));
        }
    }

    #[test]
    fn write_lands_in_stash_before_eviction() {
        // With A larger than the op count, nothing is evicted; the value is
        // served straight from the stash.
        let config = test_config(64, 4, 3, 1000);
        let mut oram = oram_over_memory(&config);
        let value = value_for(9, 0, config.value_size);
        oram.write(WriteOp::write(9, value.clone())).unwrap();
        assert!(oram.stash_size() >= 1);
        assert_eq!(oram.read(9).unwrap(), Some(value));
    }

    #[test]
    fn delete_makes_a_key_absent() {
        for write_without_read in [true, false] {
            let config = OramConfig {
                write_without_read,
                ..test_config(64, 4, 3, 3)
            };
            let mut oram = oram_over_memory(&config);
            let value = value_for(7, 0, config.value_size);
            oram.write(WriteOp::write(7, value.clone())).unwrap();
            assert_eq!(oram.read(7).unwrap(), Some(value));

            oram.write(WriteOp::delete(7)).unwrap();
            assert_eq!(oram.read(7).unwrap(), None, "wwr = {write_without_read}");

            // The key is writable again afterwards.
            let fresh = value_for(7, 1, config.value_size);
            oram.write(WriteOp::write(7, fresh.clone())).unwrap();
            assert_eq!(oram.read(7).unwrap(), Some(fresh));
        }
    }

    #[test]
    fn stash_stays_bounded() {
        let config = test_config(256, 8, 8, 8);
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(6);
        random_workload(&mut oram, &config, 128, 600, &mut rng);
        assert!(
            oram.stash_size() <= config.durable_max_stash_size,
            "stash grew to {}",
            oram.stash_size()
        );
    }

    #[test]
    fn buckets_keep_full_occupancy_and_bounded_access_counts() {
        let config = test_config(64, 4, 3, 3);
        let mut oram = oram_over_memory(&config);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        random_workload(&mut oram, &config, 32, 300, &mut rng);

        let slots = config.bucket_slots();
        let core = oram.core();
        for level in 0..core.num_levels() {
            for index in 0..(1u32 << level) {
                let bucket = core.bucket(level, index);
                assert_eq!(bucket.occupied_slots(), slots, "bucket ({level}, {index})");
                assert!(
                    bucket.num_accessed() <= config.s,
                    "bucket ({level}, {index}) probed past its dummy budget"
                );
            }
        }
    }

    #[test]
    fn padded_batches_issue_constant_physical_traffic() {
        // With evictions and reshuffles pushed out of the window, a padded
        // batch's physical op count depends only on the batch geometry,
        // never on how many real keys it carried.
        let shape = OramConfig {
            max_blocks: 64,
            z: 4,
            s: 100,
            a: 100_000,
            value_size: 32,
            nonce_len: 8,
            write_without_read: false,
            write_end_batch: false,
            pad_batches: true,
            stride_size: 8,
            writes_size: 4,
            max_nb_stride: 1,
            client_key: vec![3u8; 16],
            ..OramConfig::default()
        };

        let mut traffic = Vec::new();
        for real_reads in [0usize, 1, 8] {
            init_logger();
            let store = CountingStore::new(MemoryStore::new());
            let counters = store.counters();
            let mut oram = SyncRingOram::create_with_levels(
                shape.clone(),
                4,
                Box::new(store),
                rand::rngs::StdRng::seed_from_u64(8),
            )
            .unwrap();

            let keys: Vec<LogicalKey> = (1..=real_reads as i64).collect();
            oram.read_many(&keys).unwrap();
            let mut writes = Vec::new();
            for key in 1..=2i64 {
                writes.push(WriteOp::write(key, value_for(key, 0, shape.value_size)));
            }
            oram.write_many(writes).unwrap();

            traffic.push((counters.reads(), counters.writes()));
        }
        assert_eq!(traffic[0], traffic[1]);
        assert_eq!(traffic[1], traffic[2]);

        // Each of the stride's 8 reads and the write batch's 4 (padded)
        // accesses probes one slot per level of the 5-level tree.
        assert_eq!(traffic[0].0, (8 + 4) * 5);
    }
}
