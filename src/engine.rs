// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Ring ORAM access engine.
//!
//! `access` is the whole protocol: remap the key to a fresh random leaf,
//! probe one slot per level along the old leaf's path, apply the logical
//! effect in the stash, evict one reverse-bit-order path every `A` accesses,
//! and reshuffle any bucket whose dummy budget is spent. Everything here is
//! single-threaded per instance; only the physical slot I/O a step schedules
//! runs concurrently, under the dependency graph's ordering.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::block::Block;
use crate::bucket::{Bucket, BucketCtx, DelayedWrites};
use crate::config::OramConfig;
use crate::position_map::PositionMap;
use crate::processor::BlockProcessor;
use crate::recover::{DurableMaps, LogEntryId, ReadPath, WriteAheadLog};
use crate::stash::Stash;
use crate::store::{WriteKind, WriteOp};
use crate::{Leaf, LogicalKey, OramError, DUMMY_KEY};

/// The kind of logical operation an access performs. Dummy variants execute
/// the full physical protocol with no logical effect; they are what pads
/// batches to their fixed shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    /// Read the value of a key.
    Read,
    /// Write (or create) the value of a key.
    Write,
    /// Remove a key.
    Delete,
    /// A padding read: full path traffic, no logical effect.
    DummyRead,
    /// A padding write: advances batch accounting only.
    DummyWrite,
}

impl OpType {
    fn is_dummy(self) -> bool {
        matches!(self, OpType::DummyRead | OpType::DummyWrite)
    }
}

/// Front-end hooks into the access state machine. The sync engine collects
/// read values directly; the async engine routes them through its read
/// collectors as decryption completes.
pub(crate) trait AccessObserver {
    /// A real block version was pulled off the path, before its physical
    /// read is scheduled.
    fn on_real_block_read(&mut self, block: &Arc<Block>, target_key: LogicalKey, op: OpType);

    /// The read-path phase of an access finished; `stash_block` is the
    /// block now holding the key, if any.
    fn on_access_complete(
        &mut self,
        key: LogicalKey,
        op: OpType,
        stash_block: Option<&Arc<Block>>,
        was_in_tree: bool,
        was_cached: bool,
    );
}

/// An observer that ignores everything; used for write batches and replay.
pub(crate) struct NullObserver;

impl AccessObserver for NullObserver {
    fn on_real_block_read(&mut self, _: &Arc<Block>, _: LogicalKey, _: OpType) {}
    fn on_access_complete(
        &mut self,
        _: LogicalKey,
        _: OpType,
        _: Option<&Arc<Block>>,
        _: bool,
        _: bool,
    ) {
    }
}

/// Recovered engine state loaded by the write-ahead log.
pub(crate) struct RecoveredState {
    pub position_map: PositionMap,
    pub durable_maps: DurableMaps,
    pub stash: Stash,
    pub evict_path_count: u32,
    pub logical_accesses: Vec<ReadPath>,
}

pub(crate) struct RingOramCore {
    pub(crate) config: OramConfig,
    num_levels: usize,
    num_leaves: u32,
    rng: StdRng,
    processor: Box<dyn BlockProcessor>,
    buckets: Vec<Vec<Bucket>>,
    round: usize,
    total_batch_ops: usize,
    pub(crate) stash: Stash,
    pub(crate) position_map: PositionMap,
    delayed: DelayedWrites,
    batch_op_count: usize,
    fail_after_batch_ops: Option<usize>,
    remap_on_stash_add: bool,
    read_path_all_real: bool,
    pub(crate) evict_path_count: u32,
    pub(crate) durable_maps: DurableMaps,
    pub(crate) wal: Option<WriteAheadLog>,
    prev_log_entry: Option<LogEntryId>,
    next_log_entry_id: LogEntryId,
}

impl RingOramCore {
    /// Builds an engine over `levels + 1` tree levels. The configuration
    /// must already be validated by the front end.
    pub fn new(
        config: OramConfig,
        levels: usize,
        rng: StdRng,
        processor: Box<dyn BlockProcessor>,
        wal: Option<WriteAheadLog>,
    ) -> Self {
        assert!(levels + 1 < 32, "leaf paths must fit in 32 bits");
        let num_levels = levels + 1;
        let num_leaves = 1u32 << num_levels;
        let total_batch_ops = config.total_batch_ops();

        let buckets = (0..num_levels)
            .map(|level| {
                (0..(1u32 << level))
                    .map(|index| Bucket::new(level, index, config.z, config.s, config.durable))
                    .collect()
            })
            .collect();

        let total_slots = ((1usize << num_levels) - 1) * config.bucket_slots();
        log::info!(
            "RingOram::new(N = {}, Z = {}, S = {}, A = {}, levels = {num_levels}, physical slots = {total_slots})",
            config.max_blocks,
            config.z,
            config.s,
            config.a,
        );

        let stash = Stash::new(config.durable_max_stash_size, config.value_size);
        let position_map = PositionMap::new(config.max_blocks, total_batch_ops);
        let durable_maps = DurableMaps::new(
            num_levels,
            config.bucket_slots(),
            config.z,
            config.writes_size,
        );

        Self {
            config,
            num_levels,
            num_leaves,
            rng,
            processor,
            buckets,
            round: 0,
            total_batch_ops,
            stash,
            position_map,
            delayed: DelayedWrites::default(),
            batch_op_count: 0,
            fail_after_batch_ops: None,
            remap_on_stash_add: false,
            read_path_all_real: false,
            evict_path_count: 0,
            durable_maps,
            wal,
            prev_log_entry: None,
            next_log_entry_id: 0,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    pub fn stash_size(&self) -> usize {
        self.stash.len()
    }

    pub fn total_buckets_skipped(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|level| level.iter())
            .map(Bucket::num_skipped)
            .sum()
    }

    pub fn enable_read_path_all_real(&mut self) {
        self.read_path_all_real = true;
    }

    pub fn enable_remap_on_stash_add(&mut self) {
        self.remap_on_stash_add = true;
    }

    /// Makes the engine fail with [`OramError::SimulatedFailure`] after the
    /// given number of operations into a batch. Crash tests only.
    pub fn inject_failure_after_batch_ops(&mut self, ops: usize) {
        self.fail_after_batch_ops = Some(ops);
    }

    fn random_leaf(&mut self) -> Leaf {
        self.rng.gen_range(0..self.num_leaves)
    }

    fn bucket_index(&self, path: Leaf, level: usize) -> u32 {
        path >> (self.num_levels - level)
    }

    /// One logical access: the generalized read/write interface of the Ring
    /// ORAM protocol, plus batch and epoch accounting.
    pub fn access(
        &mut self,
        key: LogicalKey,
        value: Option<Vec<u8>>,
        op: OpType,
        predetermined_path: Option<Leaf>,
        needs_log: bool,
        observer: &mut dyn AccessObserver,
    ) -> Result<(), OramError> {
        if op == OpType::Write {
            let value = value.as_ref().expect("write access without a value");
            assert_eq!(value.len(), self.config.value_size, "value size mismatch");
        }
        if !op.is_dummy() {
            assert_ne!(key, DUMMY_KEY, "the dummy key cannot be accessed");
        }

        let mut new_pos: Leaf = 0;
        let mut old_pos: Option<Leaf> = None;
        if matches!(op, OpType::Read | OpType::Write) {
            new_pos = self.random_leaf();
            old_pos = self.position_map.put(key, new_pos);
            assert!(
                !self.config.durable || self.position_map.len() <= self.config.max_blocks,
                "position map grew past the configured block count"
            );
        }
        if let Some(path) = predetermined_path {
            old_pos = Some(path);
        }

        let mut was_in_tree = false;
        let mut was_cached = false;
        let mut reshuffle_path: Option<Leaf> = None;

        if matches!(op, OpType::Read | OpType::DummyRead) || !self.config.write_without_read {
            // First access to a key reads a throwaway random path.
            let path = match old_pos {
                Some(path) => path,
                None => self.random_leaf(),
            };
            self.read_path(
                path,
                new_pos,
                key,
                value.as_deref(),
                op,
                needs_log,
                observer,
                &mut was_in_tree,
                &mut was_cached,
            )?;
            reshuffle_path = Some(path);
        } else {
            if op == OpType::Delete {
                old_pos = self.position_map.get(key);
            }
            if let Some(path) = old_pos {
                self.staleify_block_in_tree(key, path);
            }
        }

        if op != OpType::DummyWrite {
            let stash_block = self.stash.get_block(key).cloned();
            observer.on_access_complete(key, op, stash_block.as_ref(), was_in_tree, was_cached);
            match stash_block {
                None => {
                    // Guaranteed present after the read path unless the key
                    // has never been written; a first write mints the block.
                    if op == OpType::Write {
                        let block = Block::new_real(
                            key,
                            value,
                            0,
                            self.config.durable,
                            0,
                        );
                        self.stash.add_block(block);
                    }
                }
                Some(block) => {
                    if op == OpType::Write && !was_in_tree {
                        block.set_value(value);
                    } else if op == OpType::Delete {
                        self.stash.delete_block(key);
                    }
                }
            }
        }

        self.round = (self.round + 1) % self.config.a;
        if self.round == 0 {
            self.evict_path()?;
        }

        if let Some(path) = reshuffle_path {
            self.early_reshuffle(path)?;
        }

        if self.config.write_end_batch {
            self.batch_op_count = (self.batch_op_count + 1) % self.total_batch_ops;
            if self.batch_op_count == 0 {
                self.do_delayed_writes()?;
            }
            if let Some(fail_after) = self.fail_after_batch_ops {
                if self.batch_op_count == fail_after {
                    return Err(OramError::SimulatedFailure(fail_after));
                }
            }
        }
        Ok(())
    }

    /// Reads one slot per level along `path` into the stash, logging the
    /// access first when durability demands it.
    #[allow(clippy::too_many_arguments)]
    fn read_path(
        &mut self,
        path: Leaf,
        new_path: Leaf,
        key: LogicalKey,
        value: Option<&[u8]>,
        op: OpType,
        needs_log: bool,
        observer: &mut dyn AccessObserver,
        was_in_tree: &mut bool,
        was_cached: &mut bool,
    ) -> Result<(), OramError> {
        let durable = self.config.durable;
        let read_path_all_real = self.read_path_all_real;
        let mut offsets: Vec<Option<usize>> = Vec::with_capacity(self.num_levels);
        for level in 0..self.num_levels {
            let index = self.bucket_index(path, level);
            let recover_with = if durable {
                Some((
                    &self.durable_maps,
                    self.evict_path_count,
                    self.config.write_end_batch,
                ))
            } else {
                None
            };
            let offset = self.buckets[level][index as usize].get_block_offset(
                key,
                &mut self.rng,
                read_path_all_real,
                recover_with,
            );
            offsets.push(offset);
        }

        let mut log_entry = None;
        if durable && needs_log {
            let mut entry = ReadPath::new(key, path, new_path, op.is_dummy());
            entry.indices_accessed = offsets
                .iter()
                .map(|offset| offset.map(|o| o as i32).unwrap_or(-1))
                .collect();
            let wal = self.wal.as_mut().expect("durable engine without a WAL");
            let store_key = wal.key_for_next_read_path();
            self.next_log_entry_id += 1;
            let entry_id = self.next_log_entry_id;
            self.processor.write_log_entry(
                entry_id,
                self.prev_log_entry,
                store_key,
                entry.serialize(),
            )?;
            self.prev_log_entry = Some(entry_id);
            log_entry = Some(entry_id);
        }

        for level in 0..self.num_levels {
            let offset = match offsets[level] {
                Some(offset) => offset,
                None => continue,
            };
            let index = self.bucket_index(path, level);
            let mut before_read = |block: &Arc<Block>| {
                if op == OpType::Write && block.key() == key {
                    // The read pulled the block we are overwriting; install
                    // the new value before the stale ciphertext can land.
                    block.set_value(value.map(|v| v.to_vec()));
                }
                observer.on_real_block_read(block, key, op);
            };
            let mut ctx = BucketCtx {
                rng: &mut self.rng,
                stash: &mut self.stash,
                position_map: &mut self.position_map,
                processor: &mut *self.processor,
                durable: durable.then_some(&mut self.durable_maps),
                delayed: &mut self.delayed,
                evict_path_count: self.evict_path_count,
                z: self.config.z,
                s: self.config.s,
                num_levels: self.num_levels,
                num_leaves: self.num_leaves,
                write_end_batch: self.config.write_end_batch,
                buffer_ops: self.config.buffer_sync_ops,
                read_path_all_real: self.read_path_all_real,
                remap_on_stash_add: self.remap_on_stash_add,
            };
            let outcome = self.buckets[level][index as usize].read_block_at_offset(
                &mut ctx,
                offset,
                key,
                log_entry,
                &mut before_read,
            )?;
            if outcome.found_target {
                *was_in_tree = true;
                *was_cached = outcome.was_cached;
            }
        }
        Ok(())
    }

    /// Evicts the path named by the reverse-bit-order counter and advances
    /// the counter.
    fn evict_path(&mut self) -> Result<(), OramError> {
        let path: Leaf = self.evict_path_count.reverse_bits() >> (32 - self.num_levels);
        log::debug!("evicting path {path} (count {})", self.evict_path_count);

        for level in 0..self.num_levels {
            let index = self.bucket_index(path, level);
            self.with_bucket_ctx(level, index, |bucket, ctx| bucket.read_bucket(ctx))?;
        }
        self.evict_path_count += 1;
        for level in (0..self.num_levels).rev() {
            let index = self.bucket_index(path, level);
            self.with_bucket_ctx(level, index, |bucket, ctx| bucket.write_bucket(ctx))?;
            if self.config.durable {
                self.durable_maps.early_reshuffle.reset(level, index);
            }
        }
        Ok(())
    }

    /// Rewrites any bucket on `path` whose dummy budget is exhausted.
    fn early_reshuffle(&mut self, path: Leaf) -> Result<(), OramError> {
        for level in 0..self.num_levels {
            let index = self.bucket_index(path, level);
            if self.buckets[level][index as usize].num_accessed() < self.config.s {
                continue;
            }
            log::debug!("early reshuffle of bucket ({level}, {index})");
            self.with_bucket_ctx(level, index, |bucket, ctx| bucket.read_bucket(ctx))?;
            if self.config.durable {
                self.durable_maps.early_reshuffle.increment(level, index);
            }
            self.with_bucket_ctx(level, index, |bucket, ctx| bucket.write_bucket(ctx))?;
        }
        Ok(())
    }

    fn with_bucket_ctx<F>(&mut self, level: usize, index: u32, f: F) -> Result<(), OramError>
    where
        F: FnOnce(&mut Bucket, &mut BucketCtx<'_>) -> Result<(), OramError>,
    {
        let durable = self.config.durable;
        let mut ctx = BucketCtx {
            rng: &mut self.rng,
            stash: &mut self.stash,
            position_map: &mut self.position_map,
            processor: &mut *self.processor,
            durable: durable.then_some(&mut self.durable_maps),
            delayed: &mut self.delayed,
            evict_path_count: self.evict_path_count,
            z: self.config.z,
            s: self.config.s,
            num_levels: self.num_levels,
            num_leaves: self.num_leaves,
            write_end_batch: self.config.write_end_batch,
            buffer_ops: self.config.buffer_sync_ops,
            read_path_all_real: self.read_path_all_real,
            remap_on_stash_add: self.remap_on_stash_add,
        };
        f(&mut self.buckets[level][index as usize], &mut ctx)
    }

    fn staleify_block_in_tree(&mut self, key: LogicalKey, path: Leaf) {
        let durable = self.config.durable;
        for level in 0..self.num_levels {
            let index = self.bucket_index(path, level);
            let found = self.buckets[level][index as usize].staleify_block(
                key,
                &mut self.stash,
                durable.then_some(&mut self.durable_maps),
            );
            if found {
                break;
            }
        }
    }

    /// Flushes the batch's deferred bucket writes, resolving each slot's
    /// store key from the counters in force right now.
    fn do_delayed_writes(&mut self) -> Result<(), OramError> {
        let writes = self.delayed.drain();
        log::debug!("flushing {} delayed writes", writes.len());
        for write in writes {
            let early = self
                .durable_maps
                .early_reshuffle
                .count(write.level, write.index);
            let bucket = &self.buckets[write.level][write.index as usize];
            let store_key = bucket.store_key(
                write.slot,
                self.evict_path_count,
                early,
                self.config.write_end_batch,
            );
            let partial_key = bucket.partial_key(write.slot);
            write.block.set_physical_key(store_key);
            self.processor
                .write_block(partial_key, store_key, &write.block)?;
            write.block.set_cached(false);
        }
        Ok(())
    }

    /// Performs one padded read stride.
    pub fn do_read_batch(
        &mut self,
        keys: &[LogicalKey],
        observer: &mut dyn AccessObserver,
    ) -> Result<(), OramError> {
        for &key in keys {
            self.access(key, None, OpType::Read, None, true, observer)?;
        }
        if self.config.pad_batches {
            for _ in keys.len()..self.config.stride_size {
                self.access(DUMMY_KEY, None, OpType::DummyRead, None, true, observer)?;
            }
        }
        Ok(())
    }

    /// Performs one padded write batch.
    pub fn do_write_batch(
        &mut self,
        writes: Vec<WriteOp>,
        observer: &mut dyn AccessObserver,
    ) -> Result<(), OramError> {
        let written = writes.len();
        for write in writes {
            let op = match write.kind {
                WriteKind::Write => OpType::Write,
                WriteKind::Delete => OpType::Delete,
            };
            self.access(write.key, write.value, op, None, true, observer)?;
        }
        if self.config.pad_batches {
            for _ in written..self.config.writes_size {
                self.access(DUMMY_KEY, None, OpType::DummyWrite, None, true, observer)?;
            }
        }
        Ok(())
    }

    /// Replays logged read paths as one stride, padded with fresh dummy
    /// reads. Replayed accesses use their logged leaf and are not re-logged.
    pub fn recovery_read_replay(
        &mut self,
        paths: &[ReadPath],
        observer: &mut dyn AccessObserver,
    ) -> Result<(), OramError> {
        for path in paths {
            if path.dummy {
                self.access(
                    DUMMY_KEY,
                    None,
                    OpType::DummyRead,
                    Some(path.old_path),
                    false,
                    observer,
                )?;
            } else {
                self.access(
                    path.key,
                    None,
                    OpType::Read,
                    Some(path.old_path),
                    false,
                    observer,
                )?;
            }
        }
        for _ in paths.len()..self.config.stride_size {
            self.access(DUMMY_KEY, None, OpType::DummyRead, None, true, observer)?;
        }
        Ok(())
    }

    /// Replays the crashed epoch's write batch as all-dummy writes, which
    /// drives the evictions, the delayed-write flush, and epoch completion.
    pub fn recovery_write_replay(
        &mut self,
        observer: &mut dyn AccessObserver,
    ) -> Result<(), OramError> {
        for _ in 0..self.config.writes_size {
            self.access(DUMMY_KEY, None, OpType::DummyWrite, None, true, observer)?;
        }
        Ok(())
    }

    /// Installs state recovered from the write-ahead log and rebuilds every
    /// bucket's client-side view from it.
    pub fn install_recovered_state(&mut self, state: RecoveredState) {
        self.position_map = state.position_map;
        self.durable_maps = state.durable_maps;
        self.stash = state.stash;
        self.evict_path_count = state.evict_path_count;
        let mut rebuilt = 0usize;
        for level in 0..self.num_levels {
            for index in 0..(1u32 << level) {
                if self.buckets[level][index as usize].recover(
                    &self.durable_maps,
                    self.evict_path_count,
                    self.config.write_end_batch,
                ) {
                    rebuilt += 1;
                }
            }
        }
        log::info!(
            "recovered engine state: {rebuilt} buckets rebuilt, stash size {}, evict count {}",
            self.stash.len(),
            self.evict_path_count
        );
    }

    /// Clears every incremental-diff tracker; recovery calls this once the
    /// replay has brought the maps back in sync with storage.
    pub fn clear_changed_trackers(&mut self) {
        self.position_map.clear_changed();
        self.durable_maps.clear_changed();
    }

    #[cfg(test)]
    pub(crate) fn bucket(&self, level: usize, index: u32) -> &Bucket {
        &self.buckets[level][index as usize]
    }
}
