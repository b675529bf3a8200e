// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block processors: the bridge between the access engine and the backing
//! store, owning encryption on the way out and decryption on the way in.
//!
//! One trait, two implementations: [`SyncBlockProcessor`] performs each
//! operation inline on the engine thread; [`AsyncBlockProcessor`] hands it
//! to the dependency scheduler, which preserves program order on conflicting
//! slots and logical keys while everything else proceeds concurrently.

use std::sync::Arc;

use crate::block::Block;
use crate::mask::{CryptoScratch, MaskContext};
use crate::recover::LogEntryId;
use crate::scheduler::Scheduler;
use crate::store::{SyncBackingStore, WriteOp};
use crate::{OramError, PhysicalKey};

/// A processor for resource-intensive block operations.
pub(crate) trait BlockProcessor: Send {
    /// Reads and decrypts the slot at `store_key` into `block`. `conflict_key`
    /// names the slot stably across rewrites for ordering purposes;
    /// `log_entry`, when present, orders this read after its access's
    /// write-ahead log entry.
    fn read_block(
        &mut self,
        conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: &Arc<Block>,
        log_entry: Option<LogEntryId>,
    ) -> Result<(), OramError>;

    /// Encrypts `block` and writes it at `store_key`.
    fn write_block(
        &mut self,
        conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: &Arc<Block>,
    ) -> Result<(), OramError>;

    /// Reads a batch of slots into the paired blocks. Sync mode only.
    fn read_block_in_batch(
        &mut self,
        store_keys: Vec<PhysicalKey>,
        blocks: Vec<Arc<Block>>,
    ) -> Result<(), OramError>;

    /// Encrypts `block` and returns the pending write without issuing it.
    /// Sync mode only.
    fn write_block_in_batch(
        &mut self,
        store_key: PhysicalKey,
        block: &Arc<Block>,
    ) -> Result<WriteOp, OramError>;

    /// Issues a buffered batch of writes. Sync mode only.
    fn flush_writes(&mut self, writes: Vec<WriteOp>) -> Result<(), OramError>;

    /// Persists a write-ahead log entry, ordered after the previous entry of
    /// the epoch. Async mode only; durability requires the async engine.
    fn write_log_entry(
        &mut self,
        entry_id: LogEntryId,
        prev_entry: Option<LogEntryId>,
        store_key: PhysicalKey,
        payload: Vec<u8>,
    ) -> Result<(), OramError>;
}

/// A simple synchronous block processor.
pub(crate) struct SyncBlockProcessor {
    store: Box<dyn SyncBackingStore + Send>,
    mask: Arc<MaskContext>,
    scratch: CryptoScratch,
}

impl SyncBlockProcessor {
    pub fn new(store: Box<dyn SyncBackingStore + Send>, mask: Arc<MaskContext>) -> Self {
        let scratch = CryptoScratch::new(mask.value_size());
        Self {
            store,
            mask,
            scratch,
        }
    }
}

impl BlockProcessor for SyncBlockProcessor {
    fn read_block(
        &mut self,
        _conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: &Arc<Block>,
        _log_entry: Option<LogEntryId>,
    ) -> Result<(), OramError> {
        let value = self.store.read(store_key)?;
        if !block.is_dummy {
            let value = value.unwrap_or_else(|| {
                panic!("slot {store_key} missing for block {}", block.key())
            });
            block.decrypt_and_set(value, &self.mask, &mut self.scratch);
        }
        Ok(())
    }

    fn write_block(
        &mut self,
        _conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: &Arc<Block>,
    ) -> Result<(), OramError> {
        let ciphertext = block.encrypt_and_clear(&self.mask, &mut self.scratch);
        self.store.write(WriteOp::write(store_key, ciphertext))
    }

    fn read_block_in_batch(
        &mut self,
        store_keys: Vec<PhysicalKey>,
        blocks: Vec<Arc<Block>>,
    ) -> Result<(), OramError> {
        let values = self.store.read_many(&store_keys)?;
        assert_eq!(values.len(), blocks.len(), "batch read came back short");
        for (block, value) in blocks.iter().zip(values) {
            if !block.is_dummy {
                let value =
                    value.unwrap_or_else(|| panic!("slot missing for block {}", block.key()));
                block.decrypt_and_set(value, &self.mask, &mut self.scratch);
            }
        }
        Ok(())
    }

    fn write_block_in_batch(
        &mut self,
        store_key: PhysicalKey,
        block: &Arc<Block>,
    ) -> Result<WriteOp, OramError> {
        let ciphertext = block.encrypt_and_clear(&self.mask, &mut self.scratch);
        Ok(WriteOp::write(store_key, ciphertext))
    }

    fn flush_writes(&mut self, writes: Vec<WriteOp>) -> Result<(), OramError> {
        self.store.write_many(writes)
    }

    fn write_log_entry(
        &mut self,
        _entry_id: LogEntryId,
        _prev_entry: Option<LogEntryId>,
        _store_key: PhysicalKey,
        _payload: Vec<u8>,
    ) -> Result<(), OramError> {
        unreachable!("the write-ahead log requires the async processor")
    }
}

/// The pipelined block processor: every operation becomes a task in the
/// dependency graph and executes on the worker pool.
pub(crate) struct AsyncBlockProcessor {
    scheduler: Arc<Scheduler>,
}

impl AsyncBlockProcessor {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl BlockProcessor for AsyncBlockProcessor {
    fn read_block(
        &mut self,
        conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: &Arc<Block>,
        log_entry: Option<LogEntryId>,
    ) -> Result<(), OramError> {
        self.scheduler
            .schedule_read(conflict_key, store_key, Arc::clone(block), log_entry);
        Ok(())
    }

    fn write_block(
        &mut self,
        conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: &Arc<Block>,
    ) -> Result<(), OramError> {
        self.scheduler
            .schedule_write(conflict_key, store_key, Arc::clone(block));
        Ok(())
    }

    fn read_block_in_batch(
        &mut self,
        _store_keys: Vec<PhysicalKey>,
        _blocks: Vec<Arc<Block>>,
    ) -> Result<(), OramError> {
        unreachable!("buffered reads are a sync-engine optimization")
    }

    fn write_block_in_batch(
        &mut self,
        _store_key: PhysicalKey,
        _block: &Arc<Block>,
    ) -> Result<WriteOp, OramError> {
        unreachable!("buffered writes are a sync-engine optimization")
    }

    fn flush_writes(&mut self, _writes: Vec<WriteOp>) -> Result<(), OramError> {
        unreachable!("buffered writes are a sync-engine optimization")
    }

    fn write_log_entry(
        &mut self,
        entry_id: LogEntryId,
        prev_entry: Option<LogEntryId>,
        store_key: PhysicalKey,
        payload: Vec<u8>,
    ) -> Result<(), OramError> {
        self.scheduler
            .schedule_log_entry(entry_id, prev_entry, store_key, payload);
        Ok(())
    }
}
