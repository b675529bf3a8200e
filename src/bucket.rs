// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Buckets: the fixed-capacity nodes of the ORAM tree.
//!
//! A bucket always holds exactly `Z + S` slots. After every write all slots
//! are occupied (real or dummy), the slot order is freshly shuffled, and the
//! access counter is zero. Between writes, each probe consumes one slot;
//! once `S` slots have been consumed the bucket must be reshuffled before it
//! can be probed again.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::block::Block;
use crate::mask::hash_persistent;
use crate::position_map::PositionMap;
use crate::processor::BlockProcessor;
use crate::recover::{DurableMaps, LogEntryId};
use crate::stash::Stash;
use crate::{Leaf, LogicalKey, OramError, PhysicalKey};

/// Mutable engine state a bucket operation runs against. Built inline from
/// the engine's disjoint fields for each call.
pub(crate) struct BucketCtx<'a> {
    pub rng: &'a mut StdRng,
    pub stash: &'a mut Stash,
    pub position_map: &'a mut PositionMap,
    pub processor: &'a mut dyn BlockProcessor,
    /// Present when durability is enabled; bucket operations keep the
    /// recovery maps in lockstep with every slot transition.
    pub durable: Option<&'a mut DurableMaps>,
    pub delayed: &'a mut DelayedWrites,
    pub evict_path_count: u32,
    pub z: usize,
    pub s: usize,
    pub num_levels: usize,
    pub num_leaves: u32,
    pub write_end_batch: bool,
    pub buffer_ops: bool,
    pub read_path_all_real: bool,
    pub remap_on_stash_add: bool,
}

/// A physical bucket write deferred to the end of the batch. The slot
/// coordinate is kept alongside the block so the flush can derive the store
/// key from the counters in force at flush time.
pub(crate) struct DelayedWrite {
    pub block: Arc<Block>,
    pub level: usize,
    pub index: u32,
    pub slot: usize,
}

/// Deferred bucket writes, keyed by the slot's partial physical key.
#[derive(Default)]
pub(crate) struct DelayedWrites {
    map: HashMap<PhysicalKey, DelayedWrite>,
}

impl DelayedWrites {
    pub fn insert(&mut self, partial_key: PhysicalKey, write: DelayedWrite) {
        self.map.insert(partial_key, write);
    }

    pub fn remove(&mut self, partial_key: PhysicalKey) {
        self.map.remove(&partial_key);
    }

    pub fn drain(&mut self) -> Vec<DelayedWrite> {
        self.map.drain().map(|(_, write)| write).collect()
    }
}

/// Outcome of probing one path level for a target key.
#[derive(Default, Clone, Copy)]
pub(crate) struct ReadOutcome {
    pub found_target: bool,
    pub was_cached: bool,
}

pub(crate) struct Bucket {
    level: usize,
    index: u32,
    slots: Vec<Arc<Block>>,
    fixed_keys: Vec<PhysicalKey>,
    key_to_offset: HashMap<LogicalKey, usize>,
    permutation: HashMap<LogicalKey, usize>,
    unread_dummies: Vec<usize>,
    unread_reals: Vec<usize>,
    num_accessed: usize,
    skipped: usize,
    durable: bool,
    recovered: bool,
}

impl Bucket {
    pub fn new(level: usize, index: u32, z: usize, s: usize, durable: bool) -> Self {
        let slots: Vec<Arc<Block>> = (0..z + s).map(|_| Block::new_dummy()).collect();
        let fixed_keys = (0..z + s).map(|i| fixed_key(level, index, i)).collect();
        Self {
            level,
            index,
            slots,
            fixed_keys,
            key_to_offset: HashMap::with_capacity(z),
            permutation: HashMap::with_capacity(z),
            unread_dummies: (0..z + s).collect(),
            unread_reals: Vec::with_capacity(z),
            num_accessed: 0,
            skipped: 0,
            durable,
            recovered: !durable,
        }
    }

    pub fn num_accessed(&self) -> usize {
        self.num_accessed
    }

    pub fn num_skipped(&self) -> usize {
        self.skipped
    }

    #[cfg(test)]
    pub fn occupied_slots(&self) -> usize {
        self.slots.len()
    }

    /// The slot's scheduling key: stable across rewrites of the slot, used
    /// for conflict detection and the delayed-write table.
    pub fn partial_key(&self, slot: usize) -> PhysicalKey {
        if self.durable {
            let mut bytes = [0u8; 12];
            bytes[0..4].copy_from_slice(&(self.level as i32).to_be_bytes());
            bytes[4..8].copy_from_slice(&(self.index as i32).to_be_bytes());
            bytes[8..12].copy_from_slice(&(slot as i32).to_be_bytes());
            hash_persistent(&bytes)
        } else {
            self.fixed_keys[slot]
        }
    }

    /// The slot's current store key. In durable mode the key folds in parity
    /// of the bucket's eviction and early-reshuffle counters, so the
    /// ciphertext address changes when the slot is rewritten and a partially
    /// flushed epoch cannot clobber the previous epoch's recoverable state.
    pub fn store_key(
        &self,
        slot: usize,
        evict_path_count: u32,
        early_reshuffles: u32,
        write_end_batch: bool,
    ) -> PhysicalKey {
        if !self.durable {
            return self.fixed_keys[slot];
        }
        durable_store_key(
            self.level,
            self.index,
            slot,
            evict_path_count,
            early_reshuffles,
            write_end_batch,
        )
    }

    fn slot_store_key(&self, slot: usize, ctx: &BucketCtx<'_>) -> PhysicalKey {
        let early = ctx
            .durable
            .as_ref()
            .map(|maps| maps.early_reshuffle.count(self.level, self.index))
            .unwrap_or(0);
        self.store_key(slot, ctx.evict_path_count, early, ctx.write_end_batch)
    }

    /// Picks the slot offset to probe for `key`. A currently valid,
    /// non-stale real hit is consumed and returned; otherwise a uniformly
    /// random unread slot is consumed (a real-but-exhausted one in
    /// read-path-all-real mode, a dummy otherwise). `None` means every
    /// eligible slot was already consumed this cycle; the caller records a
    /// skip and the probe touches nothing.
    pub fn get_block_offset(
        &mut self,
        key: LogicalKey,
        rng: &mut StdRng,
        read_path_all_real: bool,
        recover_with: Option<(&DurableMaps, u32, bool)>,
    ) -> Option<usize> {
        if self.durable && !self.recovered {
            let (maps, evict_path_count, write_end_batch) =
                recover_with.expect("unrecovered bucket probed without recovery state");
            self.recover(maps, evict_path_count, write_end_batch);
        }
        if let Some(&offset) = self.key_to_offset.get(&key) {
            if self.slots[offset].is_valid() && !self.slots[offset].is_stale() {
                self.unread_reals.retain(|&i| i != offset);
                self.key_to_offset.remove(&key);
                return Some(offset);
            }
        }
        if read_path_all_real {
            if self.unread_reals.is_empty() {
                self.skipped += 1;
                return None;
            }
            let pick = rng.gen_range(0..self.unread_reals.len());
            let offset = self.unread_reals.swap_remove(pick);
            self.key_to_offset.remove(&self.slots[offset].key());
            Some(offset)
        } else {
            assert!(
                !self.unread_dummies.is_empty(),
                "bucket ({}, {}) exhausted its dummy budget without a reshuffle",
                self.level,
                self.index
            );
            let pick = rng.gen_range(0..self.unread_dummies.len());
            Some(self.unread_dummies.swap_remove(pick))
        }
    }

    /// Reads the block at `offset` into the stash as a fresh version,
    /// scheduling the physical read unless the slot is delay-cached.
    pub fn read_block_at_offset(
        &mut self,
        ctx: &mut BucketCtx<'_>,
        offset: usize,
        target_key: LogicalKey,
        log_entry: Option<LogEntryId>,
        before_read: &mut dyn FnMut(&Arc<Block>),
    ) -> Result<ReadOutcome, OramError> {
        assert!(self.recovered, "probing an unrecovered bucket");
        let block = Arc::clone(&self.slots[offset]);
        assert!(block.is_valid(), "probed an invalid slot");
        assert!(!block.is_stale(), "probed a stale slot");

        block.invalidate();
        if let Some(maps) = ctx.durable.as_mut() {
            maps.valid.invalidate(self.level, self.index, offset);
        }

        let mut outcome = ReadOutcome::default();
        let mut new_block = Arc::clone(&block);
        if !block.is_dummy {
            if !block.is_cached() {
                new_block = Block::copy_to_new_version(&block);
            }
            if new_block.key() == target_key {
                outcome.found_target = true;
                outcome.was_cached = new_block.is_cached();
            }
            before_read(&new_block);
        }

        if !ctx.write_end_batch || !new_block.is_cached() {
            let store_key = self.slot_store_key(offset, ctx);
            ctx.processor
                .read_block(self.partial_key(offset), store_key, &new_block, log_entry)?;
        }
        if ctx.write_end_batch {
            ctx.delayed.remove(self.partial_key(offset));
        }

        ctx.stash.add_block(new_block);
        self.num_accessed += 1;
        Ok(outcome)
    }

    /// Pulls every still-valid real block, padded with random unread dummies
    /// to `Z` (unless in read-path-all-real mode), into the stash,
    /// invalidating the slots as they are read.
    pub fn read_bucket(&mut self, ctx: &mut BucketCtx<'_>) -> Result<(), OramError> {
        if self.durable && !self.recovered {
            let maps = ctx
                .durable
                .as_deref()
                .expect("durable bucket read without recovery maps");
            self.recover(maps, ctx.evict_path_count, ctx.write_end_batch);
        }

        let mut offsets: Vec<usize> = Vec::with_capacity(ctx.z);
        for (_, &offset) in self.key_to_offset.iter() {
            if self.slots[offset].is_valid() {
                offsets.push(offset);
            }
        }
        assert!(offsets.len() <= ctx.z, "bucket holds more than Z live blocks");

        if !ctx.read_path_all_real {
            while offsets.len() < ctx.z {
                let pick = ctx.rng.gen_range(0..self.unread_dummies.len());
                offsets.push(self.unread_dummies.swap_remove(pick));
            }
        }
        // Reads go out in slot order so the offsets reveal nothing about
        // which of them are real.
        offsets.sort_unstable();

        let mut batch_keys = Vec::new();
        let mut batch_blocks = Vec::new();
        for &offset in &offsets {
            let block = Arc::clone(&self.slots[offset]);
            block.invalidate();
            if let Some(maps) = ctx.durable.as_mut() {
                maps.valid.invalidate(self.level, self.index, offset);
            }

            let mut new_block = Arc::clone(&block);
            if !block.is_dummy && !block.is_cached() {
                new_block = Block::copy_to_new_version(&block);
                if block.is_stale() {
                    new_block.staleify();
                }
            }

            if !ctx.write_end_batch || !new_block.is_cached() {
                let store_key = self.slot_store_key(offset, ctx);
                if ctx.buffer_ops {
                    batch_keys.push(store_key);
                    batch_blocks.push(Arc::clone(&new_block));
                } else {
                    ctx.processor.read_block(
                        self.partial_key(offset),
                        store_key,
                        &new_block,
                        None,
                    )?;
                }
            }
            if ctx.write_end_batch {
                ctx.delayed.remove(self.partial_key(offset));
            }

            if ctx.remap_on_stash_add && !new_block.is_dummy {
                let leaf: Leaf = ctx.rng.gen_range(0..ctx.num_leaves);
                ctx.position_map.put(new_block.key(), leaf);
            }
            ctx.stash.add_block(new_block);
        }

        if ctx.buffer_ops {
            ctx.processor.read_block_in_batch(batch_keys, batch_blocks)?;
        }
        Ok(())
    }

    /// Refills the bucket: pops up to `Z` stash blocks whose leaf passes
    /// through here, pads with fresh dummies to `Z + S`, shuffles the slot
    /// order, writes every slot, and resets the access counter.
    pub fn write_bucket(&mut self, ctx: &mut BucketCtx<'_>) -> Result<(), OramError> {
        assert!(self.recovered, "writing an unrecovered bucket");

        let mut popped: Vec<Arc<Block>> = Vec::with_capacity(ctx.z);
        ctx.stash.pop_blocks(
            self.level,
            self.index,
            ctx.z,
            ctx.num_levels,
            ctx.position_map,
            &mut popped,
        );

        let mut incoming: Vec<Option<Arc<Block>>> =
            popped.into_iter().map(Some).collect();
        incoming.resize_with(ctx.z + ctx.s, || None);
        // The shuffle is what decouples slot position from stash order; an
        // observer of the written slots must learn nothing from their order.
        incoming.shuffle(ctx.rng);

        self.unread_dummies.clear();
        self.unread_reals.clear();
        self.key_to_offset.clear();
        self.permutation.clear();
        self.slots.clear();

        let mut buffered = Vec::new();
        for (slot, incoming_block) in incoming.into_iter().enumerate() {
            let block = incoming_block.unwrap_or_else(Block::new_dummy);
            if block.is_dummy {
                self.unread_dummies.push(slot);
            } else {
                self.permutation.insert(block.key(), slot);
                self.key_to_offset.insert(block.key(), slot);
                self.unread_reals.push(slot);
            }

            if ctx.write_end_batch {
                assert!(!block.is_stale(), "stale block escaped into a bucket write");
                ctx.delayed.insert(
                    self.partial_key(slot),
                    DelayedWrite {
                        block: Arc::clone(&block),
                        level: self.level,
                        index: self.index,
                        slot,
                    },
                );
                block.set_cached(true);
            } else if ctx.buffer_ops {
                let store_key = self.slot_store_key(slot, ctx);
                buffered.push(ctx.processor.write_block_in_batch(store_key, &block)?);
            } else {
                let store_key = self.slot_store_key(slot, ctx);
                ctx.processor
                    .write_block(self.partial_key(slot), store_key, &block)?;
            }

            block.validate();
            if let Some(maps) = ctx.durable.as_mut() {
                maps.valid.validate(self.level, self.index, slot);
                maps.stale.refresh(self.level, self.index, slot);
            }
            self.slots.push(block);
        }

        self.num_accessed = 0;
        assert_eq!(
            self.unread_dummies.len() + self.unread_reals.len(),
            ctx.z + ctx.s,
            "bucket write left slots unaccounted"
        );

        if ctx.buffer_ops {
            ctx.processor.flush_writes(buffered)?;
        }
        if let Some(maps) = ctx.durable.as_mut() {
            maps.permutation
                .update_permutation(self.level, self.index, self.permutation.clone());
        }
        Ok(())
    }

    /// Marks `key`'s block stale in place, if this bucket holds it. Returns
    /// whether the key was found here (whatever its validity).
    pub fn staleify_block(
        &mut self,
        key: LogicalKey,
        stash: &mut Stash,
        durable: Option<&mut DurableMaps>,
    ) -> bool {
        let offset = match self.key_to_offset.get(&key) {
            Some(&offset) => offset,
            None => return false,
        };
        let block = Arc::clone(&self.slots[offset]);
        if block.is_valid() {
            block.staleify();
            if let Some(maps) = durable {
                maps.stale.staleify(self.level, self.index, offset);
            }
            // A value-less placeholder version lands in the stash so the
            // caller's bookkeeping sees the key; the delete removes it.
            let placeholder = Block::copy_to_new_version(&block);
            placeholder.set_value(None);
            stash.add_block(placeholder);
        }
        true
    }

    /// Rebuilds the client-side view of this bucket from the recovered maps:
    /// the permutation names the real slots, the valid map marks consumed
    /// ones, and the stale map re-flags in-place deletes.
    pub fn recover(
        &mut self,
        maps: &DurableMaps,
        evict_path_count: u32,
        write_end_batch: bool,
    ) -> bool {
        if self.recovered {
            return false;
        }
        self.key_to_offset = maps.permutation.permutation(self.level, self.index);
        let inverted: HashMap<usize, LogicalKey> = self
            .key_to_offset
            .iter()
            .map(|(key, offset)| (*offset, *key))
            .collect();
        let early = maps.early_reshuffle.count(self.level, self.index);
        for slot in 0..self.slots.len() {
            let key = inverted.get(&slot).copied();
            if maps.valid.is_valid(self.level, self.index, slot) {
                if let Some(key) = key {
                    let block = Block::new_real(key, None, 0, true, 0);
                    block.set_physical_key(self.store_key(
                        slot,
                        evict_path_count,
                        early,
                        write_end_batch,
                    ));
                    self.slots[slot] = block;
                    self.unread_dummies.retain(|&i| i != slot);
                    self.unread_reals.push(slot);
                }
                self.slots[slot].validate();
            } else {
                self.unread_dummies.retain(|&i| i != slot);
                self.num_accessed += 1;
            }
            if maps.stale.is_stale(self.level, self.index, slot) {
                self.slots[slot].staleify();
            }
        }
        self.recovered = true;
        true
    }
}

fn fixed_key(level: usize, index: u32, slot: usize) -> PhysicalKey {
    ((level as i64 & 0xFFFF) << 48) | ((index as i64) << 16) | (slot as i64 & 0xFFFF)
}

/// Durable slot addressing: hashes the slot coordinate together with parity
/// of the bucket's write counters. The counter folding (including the mod-3
/// reduction under delayed writes) matches the recovery protocol's
/// expectations exactly; both sides must derive identical keys.
pub(crate) fn durable_store_key(
    level: usize,
    index: u32,
    slot: usize,
    evict_path_count: u32,
    early_reshuffles: u32,
    write_end_batch: bool,
) -> PhysicalKey {
    let mut evict_version = evict_path_count >> level;
    let reversed = index.wrapping_shl(32 - level as u32).reverse_bits();
    if evict_path_count % (1u32 << level) > reversed {
        evict_version += 1;
    }
    let evict_write = if write_end_batch {
        evict_version % 3
    } else {
        evict_version
    };
    let early_write = if write_end_batch {
        early_reshuffles % 3
    } else {
        early_reshuffles
    };

    let mut bytes = [0u8; 20];
    bytes[0..4].copy_from_slice(&(level as i32).to_be_bytes());
    bytes[4..8].copy_from_slice(&(index as i32).to_be_bytes());
    bytes[8..12].copy_from_slice(&(slot as i32).to_be_bytes());
    bytes[12..16].copy_from_slice(&((evict_write % 2) as i32).to_be_bytes());
    bytes[16..20].copy_from_slice(&((early_write % 2) as i32).to_be_bytes());
    hash_persistent(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    // The packed fixed-key layout assumes 64-bit physical keys: 16 bits of
    // level, 32 of index, 16 of slot.
    const_assert_eq!(size_of::<PhysicalKey>(), 8);

    #[test]
    fn fixed_keys_are_unique_across_slots_and_buckets() {
        let mut seen = std::collections::HashSet::new();
        for level in 0..4usize {
            for index in 0..(1u32 << level) {
                for slot in 0..6usize {
                    assert!(seen.insert(fixed_key(level, index, slot)));
                }
            }
        }
    }

    #[test]
    fn durable_keys_change_with_write_counters() {
        let base = durable_store_key(2, 1, 3, 0, 0, true);
        assert_eq!(base, durable_store_key(2, 1, 3, 0, 0, true));
        assert_ne!(base, durable_store_key(2, 1, 3, 4, 0, true));
        assert_ne!(base, durable_store_key(2, 1, 3, 0, 1, true));
        assert_ne!(base, durable_store_key(2, 1, 4, 0, 0, true));
    }

    #[test]
    fn offset_lookup_consumes_dummies_uniformly() {
        let mut bucket = Bucket::new(0, 0, 2, 3, false);
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let offset = bucket
                .get_block_offset(42, &mut rng, false, None)
                .expect("dummies available");
            assert!(seen.insert(offset), "dummy offset consumed twice");
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn all_real_mode_skips_when_exhausted() {
        let mut bucket = Bucket::new(0, 0, 2, 2, false);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(bucket.get_block_offset(42, &mut rng, true, None), None);
        assert_eq!(bucket.num_skipped(), 1);
    }
}
