// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side stash: real blocks temporarily resident in no bucket.

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::block::Block;
use crate::position_map::PositionMap;
use crate::{Leaf, LogicalKey, OramError};
use std::sync::Arc;

/// Overflow buffer for blocks in flight between tree positions.
///
/// A block is in at most one of the stash or a bucket slot, never both; the
/// durable configuration bounds the stash size and treats exceeding the bound
/// as fatal (its checkpoint layout is padded to exactly that bound).
pub(crate) struct Stash {
    key_to_block: HashMap<LogicalKey, Arc<Block>>,
    max_stash_size: usize,
    value_size: usize,
}

impl Stash {
    pub fn new(max_stash_size: usize, value_size: usize) -> Self {
        Self {
            key_to_block: HashMap::new(),
            max_stash_size,
            value_size,
        }
    }

    /// Pops up to `z` blocks whose current leaf assignment passes through the
    /// bucket at (`level`, `index`), appending them to `out`.
    pub fn pop_blocks(
        &mut self,
        level: usize,
        index: u32,
        z: usize,
        num_levels: usize,
        position_map: &PositionMap,
        out: &mut Vec<Arc<Block>>,
    ) {
        for block in self.key_to_block.values() {
            let path: Leaf = match position_map.get(block.key()) {
                Some(path) => path,
                None => panic!(
                    "stash block {} has no position map entry",
                    block.key()
                ),
            };
            if path >> (num_levels - level) == index {
                out.push(Arc::clone(block));
                if out.len() == z {
                    break;
                }
            }
        }
        for block in out.iter() {
            self.key_to_block.remove(&block.key());
        }
    }

    /// Adds a block to the stash. Dummy and stale blocks are not stashed.
    pub fn add_block(&mut self, block: Arc<Block>) {
        if !block.is_dummy && !block.is_stale() {
            let existing = self.key_to_block.insert(block.key(), block);
            assert!(existing.is_none(), "stash already held a live version");
        }
    }

    pub fn delete_block(&mut self, key: LogicalKey) {
        let removed = self.key_to_block.remove(&key);
        assert!(removed.is_some(), "deleting key {key} absent from the stash");
    }

    pub fn get_block(&self, key: LogicalKey) -> Option<&Arc<Block>> {
        self.key_to_block.get(&key)
    }

    pub fn len(&self) -> usize {
        self.key_to_block.len()
    }

    /// Checkpoint layout: a count header, then exactly `max_stash_size`
    /// entries of `present(u8) | key(i64) | value`, absent entries zeroed.
    /// The padding keeps the ciphertext length independent of occupancy.
    pub fn serialize(&self) -> Vec<u8> {
        assert!(
            self.key_to_block.len() <= self.max_stash_size,
            "stash size {} exceeds durable bound {}",
            self.key_to_block.len(),
            self.max_stash_size
        );
        let mut out =
            Vec::with_capacity(4 + self.max_stash_size * (1 + 8 + self.value_size));
        out.extend_from_slice(&(self.max_stash_size as i32).to_be_bytes());
        let zeroes = vec![0u8; self.value_size];
        let mut written = 0;
        for (key, block) in &self.key_to_block {
            let value = block
                .value_clone()
                .unwrap_or_else(|| panic!("checkpointing stash block {key} with no value"));
            out.push(1);
            out.extend_from_slice(&key.to_be_bytes());
            out.extend_from_slice(&value);
            written += 1;
        }
        for _ in written..self.max_stash_size {
            out.push(0);
            out.extend_from_slice(&0i64.to_be_bytes());
            out.extend_from_slice(&zeroes);
        }
        out
    }

    pub fn deserialize(
        data: &[u8],
        max_stash_size: usize,
        value_size: usize,
    ) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let entries = cursor.read_i32::<BigEndian>()? as usize;
        let mut stash = Self::new(max_stash_size, value_size);
        for _ in 0..entries {
            if cursor.read_u8()? == 0 {
                break;
            }
            let key = cursor.read_i64::<BigEndian>()?;
            let mut value = vec![0u8; value_size];
            std::io::Read::read_exact(&mut cursor, &mut value)?;
            stash.add_block(Block::new_real(key, Some(value), 0, true, 0));
        }
        Ok(stash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(key: LogicalKey) -> Arc<Block> {
        Block::new_real(key, Some(vec![key as u8; 16]), 0, true, 0)
    }

    #[test]
    fn dummy_and_stale_blocks_are_not_stashed() {
        let mut stash = Stash::new(10, 16);
        stash.add_block(Block::new_dummy());
        let stale = real(3);
        stale.staleify();
        stash.add_block(stale);
        assert_eq!(stash.len(), 0);

        stash.add_block(real(4));
        assert_eq!(stash.len(), 1);
        assert!(stash.get_block(4).is_some());
        stash.delete_block(4);
        assert_eq!(stash.len(), 0);
    }

    #[test]
    fn pop_blocks_selects_by_path_prefix() {
        let mut stash = Stash::new(10, 16);
        let mut positions = PositionMap::new(16, 8);
        // num_levels = 3: paths are 3-bit, level-1 bucket index is path >> 2.
        positions.put(1, 0b100);
        positions.put(2, 0b011);
        positions.put(3, 0b111);
        stash.add_block(real(1));
        stash.add_block(real(2));
        stash.add_block(real(3));

        let mut out = Vec::new();
        stash.pop_blocks(1, 1, 4, 3, &positions, &mut out);
        let mut keys: Vec<_> = out.iter().map(|b| b.key()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 3]);
        assert_eq!(stash.len(), 1);
    }

    #[test]
    fn checkpoint_round_trips_and_pads() {
        let mut stash = Stash::new(5, 16);
        stash.add_block(real(10));
        stash.add_block(real(11));
        let bytes = stash.serialize();
        assert_eq!(bytes.len(), 4 + 5 * (1 + 8 + 16));

        let restored = Stash::deserialize(&bytes, 5, 16).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(
            restored.get_block(10).unwrap().value_clone().unwrap(),
            vec![10u8; 16]
        );
        assert_eq!(
            restored.get_block(11).unwrap().value_clone().unwrap(),
            vec![11u8; 16]
        );
    }
}
