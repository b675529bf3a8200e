// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! One validity bit per (bucket, slot).

use std::collections::HashSet;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::OramError;

/// Tracks which physical slots still hold unread content. A set bit means
/// the slot has been consumed since its bucket was last written. Diffs carry
/// only the changed words.
#[derive(Clone)]
pub(crate) struct ValidMap {
    bucket_slots: usize,
    bits: Vec<u32>,
    changed: HashSet<usize>,
}

const WORD_BITS: usize = 32;

impl ValidMap {
    pub fn new(levels: usize, bucket_slots: usize) -> Self {
        let slots = ((1usize << levels) - 1) * bucket_slots;
        Self {
            bucket_slots,
            bits: vec![0u32; (slots + WORD_BITS - 1) / WORD_BITS],
            changed: HashSet::new(),
        }
    }

    fn slot_bit(&self, level: usize, index: u32, slot: usize) -> usize {
        (((1usize << level) - 1) + index as usize) * self.bucket_slots + slot
    }

    pub fn invalidate(&mut self, level: usize, index: u32, slot: usize) {
        let bit = self.slot_bit(level, index, slot);
        self.bits[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        self.changed.insert(bit / WORD_BITS);
    }

    pub fn validate(&mut self, level: usize, index: u32, slot: usize) {
        let bit = self.slot_bit(level, index, slot);
        self.bits[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        self.changed.insert(bit / WORD_BITS);
    }

    pub fn is_valid(&self, level: usize, index: u32, slot: usize) -> bool {
        let bit = self.slot_bit(level, index, slot);
        self.bits[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) == 0
    }

    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bits.len() * 4);
        out.extend_from_slice(&(self.bits.len() as i32).to_be_bytes());
        for word in &self.bits {
            out.extend_from_slice(&(*word as i32).to_be_bytes());
        }
        out
    }

    pub fn deserialize(data: &[u8], bucket_slots: usize) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let words = cursor.read_i32::<BigEndian>()? as usize;
        let mut bits = vec![0u32; words];
        for word in bits.iter_mut() {
            *word = cursor.read_i32::<BigEndian>()? as u32;
        }
        Ok(Self {
            bucket_slots,
            bits,
            changed: HashSet::new(),
        })
    }

    pub fn diff(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.changed.len() * 8);
        out.extend_from_slice(&(self.changed.len() as i32).to_be_bytes());
        for word_index in &self.changed {
            out.extend_from_slice(&(*word_index as i32).to_be_bytes());
            out.extend_from_slice(&(self.bits[*word_index] as i32).to_be_bytes());
        }
        out
    }

    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<(), OramError> {
        let mut cursor = Cursor::new(diff);
        let entries = cursor.read_i32::<BigEndian>()? as usize;
        for _ in 0..entries {
            let word_index = cursor.read_i32::<BigEndian>()? as usize;
            let word = cursor.read_i32::<BigEndian>()? as u32;
            self.bits[word_index] = word;
        }
        self.clear_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_start_valid_and_toggle() {
        let mut map = ValidMap::new(3, 6);
        assert!(map.is_valid(2, 3, 5));
        map.invalidate(2, 3, 5);
        assert!(!map.is_valid(2, 3, 5));
        assert!(map.is_valid(2, 3, 4));
        map.validate(2, 3, 5);
        assert!(map.is_valid(2, 3, 5));
    }

    #[test]
    fn diff_round_trips_onto_a_stale_clone() {
        let mut map = ValidMap::new(4, 6);
        let mut stale = map.clone();
        map.clear_changed();

        map.invalidate(0, 0, 1);
        map.invalidate(3, 7, 0);
        stale.apply_diff(&map.diff()).unwrap();
        assert!(!stale.is_valid(0, 0, 1));
        assert!(!stale.is_valid(3, 7, 0));
        assert!(stale.is_valid(1, 0, 0));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut map = ValidMap::new(4, 6);
        map.invalidate(1, 1, 2);
        let restored = ValidMap::deserialize(&map.serialize(), 6).unwrap();
        assert!(!restored.is_valid(1, 1, 2));
        assert!(restored.is_valid(1, 1, 3));
    }
}
