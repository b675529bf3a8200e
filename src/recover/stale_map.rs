// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! One staleness bit per (bucket, slot).

use std::collections::HashSet;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::OramError;

/// Tracks slots whose block was deleted in place without a read/evict round
/// trip; reads skip a stale slot as if it were absent. Only deletes flip
/// these bits, so a diff is padded to one write batch worth of entries
/// (its ciphertext size must not reveal how many deletes an epoch carried).
#[derive(Clone)]
pub(crate) struct StaleMap {
    bucket_slots: usize,
    bits: Vec<u32>,
    max_stale_changed: usize,
    changed: HashSet<usize>,
}

const WORD_BITS: usize = 32;

impl StaleMap {
    pub fn new(levels: usize, bucket_slots: usize, max_stale_changed: usize) -> Self {
        let slots = ((1usize << levels) - 1) * bucket_slots;
        Self {
            bucket_slots,
            bits: vec![0u32; (slots + WORD_BITS - 1) / WORD_BITS],
            max_stale_changed,
            changed: HashSet::with_capacity(max_stale_changed),
        }
    }

    fn slot_bit(&self, level: usize, index: u32, slot: usize) -> usize {
        (((1usize << level) - 1) + index as usize) * self.bucket_slots + slot
    }

    pub fn staleify(&mut self, level: usize, index: u32, slot: usize) {
        let bit = self.slot_bit(level, index, slot);
        self.bits[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        self.changed.insert(bit / WORD_BITS);
    }

    /// Clears the bit when the slot is rewritten with fresh content.
    pub fn refresh(&mut self, level: usize, index: u32, slot: usize) {
        let bit = self.slot_bit(level, index, slot);
        self.bits[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        self.changed.insert(bit / WORD_BITS);
    }

    pub fn is_stale(&self, level: usize, index: u32, slot: usize) -> bool {
        let bit = self.slot_bit(level, index, slot);
        self.bits[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
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

    pub fn deserialize(
        data: &[u8],
        bucket_slots: usize,
        max_stale_changed: usize,
    ) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let words = cursor.read_i32::<BigEndian>()? as usize;
        let mut bits = vec![0u32; words];
        for word in bits.iter_mut() {
            *word = cursor.read_i32::<BigEndian>()? as u32;
        }
        Ok(Self {
            bucket_slots,
            bits,
            max_stale_changed,
            changed: HashSet::with_capacity(max_stale_changed),
        })
    }

    pub fn diff(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.max_stale_changed * 9);
        out.extend_from_slice(&(self.changed.len() as i32).to_be_bytes());
        let mut written = 0;
        for word_index in &self.changed {
            out.push(1);
            out.extend_from_slice(&(*word_index as i32).to_be_bytes());
            out.extend_from_slice(&(self.bits[*word_index] as i32).to_be_bytes());
            written += 1;
        }
        for _ in written..self.max_stale_changed {
            out.push(0);
            out.extend_from_slice(&0i32.to_be_bytes());
            out.extend_from_slice(&0i32.to_be_bytes());
        }
        out
    }

    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<(), OramError> {
        let mut cursor = Cursor::new(diff);
        let entries = cursor.read_i32::<BigEndian>()? as usize;
        for _ in 0..entries {
            if cursor.read_u8()? == 0 {
                break;
            }
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
    fn staleify_and_refresh_toggle_bits() {
        let mut map = StaleMap::new(3, 6, 8);
        assert!(!map.is_stale(1, 0, 3));
        map.staleify(1, 0, 3);
        assert!(map.is_stale(1, 0, 3));
        map.refresh(1, 0, 3);
        assert!(!map.is_stale(1, 0, 3));
    }

    #[test]
    fn diff_is_padded_to_the_write_batch_bound() {
        let mut map = StaleMap::new(3, 6, 8);
        map.clear_changed();
        map.staleify(2, 1, 0);
        let diff = map.diff();
        assert_eq!(diff.len(), 4 + 8 * 9);
    }

    #[test]
    fn diff_round_trips_onto_a_stale_clone() {
        let mut map = StaleMap::new(3, 6, 8);
        let mut old = map.clone();
        map.clear_changed();

        map.staleify(2, 2, 4);
        map.staleify(0, 0, 0);
        old.apply_diff(&map.diff()).unwrap();
        assert!(old.is_stale(2, 2, 4));
        assert!(old.is_stale(0, 0, 0));
        assert!(!old.is_stale(2, 2, 3));
    }
}
