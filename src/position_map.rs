// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The position map: logical key to current leaf assignment.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::{Leaf, LogicalKey, OramError};

/// Maps every live key to the random leaf it is currently assigned to, and
/// tracks which keys changed since the last checkpoint so an epoch can
/// persist an incremental diff. Snapshot and diff layouts are padded to a
/// fixed entry count so their ciphertext sizes are data-independent.
#[derive(Clone)]
pub(crate) struct PositionMap {
    map: HashMap<LogicalKey, Leaf>,
    max_keys: usize,
    max_changed: usize,
    changed: HashSet<LogicalKey>,
}

impl PositionMap {
    pub fn new(max_keys: usize, max_changed: usize) -> Self {
        Self {
            map: HashMap::with_capacity(max_keys),
            max_keys,
            max_changed,
            changed: HashSet::with_capacity(max_changed),
        }
    }

    /// Assigns `key` to `leaf`, returning the previous assignment. This is
    /// the atomic swap at the heart of every real access.
    pub fn put(&mut self, key: LogicalKey, leaf: Leaf) -> Option<Leaf> {
        let prev = self.map.insert(key, leaf);
        if prev != Some(leaf) {
            self.changed.insert(key);
        }
        prev
    }

    pub fn get(&self, key: LogicalKey) -> Option<Leaf> {
        self.map.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.max_keys * (1 + 8 + 4));
        out.extend_from_slice(&(self.max_keys as i32).to_be_bytes());
        let mut written = 0;
        for (key, leaf) in &self.map {
            out.push(1);
            out.extend_from_slice(&key.to_be_bytes());
            out.extend_from_slice(&(*leaf as i32).to_be_bytes());
            written += 1;
        }
        for _ in written..self.max_keys {
            out.push(0);
            out.extend_from_slice(&0i64.to_be_bytes());
            out.extend_from_slice(&0i32.to_be_bytes());
        }
        out
    }

    pub fn deserialize(
        data: &[u8],
        max_keys: usize,
        max_changed: usize,
    ) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let entries = cursor.read_i32::<BigEndian>()? as usize;
        let mut map = Self::new(max_keys, max_changed);
        for _ in 0..entries {
            if cursor.read_u8()? == 0 {
                break;
            }
            let key = cursor.read_i64::<BigEndian>()?;
            let leaf = cursor.read_i32::<BigEndian>()? as Leaf;
            map.put(key, leaf);
        }
        map.clear_changed();
        Ok(map)
    }

    /// Serializes only the entries whose assignment changed since the last
    /// `clear_changed`, padded to one batch worth of entries.
    pub fn diff(&self) -> Vec<u8> {
        assert!(
            self.changed.len() <= self.max_changed,
            "position map changed {} entries in one epoch (bound {})",
            self.changed.len(),
            self.max_changed
        );
        let mut out = Vec::with_capacity(self.max_changed * (1 + 8 + 4));
        let mut written = 0;
        for key in &self.changed {
            let leaf = self.map[key];
            out.push(1);
            out.extend_from_slice(&key.to_be_bytes());
            out.extend_from_slice(&(leaf as i32).to_be_bytes());
            written += 1;
        }
        for _ in written..self.max_changed {
            out.push(0);
            out.extend_from_slice(&0i64.to_be_bytes());
            out.extend_from_slice(&0i32.to_be_bytes());
        }
        out
    }

    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<(), OramError> {
        let mut cursor = Cursor::new(diff);
        for _ in 0..self.max_changed {
            if cursor.read_u8()? == 0 {
                break;
            }
            let key = cursor.read_i64::<BigEndian>()?;
            let leaf = cursor.read_i32::<BigEndian>()? as Leaf;
            self.map.insert(key, leaf);
        }
        self.clear_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_swaps_and_tracks_changes() {
        let mut map = PositionMap::new(16, 8);
        assert_eq!(map.put(1, 5), None);
        assert_eq!(map.put(1, 6), Some(5));
        assert_eq!(map.get(1), Some(6));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn rewriting_the_same_leaf_is_not_a_change() {
        let mut map = PositionMap::new(16, 8);
        map.put(1, 5);
        map.clear_changed();
        map.put(1, 5);
        // An empty diff decodes as no entries.
        let mut clone = map.clone();
        clone.apply_diff(&map.diff()).unwrap();
        assert_eq!(clone.get(1), Some(5));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut map = PositionMap::new(16, 8);
        for key in 1..=10i64 {
            map.put(key, (key * 3) as Leaf);
        }
        let restored = PositionMap::deserialize(&map.serialize(), 16, 8).unwrap();
        for key in 1..=10i64 {
            assert_eq!(restored.get(key), Some((key * 3) as Leaf));
        }
    }

    #[test]
    fn diff_round_trips_onto_a_stale_clone() {
        let mut map = PositionMap::new(16, 8);
        for key in 1..=6i64 {
            map.put(key, key as Leaf);
        }
        let mut stale = map.clone();
        map.clear_changed();

        map.put(2, 20);
        map.put(4, 40);
        stale.apply_diff(&map.diff()).unwrap();
        for key in 1..=6i64 {
            assert_eq!(stale.get(key), map.get(key), "key {key}");
        }
    }
}
