// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The durable counterpart of every bucket's key→offset table.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::recover::bucket_map_key;
use crate::{LogicalKey, OramError};

/// Per-bucket permutations of real keys to slot offsets, replaced wholesale
/// whenever a bucket is written. Each persisted permutation is padded to Z
/// entries so the layout leaks nothing about bucket occupancy.
#[derive(Clone)]
pub(crate) struct PermutationMap {
    z: usize,
    map: HashMap<u64, HashMap<LogicalKey, usize>>,
    changed: HashSet<u64>,
}

impl PermutationMap {
    pub fn new(z: usize) -> Self {
        Self {
            z,
            map: HashMap::new(),
            changed: HashSet::new(),
        }
    }

    pub fn update_permutation(
        &mut self,
        level: usize,
        index: u32,
        permutation: HashMap<LogicalKey, usize>,
    ) {
        assert!(permutation.len() <= self.z, "bucket holds more than Z real keys");
        let key = bucket_map_key(level, index);
        self.map.insert(key, permutation);
        self.changed.insert(key);
    }

    pub fn permutation(&self, level: usize, index: u32) -> HashMap<LogicalKey, usize> {
        self.map
            .get(&bucket_map_key(level, index))
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    pub fn serialize(&self) -> Vec<u8> {
        Self::serialize_entries(self.map.iter(), self.map.len(), self.z)
    }

    pub fn diff(&self) -> Vec<u8> {
        Self::serialize_entries(
            self.changed.iter().map(|k| (k, &self.map[k])),
            self.changed.len(),
            self.z,
        )
    }

    fn serialize_entries<'a>(
        entries: impl Iterator<Item = (&'a u64, &'a HashMap<LogicalKey, usize>)>,
        count: usize,
        z: usize,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + count * (8 + z * 13));
        out.extend_from_slice(&(count as i32).to_be_bytes());
        for (bucket, permutation) in entries {
            out.extend_from_slice(&(*bucket as i64).to_be_bytes());
            let mut written = 0;
            for (key, offset) in permutation {
                out.push(1);
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&(*offset as i32).to_be_bytes());
                written += 1;
            }
            for _ in written..z {
                out.push(0);
                out.extend_from_slice(&0i64.to_be_bytes());
                out.extend_from_slice(&0i32.to_be_bytes());
            }
        }
        out
    }

    pub fn deserialize(data: &[u8], z: usize) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let entries = cursor.read_i32::<BigEndian>()? as usize;
        let mut map = HashMap::with_capacity(entries);
        for _ in 0..entries {
            let bucket = cursor.read_i64::<BigEndian>()? as u64;
            let mut permutation = HashMap::with_capacity(z);
            for _ in 0..z {
                let present = cursor.read_u8()? != 0;
                let key = cursor.read_i64::<BigEndian>()?;
                let offset = cursor.read_i32::<BigEndian>()? as usize;
                if present {
                    permutation.insert(key, offset);
                }
            }
            map.insert(bucket, permutation);
        }
        Ok(Self {
            z,
            map,
            changed: HashSet::new(),
        })
    }

    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<(), OramError> {
        let decoded = Self::deserialize(diff, self.z)?;
        self.map.extend(decoded.map);
        self.clear_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(entries: &[(LogicalKey, usize)]) -> HashMap<LogicalKey, usize> {
        entries.iter().copied().collect()
    }

    #[test]
    fn updates_replace_wholesale() {
        let mut map = PermutationMap::new(4);
        map.update_permutation(1, 2, perm(&[(10, 0), (11, 3)]));
        map.update_permutation(1, 2, perm(&[(12, 1)]));
        assert_eq!(map.permutation(1, 2), perm(&[(12, 1)]));
        assert!(map.permutation(0, 0).is_empty());
    }

    #[test]
    fn snapshot_round_trips() {
        let mut map = PermutationMap::new(4);
        map.update_permutation(0, 0, perm(&[(1, 2)]));
        map.update_permutation(2, 3, perm(&[(5, 0), (6, 1), (7, 2), (8, 3)]));
        let restored = PermutationMap::deserialize(&map.serialize(), 4).unwrap();
        assert_eq!(restored.permutation(0, 0), perm(&[(1, 2)]));
        assert_eq!(
            restored.permutation(2, 3),
            perm(&[(5, 0), (6, 1), (7, 2), (8, 3)])
        );
    }

    #[test]
    fn diff_round_trips_onto_a_stale_clone() {
        let mut map = PermutationMap::new(4);
        map.update_permutation(1, 1, perm(&[(1, 0)]));
        let mut stale = map.clone();
        map.clear_changed();

        map.update_permutation(1, 1, perm(&[(2, 2)]));
        map.update_permutation(3, 0, perm(&[(3, 1)]));
        stale.apply_diff(&map.diff()).unwrap();
        assert_eq!(stale.permutation(1, 1), perm(&[(2, 2)]));
        assert_eq!(stale.permutation(3, 0), perm(&[(3, 1)]));
    }
}
