// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Per-bucket counters of early reshuffles since the last eviction.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::recover::bucket_map_key;
use crate::OramError;

/// Counts how many times each bucket was reshuffled early since the eviction
/// path last rewrote it. The counter feeds the durable physical-key
/// derivation, so recovery must see the same counts the crashed engine used.
/// Buckets at count zero are simply absent.
#[derive(Clone, Default)]
pub(crate) struct EarlyReshuffleMap {
    map: HashMap<u64, u32>,
    changed: HashSet<u64>,
}

impl EarlyReshuffleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, level: usize, index: u32) {
        let key = bucket_map_key(level, index);
        *self.map.entry(key).or_insert(0) += 1;
        self.changed.insert(key);
    }

    /// An eviction rewrote the bucket; its early-reshuffle count restarts.
    pub fn reset(&mut self, level: usize, index: u32) {
        let key = bucket_map_key(level, index);
        self.map.remove(&key);
        self.changed.remove(&key);
    }

    pub fn count(&self, level: usize, index: u32) -> u32 {
        self.map
            .get(&bucket_map_key(level, index))
            .copied()
            .unwrap_or(0)
    }

    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    pub fn serialize(&self) -> Vec<u8> {
        Self::serialize_entries(self.map.iter().map(|(k, v)| (*k, *v)), self.map.len())
    }

    pub fn diff(&self) -> Vec<u8> {
        Self::serialize_entries(
            self.changed.iter().map(|k| (*k, self.map[k])),
            self.changed.len(),
        )
    }

    fn serialize_entries(entries: impl Iterator<Item = (u64, u32)>, count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + count * 12);
        out.extend_from_slice(&(count as i32).to_be_bytes());
        for (key, value) in entries {
            out.extend_from_slice(&(key as i64).to_be_bytes());
            out.extend_from_slice(&(value as i32).to_be_bytes());
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let entries = cursor.read_i32::<BigEndian>()? as usize;
        let mut map = HashMap::with_capacity(entries);
        for _ in 0..entries {
            let key = cursor.read_i64::<BigEndian>()? as u64;
            let value = cursor.read_i32::<BigEndian>()? as u32;
            map.insert(key, value);
        }
        Ok(Self {
            map,
            changed: HashSet::new(),
        })
    }

    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<(), OramError> {
        let decoded = Self::deserialize(diff)?;
        self.map.extend(decoded.map);
        self.clear_changed();
        Ok(())
    }
}
