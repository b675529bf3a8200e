// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The write-ahead log entry for one read access.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::{Leaf, LogicalKey, OramError};

/// One logged read path: the key accessed (or the dummy sentinel), the leaf
/// that was read, the fresh leaf the key was remapped to, and the slot offset
/// chosen at each level. Persisted before the access's physical reads may be
/// considered committed; replayed verbatim during recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReadPath {
    pub key: LogicalKey,
    pub old_path: Leaf,
    pub new_path: Leaf,
    pub dummy: bool,
    pub indices_accessed: Vec<i32>,
}

impl ReadPath {
    pub fn new(key: LogicalKey, old_path: Leaf, new_path: Leaf, dummy: bool) -> Self {
        Self {
            key,
            old_path,
            new_path,
            dummy,
            indices_accessed: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 4 + 4 + 1 + self.indices_accessed.len() * 4);
        out.extend_from_slice(&self.key.to_be_bytes());
        out.extend_from_slice(&(self.old_path as i32).to_be_bytes());
        out.extend_from_slice(&(self.new_path as i32).to_be_bytes());
        out.push(u8::from(self.dummy));
        for index in &self.indices_accessed {
            out.extend_from_slice(&index.to_be_bytes());
        }
        out
    }

    pub fn deserialize(data: &[u8], tree_levels: usize) -> Result<Self, OramError> {
        let mut cursor = Cursor::new(data);
        let key = cursor.read_i64::<BigEndian>()?;
        let old_path = cursor.read_i32::<BigEndian>()? as Leaf;
        let new_path = cursor.read_i32::<BigEndian>()? as Leaf;
        let dummy = cursor.read_u8()? == 1;
        let mut entry = Self::new(key, old_path, new_path, dummy);
        for _ in 0..tree_levels {
            entry.indices_accessed.push(cursor.read_i32::<BigEndian>()?);
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_round_trip() {
        let mut entry = ReadPath::new(42, 3, 6, false);
        entry.indices_accessed = vec![0, -1, 7, 2];
        let restored = ReadPath::deserialize(&entry.serialize(), 4).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn dummy_flag_survives() {
        let mut entry = ReadPath::new(0, 1, 0, true);
        entry.indices_accessed = vec![5, 5];
        let restored = ReadPath::deserialize(&entry.serialize(), 2).unwrap();
        assert!(restored.dummy);
        assert_eq!(restored.indices_accessed, vec![5, 5]);
    }
}
