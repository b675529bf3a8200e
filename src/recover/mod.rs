// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Durable recovery state: the per-slot and per-bucket maps that mirror the
//! tree's physical condition, the read-path log entries, and the write-ahead
//! log that persists all of it at every epoch boundary.

mod early_reshuffle_map;
mod permutation_map;
mod read_path;
mod stale_map;
mod valid_map;
mod wal;

pub(crate) use early_reshuffle_map::EarlyReshuffleMap;
pub(crate) use permutation_map::PermutationMap;
pub(crate) use read_path::ReadPath;
pub(crate) use stale_map::StaleMap;
pub(crate) use valid_map::ValidMap;
pub(crate) use wal::WriteAheadLog;

/// Identifies one logged read path within an epoch; physical reads that the
/// access schedules are ordered after the log entry's own write.
pub(crate) type LogEntryId = u64;

/// Packs a bucket coordinate into the key space the per-bucket maps use.
pub(crate) fn bucket_map_key(level: usize, index: u32) -> u64 {
    ((level as u64) << 32) | index as u64
}

/// The recovery maps the engine maintains inline with every bucket
/// operation. Grouped so bucket and engine code can thread one handle.
pub(crate) struct DurableMaps {
    pub valid: ValidMap,
    pub stale: StaleMap,
    pub early_reshuffle: EarlyReshuffleMap,
    pub permutation: PermutationMap,
}

impl DurableMaps {
    pub fn new(levels: usize, bucket_slots: usize, z: usize, max_stale_changed: usize) -> Self {
        Self {
            valid: ValidMap::new(levels, bucket_slots),
            stale: StaleMap::new(levels, bucket_slots, max_stale_changed),
            early_reshuffle: EarlyReshuffleMap::new(),
            permutation: PermutationMap::new(z),
        }
    }

    pub fn clear_changed(&mut self) {
        self.valid.clear_changed();
        self.stale.clear_changed();
        self.early_reshuffle.clear_changed();
        self.permutation.clear_changed();
    }
}
