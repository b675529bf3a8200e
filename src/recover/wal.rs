// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The write-ahead log and epoch checkpoint machinery.
//!
//! One epoch is one write batch. When it completes, the engine persists the
//! position map, the four recovery maps, the stash, and the eviction
//! counter, then the epoch marker; only once the marker lands is the epoch
//! durable. Each map persists either a full snapshot or a diff according to
//! its checkpoint offset in the configured cadence. Large payloads are split
//! into fixed-size strided chunks; sensitive payloads are masked with a
//! keystream seeded by their own physical key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::OramConfig;
use crate::engine::RecoveredState;
use crate::mask::{hash_persistent, RecoveryCipher};
use crate::position_map::PositionMap;
use crate::recover::{DurableMaps, EarlyReshuffleMap, PermutationMap, ReadPath, StaleMap, ValidMap};
use crate::scheduler::WorkerPool;
use crate::stash::Stash;
use crate::store::{AsyncBackingStore, Signal, WriteOp};
use crate::{OramError, PhysicalKey};

const LOGICAL_ACCESS_BASE_KEY: &str = "logical_access";
const POSITION_MAP_BASE_KEY: &str = "position_map";
const VALID_MAP_BASE_KEY: &str = "valid_map";
const STALE_MAP_BASE_KEY: &str = "stale_map";
const EARLY_RESHUFFLE_MAP_BASE_KEY: &str = "early_reshuffle_map";
const PERMUTATION_MAP_BASE_KEY: &str = "permutation_map";
const STASH_BASE_KEY: &str = "stash";
const EVICTED_PATH_COUNT_BASE_KEY: &str = "evicted_path_count";
const LAST_COMPLETED_EPOCH_KEY: &str = "last_completed_epoch";

fn named_key(name: &str) -> PhysicalKey {
    hash_persistent(name.as_bytes())
}

fn epoch_key(base: &str, epoch: i64) -> PhysicalKey {
    hash_persistent(format!("{base}_{epoch}").as_bytes())
}

fn logical_access_key(epoch: i64, index: usize) -> PhysicalKey {
    hash_persistent(format!("{LOGICAL_ACCESS_BASE_KEY}_{epoch}_{index}").as_bytes())
}

fn chunk_key(base_key: PhysicalKey, chunk: usize) -> PhysicalKey {
    hash_persistent(format!("{base_key}_{chunk}").as_bytes())
}

/// Runs an action when the expected number of completions has arrived.
struct Countdown {
    remaining: AtomicUsize,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Countdown {
    fn new(count: usize, action: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        assert!(count > 0);
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            action: Mutex::new(Some(action)),
        })
    }

    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let action = self
                .action
                .lock()
                .take()
                .expect("countdown fired more than once");
            action();
        }
    }
}

struct EpochPayload {
    base_key: PhysicalKey,
    data: Vec<u8>,
    masked: bool,
    strided: bool,
}

pub(crate) struct WriteAheadLog {
    store: Arc<dyn AsyncBackingStore>,
    cipher: Arc<RecoveryCipher>,
    pool: Arc<WorkerPool>,
    tree_levels: usize,
    max_logical_accesses: usize,
    max_blocks: usize,
    bucket_slots: usize,
    z: usize,
    value_size: usize,
    max_stash_size: usize,
    max_stale_changed: usize,
    checkpoint_freq: usize,
    position_map_checkpoint: usize,
    valid_map_checkpoint: usize,
    stale_map_checkpoint: usize,
    permutation_map_checkpoint: usize,
    early_reshuffle_map_checkpoint: usize,
    data_stride: usize,
    last_completed_epoch: i64,
    logical_access_index: usize,
}

impl WriteAheadLog {
    pub fn new(
        store: Arc<dyn AsyncBackingStore>,
        cipher: Arc<RecoveryCipher>,
        pool: Arc<WorkerPool>,
        config: &OramConfig,
        tree_levels: usize,
    ) -> Self {
        Self {
            store,
            cipher,
            pool,
            tree_levels,
            max_logical_accesses: config.total_batch_ops(),
            max_blocks: config.max_blocks,
            bucket_slots: config.bucket_slots(),
            z: config.z,
            value_size: config.value_size,
            max_stash_size: config.durable_max_stash_size,
            max_stale_changed: config.writes_size,
            checkpoint_freq: config.durable_checkpoint_freq,
            position_map_checkpoint: config.durable_checkpoint_position_map,
            valid_map_checkpoint: config.durable_checkpoint_valid_map,
            stale_map_checkpoint: config.durable_checkpoint_stale_map,
            permutation_map_checkpoint: config.durable_checkpoint_permutation_map,
            early_reshuffle_map_checkpoint: config.durable_checkpoint_early_reshuffle_map,
            data_stride: config.durable_max_data_size,
            last_completed_epoch: -1,
            logical_access_index: 0,
        }
    }

    pub fn last_completed_epoch(&self) -> i64 {
        self.last_completed_epoch
    }

    /// The store key for the next read-path log entry of the in-flight epoch.
    pub fn key_for_next_read_path(&mut self) -> PhysicalKey {
        let key = logical_access_key(self.last_completed_epoch + 1, self.logical_access_index);
        self.logical_access_index += 1;
        key
    }

    fn snapshot_due(&self, epoch: i64, offset: usize) -> bool {
        self.last_completed_epoch == -1
            || epoch % self.checkpoint_freq as i64 == offset as i64
    }

    /// The epoch at or before `epoch` at which the map with checkpoint
    /// `offset` last wrote a full snapshot.
    fn last_checkpoint(&self, offset: usize, epoch: i64) -> i64 {
        let freq = self.checkpoint_freq as i64;
        let offset = offset as i64;
        if epoch % freq < offset {
            0.max(epoch - epoch % freq - freq + offset)
        } else {
            epoch - epoch % freq + offset
        }
    }

    /// Persists the epoch's recovery data: six payloads plus the eviction
    /// counter, then the epoch marker. `on_persisted` runs once the marker
    /// write completes; the caller must then invoke [`Self::finish_epoch`].
    pub fn write_epoch(
        &mut self,
        position_map: &mut PositionMap,
        maps: &mut DurableMaps,
        stash: &Stash,
        evict_path_count: u32,
        on_persisted: Box<dyn FnOnce() + Send>,
    ) {
        let epoch = self.last_completed_epoch + 1;
        log::debug!("persisting epoch {epoch}");

        let mut payloads = Vec::with_capacity(7);
        payloads.push(EpochPayload {
            base_key: epoch_key(POSITION_MAP_BASE_KEY, epoch),
            data: if self.snapshot_due(epoch, self.position_map_checkpoint) {
                position_map.serialize()
            } else {
                position_map.diff()
            },
            masked: true,
            strided: true,
        });
        position_map.clear_changed();

        payloads.push(EpochPayload {
            base_key: epoch_key(VALID_MAP_BASE_KEY, epoch),
            data: if self.snapshot_due(epoch, self.valid_map_checkpoint) {
                maps.valid.serialize()
            } else {
                maps.valid.diff()
            },
            masked: false,
            strided: true,
        });
        maps.valid.clear_changed();

        payloads.push(EpochPayload {
            base_key: epoch_key(STALE_MAP_BASE_KEY, epoch),
            data: if self.snapshot_due(epoch, self.stale_map_checkpoint) {
                maps.stale.serialize()
            } else {
                maps.stale.diff()
            },
            masked: true,
            strided: true,
        });
        maps.stale.clear_changed();

        payloads.push(EpochPayload {
            base_key: epoch_key(EARLY_RESHUFFLE_MAP_BASE_KEY, epoch),
            data: if self.snapshot_due(epoch, self.early_reshuffle_map_checkpoint) {
                maps.early_reshuffle.serialize()
            } else {
                maps.early_reshuffle.diff()
            },
            masked: false,
            strided: true,
        });
        maps.early_reshuffle.clear_changed();

        payloads.push(EpochPayload {
            base_key: epoch_key(PERMUTATION_MAP_BASE_KEY, epoch),
            data: if self.snapshot_due(epoch, self.permutation_map_checkpoint) {
                maps.permutation.serialize()
            } else {
                maps.permutation.diff()
            },
            masked: true,
            strided: true,
        });
        maps.permutation.clear_changed();

        payloads.push(EpochPayload {
            base_key: epoch_key(STASH_BASE_KEY, epoch),
            data: stash.serialize(),
            masked: true,
            strided: true,
        });

        payloads.push(EpochPayload {
            base_key: epoch_key(EVICTED_PATH_COUNT_BASE_KEY, epoch),
            data: (evict_path_count as i32).to_be_bytes().to_vec(),
            masked: true,
            strided: false,
        });

        let store = Arc::clone(&self.store);
        let marker_store = Arc::clone(&self.store);
        let all_payloads = Countdown::new(
            payloads.len(),
            Box::new(move || {
                // The epoch marker only lands after every payload is on
                // storage; recovery trusts the marker unconditionally.
                marker_store.write(
                    WriteOp::write(
                        named_key(LAST_COMPLETED_EPOCH_KEY),
                        (epoch as i32).to_be_bytes().to_vec(),
                    ),
                    Box::new(move || on_persisted()),
                );
            }),
        );

        for payload in payloads {
            let store = Arc::clone(&store);
            let cipher = Arc::clone(&self.cipher);
            let stride = self.data_stride;
            let all_payloads = Arc::clone(&all_payloads);
            self.pool.execute(Box::new(move |_| {
                write_payload(&store, &cipher, stride, payload, all_payloads);
            }));
        }
    }

    /// Marks the epoch complete locally and garbage-collects recovery
    /// artifacts the completed epoch made obsolete.
    pub fn finish_epoch(&mut self) {
        self.last_completed_epoch += 1;
        self.logical_access_index = 0;
        log::info!("epoch {} durable", self.last_completed_epoch);
        self.delete_previous_epoch_data();
    }

    fn delete_previous_epoch_data(&self) {
        let last = self.last_completed_epoch;
        let mut deletes = Vec::new();
        for i in 0..self.max_logical_accesses {
            deletes.push(WriteOp::delete(logical_access_key(last, i)));
        }
        deletes.push(WriteOp::delete(epoch_key(STASH_BASE_KEY, last - 1)));

        let maps = [
            (POSITION_MAP_BASE_KEY, self.position_map_checkpoint),
            (VALID_MAP_BASE_KEY, self.valid_map_checkpoint),
            (STALE_MAP_BASE_KEY, self.stale_map_checkpoint),
            (EARLY_RESHUFFLE_MAP_BASE_KEY, self.early_reshuffle_map_checkpoint),
            (PERMUTATION_MAP_BASE_KEY, self.permutation_map_checkpoint),
        ];
        for (base, offset) in maps {
            // Once a fresh checkpoint lands, the previous checkpoint cycle's
            // snapshots and diffs are unreachable.
            if self.last_checkpoint(offset, last) == last {
                let previous = self.last_checkpoint(offset, last - 1);
                for epoch in previous..last {
                    deletes.push(WriteOp::delete(epoch_key(base, epoch)));
                }
            }
        }

        log::debug!("garbage-collecting {} recovery keys", deletes.len());
        self.store.write_many(deletes, Box::new(|| {}));
    }

    fn read_many_blocking(&self, keys: Vec<PhysicalKey>) -> Vec<Option<Vec<u8>>> {
        let signal = Arc::new(Signal::new());
        let tx = Arc::clone(&signal);
        self.store
            .read_many(keys, Box::new(move |values| tx.notify(values)));
        signal.wait()
    }

    /// Loads the recovery state for the last completed epoch, or `None` when
    /// nothing was ever persisted.
    pub fn load_recovery_state(&mut self) -> Result<Option<RecoveredState>, OramError> {
        let marker = self.read_many_blocking(vec![named_key(LAST_COMPLETED_EPOCH_KEY)]);
        let last = match marker.into_iter().next().flatten() {
            Some(bytes) if bytes.len() == 4 => {
                i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
            }
            _ => {
                self.last_completed_epoch = -1;
                log::info!("no completed epoch on storage; starting fresh");
                return Ok(None);
            }
        };
        self.last_completed_epoch = last;
        log::info!("recovering from epoch {last}");

        // First round: the unstrided payloads plus every strided payload's
        // chunk-count header.
        let mut keys = vec![epoch_key(EVICTED_PATH_COUNT_BASE_KEY, last)];
        for i in 0..self.max_logical_accesses {
            keys.push(logical_access_key(last + 1, i));
        }
        keys.push(epoch_key(STASH_BASE_KEY, last));

        let map_ranges: Vec<(&str, i64)> = [
            (POSITION_MAP_BASE_KEY, self.position_map_checkpoint),
            (VALID_MAP_BASE_KEY, self.valid_map_checkpoint),
            (STALE_MAP_BASE_KEY, self.stale_map_checkpoint),
            (
                EARLY_RESHUFFLE_MAP_BASE_KEY,
                self.early_reshuffle_map_checkpoint,
            ),
            (PERMUTATION_MAP_BASE_KEY, self.permutation_map_checkpoint),
        ]
        .into_iter()
        .map(|(base, offset)| (base, self.last_checkpoint(offset, last)))
        .collect();
        for (base, first) in &map_ranges {
            for epoch in *first..=last {
                keys.push(epoch_key(base, epoch));
            }
        }

        let headers = self.read_many_blocking(keys.clone());

        let mut cursor = 0usize;
        let mut next = |count: usize| {
            let range = cursor..cursor + count;
            cursor += count;
            range
        };

        let evict_idx = next(1).start;
        let mut evict_data = headers[evict_idx]
            .clone()
            .unwrap_or_else(|| panic!("eviction counter missing for epoch {last}"));
        self.cipher.mask(&mut evict_data, keys[evict_idx]);
        assert_eq!(evict_data.len(), 4, "eviction counter payload corrupt");
        let evict_path_count =
            i32::from_be_bytes([evict_data[0], evict_data[1], evict_data[2], evict_data[3]]) as u32;

        let mut logical_accesses = Vec::new();
        for i in next(self.max_logical_accesses) {
            match &headers[i] {
                Some(bytes) if !bytes.is_empty() => {
                    let mut data = bytes.clone();
                    self.cipher.mask(&mut data, keys[i]);
                    logical_accesses.push(ReadPath::deserialize(&data, self.tree_levels)?);
                }
                _ => break,
            }
        }
        log::info!(
            "replaying {} logged read paths from the in-flight epoch",
            logical_accesses.len()
        );

        let header_count = |value: &Option<Vec<u8>>, what: &str| -> usize {
            let bytes = value
                .as_ref()
                .unwrap_or_else(|| panic!("{what} header missing for epoch {last}"));
            assert_eq!(bytes.len(), 4, "{what} header corrupt");
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        };

        // Second round: every chunk of every strided payload, in the same
        // order the headers were requested.
        let stash_idx = next(1).start;
        let stash_chunks = header_count(&headers[stash_idx], "stash");
        let mut chunk_keys = Vec::new();
        for i in 0..stash_chunks {
            chunk_keys.push(chunk_key(keys[stash_idx], i));
        }

        let mut map_chunk_counts: Vec<Vec<usize>> = Vec::new();
        let mut map_base_keys: Vec<Vec<PhysicalKey>> = Vec::new();
        for (base, first) in &map_ranges {
            let mut counts = Vec::new();
            let mut bases = Vec::new();
            for i in next((last - first + 1) as usize) {
                let count = header_count(&headers[i], base);
                for c in 0..count {
                    chunk_keys.push(chunk_key(keys[i], c));
                }
                counts.push(count);
                bases.push(keys[i]);
            }
            map_chunk_counts.push(counts);
            map_base_keys.push(bases);
        }

        let chunks = self.read_many_blocking(chunk_keys);
        let mut chunk_cursor = 0usize;
        let mut assemble = |count: usize, base_key: PhysicalKey, masked: bool| -> Vec<u8> {
            let mut data = Vec::new();
            for i in 0..count {
                let mut chunk = chunks[chunk_cursor]
                    .clone()
                    .unwrap_or_else(|| panic!("recovery chunk missing for key {base_key}"));
                if masked {
                    self.cipher.mask(&mut chunk, chunk_key(base_key, i));
                }
                data.extend_from_slice(&chunk);
                chunk_cursor += 1;
            }
            data
        };

        let stash_data = assemble(stash_chunks, keys[stash_idx], true);
        let stash = Stash::deserialize(&stash_data, self.max_stash_size, self.value_size)?;

        let mut position_map: Option<PositionMap> = None;
        for (j, &count) in map_chunk_counts[0].iter().enumerate() {
            let data = assemble(count, map_base_keys[0][j], true);
            match position_map.as_mut() {
                None => {
                    position_map = Some(PositionMap::deserialize(
                        &data,
                        self.max_blocks,
                        self.max_logical_accesses,
                    )?)
                }
                Some(map) => map.apply_diff(&data)?,
            }
        }

        let mut valid: Option<ValidMap> = None;
        for (j, &count) in map_chunk_counts[1].iter().enumerate() {
            let data = assemble(count, map_base_keys[1][j], false);
            match valid.as_mut() {
                None => valid = Some(ValidMap::deserialize(&data, self.bucket_slots)?),
                Some(map) => map.apply_diff(&data)?,
            }
        }

        let mut stale: Option<StaleMap> = None;
        for (j, &count) in map_chunk_counts[2].iter().enumerate() {
            let data = assemble(count, map_base_keys[2][j], true);
            match stale.as_mut() {
                None => {
                    stale = Some(StaleMap::deserialize(
                        &data,
                        self.bucket_slots,
                        self.max_stale_changed,
                    )?)
                }
                Some(map) => map.apply_diff(&data)?,
            }
        }

        let mut early: Option<EarlyReshuffleMap> = None;
        for (j, &count) in map_chunk_counts[3].iter().enumerate() {
            let data = assemble(count, map_base_keys[3][j], false);
            match early.as_mut() {
                None => early = Some(EarlyReshuffleMap::deserialize(&data)?),
                Some(map) => map.apply_diff(&data)?,
            }
        }

        let mut permutation: Option<PermutationMap> = None;
        for (j, &count) in map_chunk_counts[4].iter().enumerate() {
            let data = assemble(count, map_base_keys[4][j], true);
            match permutation.as_mut() {
                None => permutation = Some(PermutationMap::deserialize(&data, self.z)?),
                Some(map) => map.apply_diff(&data)?,
            }
        }

        Ok(Some(RecoveredState {
            position_map: position_map.expect("no position map checkpoint on storage"),
            durable_maps: DurableMaps {
                valid: valid.expect("no valid map checkpoint on storage"),
                stale: stale.expect("no stale map checkpoint on storage"),
                early_reshuffle: early.expect("no early-reshuffle checkpoint on storage"),
                permutation: permutation.expect("no permutation checkpoint on storage"),
            },
            stash,
            evict_path_count,
            logical_accesses,
        }))
    }
}

/// Chunks, masks, and writes one epoch payload, arriving at `all_payloads`
/// once the header and every chunk are on storage. Each chunk's keystream is
/// seeded by its own chunk key, so no pad is ever shared between chunks.
fn write_payload(
    store: &Arc<dyn AsyncBackingStore>,
    cipher: &Arc<RecoveryCipher>,
    stride: usize,
    payload: EpochPayload,
    all_payloads: Arc<Countdown>,
) {
    let EpochPayload {
        base_key,
        mut data,
        masked,
        strided,
    } = payload;

    if !strided {
        if masked {
            cipher.mask(&mut data, base_key);
        }
        let done = all_payloads;
        store.write(
            WriteOp::write(base_key, data),
            Box::new(move || done.arrive()),
        );
        return;
    }

    let chunk_count = (data.len() + stride - 1) / stride;
    let writes_total = chunk_count + 1;
    let payload_done = Countdown::new(
        writes_total,
        Box::new(move || all_payloads.arrive()),
    );

    let header = (chunk_count as i32).to_be_bytes().to_vec();
    let done = Arc::clone(&payload_done);
    store.write(
        WriteOp::write(base_key, header),
        Box::new(move || done.arrive()),
    );
    for (i, chunk) in data.chunks(stride).enumerate() {
        let key = chunk_key(base_key, i);
        let mut chunk = chunk.to_vec();
        if masked {
            cipher.mask(&mut chunk, key);
        }
        let done = Arc::clone(&payload_done);
        store.write(
            WriteOp::write(key, chunk),
            Box::new(move || done.arrive()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wal_for_cadence() -> WriteAheadLog {
        let config = OramConfig {
            durable: true,
            write_end_batch: true,
            ..OramConfig::default()
        };
        let store = Arc::new(crate::store::AsyncOverSync::new(
            crate::store::MemoryStore::new(),
        ));
        let pool = Arc::new(WorkerPool::new(1, config.value_size));
        let cipher = Arc::new(RecoveryCipher::new(&config.client_key).unwrap());
        WriteAheadLog::new(store, cipher, pool, &config, 4)
    }

    #[test]
    fn checkpoint_cadence_finds_the_latest_snapshot() {
        let wal = wal_for_cadence();
        // Frequency 5, position map offset 0: snapshots at 0, 5, 10, ...
        assert_eq!(wal.last_checkpoint(0, 0), 0);
        assert_eq!(wal.last_checkpoint(0, 4), 0);
        assert_eq!(wal.last_checkpoint(0, 5), 5);
        assert_eq!(wal.last_checkpoint(0, 9), 5);
        // Offset 3: snapshots at 3, 8, 13, ...
        assert_eq!(wal.last_checkpoint(3, 2), 0);
        assert_eq!(wal.last_checkpoint(3, 3), 3);
        assert_eq!(wal.last_checkpoint(3, 7), 3);
        assert_eq!(wal.last_checkpoint(3, 8), 8);
    }

    #[test]
    fn read_path_keys_advance_and_reset() {
        let mut wal = wal_for_cadence();
        let first = wal.key_for_next_read_path();
        let second = wal.key_for_next_read_path();
        assert_ne!(first, second);
        wal.finish_epoch();
        // A fresh epoch restarts the sequence under new epoch-scoped names.
        let third = wal.key_for_next_read_path();
        assert_ne!(first, third);
    }
}
