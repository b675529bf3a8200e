// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities: logger setup and mirror-map workload drivers.

use std::collections::HashMap;
use std::sync::Once;

use rand::rngs::StdRng;
use rand::Rng;
use simplelog::{Config, WriteLogger};

use crate::store::{SyncBackingStore, WriteOp};
use crate::{LogicalKey, OramConfig};

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// A deterministic value for a key, sized to the configured value length.
pub(crate) fn value_for(key: LogicalKey, round: u8, value_size: usize) -> Vec<u8> {
    let mut value = vec![0u8; value_size];
    for (i, byte) in value.iter_mut().enumerate() {
        *byte = (key as u8)
            .wrapping_mul(31)
            .wrapping_add(round)
            .wrapping_add(i as u8);
    }
    value
}

/// Per-operation random reads and writes against a mirror map, then a full
/// verification sweep. For configurations without batch-boundary accounting.
pub(crate) fn random_workload<S: SyncBackingStore>(
    oram: &mut S,
    config: &OramConfig,
    keyspace: i64,
    num_operations: usize,
    rng: &mut StdRng,
) {
    let mut mirror: HashMap<LogicalKey, Vec<u8>> = HashMap::new();

    for round in 0..num_operations {
        // Keys are 1-based; key 0 is the dummy sentinel.
        let key = rng.gen_range(1..=keyspace);
        if rng.gen::<bool>() {
            assert_eq!(
                oram.read(key).unwrap(),
                mirror.get(&key).cloned(),
                "round {round}, key {key}"
            );
        } else {
            let value = value_for(key, round as u8, config.value_size);
            oram.write(WriteOp::write(key, value.clone())).unwrap();
            mirror.insert(key, value);
        }
    }

    for (key, value) in &mirror {
        assert_eq!(oram.read(*key).unwrap().as_ref(), Some(value), "key {key}");
    }
}

/// Epoch-shaped workload: each round issues `max_nb_stride` padded read
/// strides and one padded write batch, matching the batch accounting the
/// delayed-write and durability paths expect.
pub(crate) fn epoch_workload<S: SyncBackingStore>(
    oram: &mut S,
    config: &OramConfig,
    keyspace: i64,
    rounds: usize,
    round_offset: u8,
    rng: &mut StdRng,
    mirror: &mut HashMap<LogicalKey, Vec<u8>>,
) {
    for round in 0..rounds {
        // Read strides come first and the write batch closes the round, so
        // the batch-op counter wraps exactly at the write batch's end (which
        // is where the delayed-write flush and epoch completion belong).
        for _ in 0..config.max_nb_stride {
            let keys: Vec<LogicalKey> =
                (0..config.stride_size).map(|_| rng.gen_range(1..=keyspace)).collect();
            let values = oram.read_many(&keys).unwrap();
            for (key, value) in keys.iter().zip(values) {
                assert_eq!(value, mirror.get(key).cloned(), "key {key}");
            }
        }

        let mut writes = Vec::new();
        for _ in 0..config.writes_size {
            let key = rng.gen_range(1..=keyspace);
            let value = value_for(key, round as u8 + round_offset, config.value_size);
            writes.push(WriteOp::write(key, value.clone()));
            mirror.insert(key, value);
        }
        oram.write_many(writes).unwrap();
    }
}

/// Reads every mirrored key back, in strides, and checks the values.
pub(crate) fn verify_mirror<S: SyncBackingStore>(
    oram: &mut S,
    config: &OramConfig,
    mirror: &HashMap<LogicalKey, Vec<u8>>,
) {
    let keys: Vec<LogicalKey> = mirror.keys().copied().collect();
    for chunk in keys.chunks(config.stride_size.max(1)) {
        let values = oram.read_many(chunk).unwrap();
        for (key, value) in chunk.iter().zip(values) {
            assert_eq!(value.as_ref(), mirror.get(key), "key {key}");
        }
    }
}
