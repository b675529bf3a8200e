// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Benchmarks for the `ring-oram` crate.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ring_oram::store::{MemoryStore, SyncBackingStore, WriteOp};
use ring_oram::{OramConfig, SyncRingOram};

const CAPACITIES_TO_BENCHMARK: [usize; 2] = [1 << 10, 1 << 14];
const VALUE_SIZE: usize = 256;

fn benchmark_config(max_blocks: usize) -> OramConfig {
    OramConfig {
        max_blocks,
        z: 8,
        s: 12,
        a: 8,
        value_size: VALUE_SIZE,
        nonce_len: 8,
        write_without_read: true,
        write_end_batch: true,
        pad_batches: false,
        stride_size: 1000,
        writes_size: 1000,
        max_nb_stride: 4,
        client_key: vec![0xa5; 16],
        ..OramConfig::default()
    }
}

fn loaded_oram(max_blocks: usize) -> (SyncRingOram, StdRng) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut oram = SyncRingOram::create(
        benchmark_config(max_blocks),
        Box::new(MemoryStore::new()),
        StdRng::seed_from_u64(1),
    )
    .unwrap();
    for key in 1..=(max_blocks as i64 / 2) {
        let mut value = vec![0u8; VALUE_SIZE];
        rng.fill(value.as_mut_slice());
        oram.write(WriteOp::write(key, value)).unwrap();
    }
    (oram, rng)
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    for capacity in CAPACITIES_TO_BENCHMARK {
        let (mut oram, mut rng) = loaded_oram(capacity);
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let key = rng.gen_range(1..=(capacity as i64 / 2));
                    oram.read(key).unwrap()
                })
            },
        );
    }
    group.finish();
}

fn benchmark_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    for capacity in CAPACITIES_TO_BENCHMARK {
        let (mut oram, mut rng) = loaded_oram(capacity);
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let key = rng.gen_range(1..=(capacity as i64 / 2));
                    let mut value = vec![0u8; VALUE_SIZE];
                    rng.fill(value.as_mut_slice());
                    oram.write(WriteOp::write(key, value)).unwrap()
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_secs(2))
        .sample_size(10);
    targets = benchmark_read, benchmark_write
);
criterion_main!(benches);
