// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A Ring ORAM storage engine.
//!
//! The engine stores fixed-size value blocks for `i64` logical keys on an
//! untrusted key/value backing store while hiding, from an observer of all
//! storage traffic, which logical keys are accessed and which physical
//! addresses change. Accesses are grouped into padded read strides and a
//! padded write batch; one write batch bounds an epoch. With durability
//! enabled, every epoch persists the engine's recovery metadata to the same
//! backing store so that a crashed engine can be rebuilt and the in-flight
//! epoch replayed from its logged read paths.
//!
//! Two front ends share one core algorithm: [`SyncRingOram`] drives the
//! backing store with blocking calls, and [`AsyncRingOram`] pipelines the
//! physical I/O of each batch through a dependency-scheduled worker pool.

use thiserror::Error;

pub mod config;
pub mod store;

mod async_oram;
mod block;
mod bucket;
mod engine;
mod mask;
mod position_map;
mod processor;
mod recover;
mod scheduler;
mod stash;
mod sync_oram;

#[cfg(test)]
mod test_utils;

pub use async_oram::AsyncRingOram;
pub use config::{MaskAlgorithmKind, OramConfig};
pub use engine::OpType;
pub use store::{AsyncBackingStore, SyncBackingStore, WriteKind, WriteOp};
pub use sync_oram::SyncRingOram;

/// A logical block key. Key `0` is reserved for dummy blocks.
pub type LogicalKey = i64;

/// A physical address in the backing store's key namespace.
pub type PhysicalKey = i64;

/// A leaf path identifier. A path carries `num_levels` significant bits;
/// the bucket it crosses at level `l` is `path >> (num_levels - l)`.
pub type Leaf = u32;

/// The logical key reserved for dummy blocks.
pub const DUMMY_KEY: LogicalKey = 0;

/// Errors arising from this crate.
///
/// Protocol invariant violations (a stash/position-map mismatch, a missing
/// expected block, a physical key collision) are deliberately *not*
/// represented here: continuing past one risks leaking the access pattern, so
/// they abort the process instead.
#[derive(Error, Debug)]
pub enum OramError {
    /// Arithmetic errors arising from conversions between integer types.
    #[error("arithmetic error encountered")]
    IntegerConversionError(#[from] std::num::TryFromIntError),
    /// Invalid engine configuration.
    #[error("invalid ORAM configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// The backing store failed to serve a physical read or write.
    #[error("backing store I/O failed: {0}")]
    StoreError(String),
    /// A persisted recovery payload could not be decoded.
    #[error("corrupt recovery payload: {0}")]
    CorruptPayload(#[from] std::io::Error),
    /// An injected failure, used by crash-recovery tests.
    #[error("simulated failure after {0} batch operations")]
    SimulatedFailure(usize),
}
