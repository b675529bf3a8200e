// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Engine configuration.

use crate::OramError;

/// The keystream algorithm used to mask block values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskAlgorithmKind {
    /// HMAC-SHA256 in counter mode over the nonce.
    HmacSha256,
    /// AES-128-CTR with the nonce as the initial counter block.
    Aes128Ctr,
}

/// Configuration for a Ring ORAM instance.
///
/// The defaults mirror a small deployment; tests and benchmarks override the
/// tree parameters freely. Batch geometry: one ORAM batch consists of
/// `max_nb_stride` read strides of `stride_size` accesses followed by one
/// write batch of `writes_size` accesses, and with durability enabled one
/// batch is one epoch.
#[derive(Clone, Debug)]
pub struct OramConfig {
    /// The maximum number of real blocks the ORAM will store (N).
    pub max_blocks: usize,
    /// Real slots per bucket (Z).
    pub z: usize,
    /// Dummy slots per bucket (S). A bucket must be reshuffled before it is
    /// probed more than S times.
    pub s: usize,
    /// Eviction rate (A): one eviction path is flushed every A accesses.
    pub a: usize,
    /// The exact size in bytes of every stored value.
    pub value_size: usize,
    /// Nonce length in bytes for the block mask. Durability requires 8.
    pub nonce_len: usize,
    /// The mask keystream algorithm.
    pub mask_algorithm: MaskAlgorithmKind,
    /// Whether block values are masked at all. Disabled only in tests.
    pub encrypt_blocks: bool,
    /// Skip the read path for real writes; deletes staleify in place.
    pub write_without_read: bool,
    /// Defer physical bucket writes to the end of the batch. Required for
    /// durability.
    pub write_end_batch: bool,
    /// Pad read strides with dummy reads and write batches with dummy writes.
    pub pad_batches: bool,
    /// Buffer the sync processor's per-bucket operations into batch calls on
    /// the backing store. Sync engine only.
    pub buffer_sync_ops: bool,
    /// Enable the write-ahead log and epoch checkpointing.
    pub durable: bool,
    /// Checkpoint every `durable_checkpoint_freq` epochs (per map, offset by
    /// the fields below); other epochs persist diffs.
    pub durable_checkpoint_freq: usize,
    /// Epoch offset (mod frequency) at which the position map snapshots.
    pub durable_checkpoint_position_map: usize,
    /// Epoch offset at which the valid map snapshots.
    pub durable_checkpoint_valid_map: usize,
    /// Epoch offset at which the stale map snapshots.
    pub durable_checkpoint_stale_map: usize,
    /// Epoch offset at which the permutation map snapshots.
    pub durable_checkpoint_permutation_map: usize,
    /// Epoch offset at which the early-reshuffle map snapshots.
    pub durable_checkpoint_early_reshuffle_map: usize,
    /// Stride size in bytes for persisted recovery payloads.
    pub durable_max_data_size: usize,
    /// Durable upper bound on the stash; the stash checkpoint is padded to
    /// this many entries and exceeding it is fatal.
    pub durable_max_stash_size: usize,
    /// Number of accesses in one padded read stride.
    pub stride_size: usize,
    /// Number of accesses in one padded write batch.
    pub writes_size: usize,
    /// Number of read strides per batch.
    pub max_nb_stride: usize,
    /// The symmetric client key for the block mask and recovery keystream.
    pub client_key: Vec<u8>,
    /// Worker threads for the async pipeline.
    pub threads: usize,
}

impl Default for OramConfig {
    fn default() -> Self {
        Self {
            max_blocks: 1000,
            z: 8,
            s: 13,
            a: 8,
            value_size: 100,
            nonce_len: 8,
            mask_algorithm: MaskAlgorithmKind::HmacSha256,
            encrypt_blocks: true,
            write_without_read: false,
            write_end_batch: false,
            pad_batches: true,
            buffer_sync_ops: false,
            durable: false,
            durable_checkpoint_freq: 5,
            durable_checkpoint_position_map: 0,
            durable_checkpoint_valid_map: 1,
            durable_checkpoint_stale_map: 2,
            durable_checkpoint_permutation_map: 3,
            durable_checkpoint_early_reshuffle_map: 4,
            durable_max_data_size: 1024,
            durable_max_stash_size: 500,
            stride_size: 10000,
            writes_size: 1000,
            max_nb_stride: 4,
            client_key: vec![0u8; 16],
            threads: 8,
        }
    }
}

impl OramConfig {
    /// The number of accesses in one full batch (all read strides plus the
    /// write batch). With durability enabled this is also the epoch length.
    pub fn total_batch_ops(&self) -> usize {
        self.max_nb_stride * self.stride_size + self.writes_size
    }

    /// Slots per bucket.
    pub fn bucket_slots(&self) -> usize {
        self.z + self.s
    }

    /// The tree parameter L derived from N and A as in the Ring ORAM paper
    /// (section 5, lemma 3). The tree has `L + 1` levels.
    pub fn derived_levels(&self) -> usize {
        let ratio = 2.0 * self.max_blocks as f64 / self.a as f64;
        ratio.log2().ceil() as usize
    }

    pub(crate) fn validate(&self) -> Result<(), OramError> {
        if self.max_blocks == 0 {
            return Err(OramError::InvalidConfiguration("max_blocks must be nonzero"));
        }
        if self.z == 0 || self.s == 0 || self.a == 0 {
            return Err(OramError::InvalidConfiguration("Z, S, and A must be nonzero"));
        }
        if self.value_size == 0 {
            return Err(OramError::InvalidConfiguration("value_size must be nonzero"));
        }
        if self.stride_size == 0 || self.writes_size == 0 {
            return Err(OramError::InvalidConfiguration(
                "stride_size and writes_size must be nonzero",
            ));
        }
        if self.durable && !self.write_end_batch {
            return Err(OramError::InvalidConfiguration(
                "durability requires write_end_batch",
            ));
        }
        if self.durable && self.nonce_len != 8 {
            return Err(OramError::InvalidConfiguration(
                "durability requires an 8-byte deterministic nonce",
            ));
        }
        if self.encrypt_blocks
            && self.mask_algorithm == MaskAlgorithmKind::Aes128Ctr
            && self.client_key.len() != 16
        {
            return Err(OramError::InvalidConfiguration(
                "AES-128-CTR masking requires a 16-byte client key",
            ));
        }
        if self.durable && self.durable_max_data_size == 0 {
            return Err(OramError::InvalidConfiguration(
                "durable_max_data_size must be nonzero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        OramConfig::default().validate().unwrap();
    }

    #[test]
    fn durability_requires_write_end_batch() {
        let cfg = OramConfig {
            durable: true,
            write_end_batch: false,
            ..OramConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_levels_match_paper_formula() {
        let cfg = OramConfig {
            max_blocks: 1024,
            a: 8,
            ..OramConfig::default()
        };
        // 2 * 1024 / 8 = 256 = 2^8
        assert_eq!(cfg.derived_levels(), 8);
    }
}
