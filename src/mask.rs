// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Keystream masking for block values and persisted recovery data.
//!
//! Values are never encrypted in place with an AEAD; they are XOR-masked with
//! a nonce-derived keystream so that `mask(mask(v)) == v` under an unchanged
//! nonce. That property is what lets a block be decrypted by re-applying the
//! mask, and what makes deterministic nonces (derived from the physical key)
//! yield reproducible ciphertexts across a crash.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::config::{MaskAlgorithmKind, OramConfig};
use crate::{OramError, PhysicalKey};

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = Ctr128BE<Aes128>;

const HMAC_BLOCK: usize = 32;

/// Derives an `i64` physical key from a persisted name. Stable across runs
/// and processes; the recovery key namespace depends on it.
pub(crate) fn hash_persistent(name: &[u8]) -> PhysicalKey {
    let digest = Sha256::digest(name);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(word)
}

/// Per-worker scratch state: a mask buffer sized to the configured value and
/// a nonce RNG. Owned by each pool worker (and by the sync processor) so that
/// no global mutable state hides behind the crypto path.
pub(crate) struct CryptoScratch {
    pub mask: Vec<u8>,
    pub rng: StdRng,
}

impl CryptoScratch {
    pub fn new(value_size: usize) -> Self {
        Self {
            mask: vec![0u8; value_size],
            rng: StdRng::from_entropy(),
        }
    }
}

enum Keystream {
    Hmac(HmacSha256),
    Aes { key: [u8; 16] },
}

/// The shared masking context: algorithm, keyed state, and sizing. Cheap to
/// share behind an `Arc`; all mutable scratch is passed in per call.
pub(crate) struct MaskContext {
    encrypt: bool,
    nonce_len: usize,
    value_size: usize,
    keystream: Keystream,
}

impl MaskContext {
    pub fn new(config: &OramConfig) -> Result<Self, OramError> {
        let keystream = match config.mask_algorithm {
            MaskAlgorithmKind::HmacSha256 => {
                let mac = HmacSha256::new_from_slice(&config.client_key)
                    .map_err(|_| OramError::InvalidConfiguration("unusable client key"))?;
                Keystream::Hmac(mac)
            }
            MaskAlgorithmKind::Aes128Ctr => {
                let mut key = [0u8; 16];
                if config.client_key.len() != key.len() {
                    return Err(OramError::InvalidConfiguration(
                        "AES-128-CTR masking requires a 16-byte client key",
                    ));
                }
                key.copy_from_slice(&config.client_key);
                Keystream::Aes { key }
            }
        };
        if config.nonce_len == 0 || config.nonce_len > 16 {
            return Err(OramError::InvalidConfiguration(
                "nonce length must be between 1 and 16 bytes",
            ));
        }
        Ok(Self {
            encrypt: config.encrypt_blocks,
            nonce_len: config.nonce_len,
            value_size: config.value_size,
            keystream,
        })
    }

    pub fn enabled(&self) -> bool {
        self.encrypt
    }

    pub fn nonce_len(&self) -> usize {
        self.nonce_len
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// XORs the nonce-derived keystream into `value` in place, using
    /// `scratch.mask` as the keystream buffer. A second application with the
    /// same nonce restores the original bytes.
    pub fn apply(&self, nonce: &[u8], value: &mut [u8], scratch: &mut CryptoScratch) {
        if !self.encrypt {
            return;
        }
        debug_assert!(scratch.mask.len() >= value.len());
        let mask = &mut scratch.mask[..value.len()];
        self.fill_keystream(nonce, mask);
        for (v, m) in value.iter_mut().zip(mask.iter()) {
            *v ^= *m;
        }
    }

    fn fill_keystream(&self, nonce: &[u8], out: &mut [u8]) {
        match &self.keystream {
            Keystream::Hmac(mac) => {
                let mut offset = 0usize;
                let mut counter = 0u32;
                while offset < out.len() {
                    let mut chunk_mac = mac.clone();
                    chunk_mac.update(nonce);
                    chunk_mac.update(&counter.to_be_bytes());
                    let chunk = chunk_mac.finalize().into_bytes();
                    let take = HMAC_BLOCK.min(out.len() - offset);
                    out[offset..offset + take].copy_from_slice(&chunk[..take]);
                    offset += take;
                    counter += 1;
                }
            }
            Keystream::Aes { key } => {
                let mut iv = [0u8; 16];
                let n = nonce.len().min(16);
                iv[..n].copy_from_slice(&nonce[..n]);
                out.fill(0);
                let mut cipher = Aes128Ctr::new(&(*key).into(), &iv.into());
                cipher.apply_keystream(out);
            }
        }
    }
}

/// Keystream cipher for persisted recovery payloads, keyed by the client key
/// and seeded per payload with its physical key. Unlike the block mask this
/// handles arbitrary lengths, and it covers every byte of the payload.
pub(crate) struct RecoveryCipher {
    mac: HmacSha256,
}

impl RecoveryCipher {
    pub fn new(client_key: &[u8]) -> Result<Self, OramError> {
        let mac = HmacSha256::new_from_slice(client_key)
            .map_err(|_| OramError::InvalidConfiguration("unusable client key"))?;
        Ok(Self { mac })
    }

    /// XORs the seed-derived keystream into `data` in place. Involutive.
    pub fn mask(&self, data: &mut [u8], seed_key: PhysicalKey) {
        let seed = seed_key.to_be_bytes();
        let mut offset = 0usize;
        while offset < data.len() {
            let mut chunk_mac = self.mac.clone();
            chunk_mac.update(&seed);
            chunk_mac.update(&(offset as u32).to_be_bytes());
            let chunk = chunk_mac.finalize().into_bytes();
            let take = HMAC_BLOCK.min(data.len() - offset);
            for (d, m) in data[offset..offset + take].iter_mut().zip(chunk.iter()) {
                *d ^= *m;
            }
            offset += take;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MaskAlgorithmKind, OramConfig};
    use rand::RngCore;

    fn context(kind: MaskAlgorithmKind) -> MaskContext {
        let config = OramConfig {
            mask_algorithm: kind,
            client_key: vec![7u8; 16],
            value_size: 100,
            ..OramConfig::default()
        };
        MaskContext::new(&config).unwrap()
    }

    #[test]
    fn mask_is_involutive() {
        for kind in [MaskAlgorithmKind::HmacSha256, MaskAlgorithmKind::Aes128Ctr] {
            let ctx = context(kind);
            let mut scratch = CryptoScratch::new(100);
            let mut value = vec![0u8; 100];
            scratch.rng.fill_bytes(&mut value);
            let original = value.clone();
            let nonce = [3u8; 8];

            ctx.apply(&nonce, &mut value, &mut scratch);
            assert_ne!(value, original);
            ctx.apply(&nonce, &mut value, &mut scratch);
            assert_eq!(value, original);
        }
    }

    #[test]
    fn different_nonces_give_different_masks() {
        let ctx = context(MaskAlgorithmKind::HmacSha256);
        let mut scratch = CryptoScratch::new(100);
        let mut a = vec![0u8; 100];
        let mut b = vec![0u8; 100];
        ctx.apply(&[1u8; 8], &mut a, &mut scratch);
        ctx.apply(&[2u8; 8], &mut b, &mut scratch);
        assert_ne!(a, b);
    }

    #[test]
    fn recovery_cipher_round_trips_and_covers_tail() {
        let cipher = RecoveryCipher::new(&[9u8; 16]).unwrap();
        // Lengths straddling the HMAC block size, including an exact multiple.
        for len in [1usize, 31, 32, 33, 40, 64, 100] {
            let original: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut data = original.clone();
            cipher.mask(&mut data, 42);
            assert_ne!(data, original, "len {len} left data unmasked");
            cipher.mask(&mut data, 42);
            assert_eq!(data, original);
        }
        // The keystream must reach past the last whole HMAC block: masking a
        // zero buffer exposes the raw keystream, whose final eight bytes
        // cannot all be zero for a working PRF.
        let mut zeros = vec![0u8; 40];
        cipher.mask(&mut zeros, 42);
        assert!(zeros[32..].iter().any(|&b| b != 0), "keystream tail missing");
    }

    #[test]
    fn persistent_hash_is_stable() {
        let a = hash_persistent(b"position_map_7");
        let b = hash_persistent(b"position_map_7");
        let c = hash_persistent(b"position_map_8");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
