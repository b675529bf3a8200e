// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Blocks, the unit of data the engine moves between stash and tree.
//!
//! Exactly one live version of a real block exists in a bucket slot or in the
//! stash at any time. Reading a slot off a path always produces a *new*
//! version ([`Block::copy_to_new_version`]) so in-flight readers never mutate
//! a slot's committed content. Versions of one block share a nonce cell: a
//! pipelined read of a slot may be issued before the write that (re)masked it
//! has executed, and the reader must observe the nonce that write generates.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;

use crate::mask::{CryptoScratch, MaskContext};
use crate::{LogicalKey, PhysicalKey, DUMMY_KEY};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

struct Nonce {
    bytes: [u8; 16],
    computed: bool,
}

/// A block in the ORAM. May sit in a bucket slot, in the stash, or be a bare
/// handle travelling through an I/O task.
pub(crate) struct Block {
    id: u64,
    key: LogicalKey,
    /// Whether this is a dummy filler block.
    pub is_dummy: bool,
    version: u32,
    deterministic_nonce: bool,
    valid: AtomicBool,
    stale: AtomicBool,
    cached: AtomicBool,
    physical_key: AtomicI64,
    value: Mutex<Option<Vec<u8>>>,
    nonce: Arc<Mutex<Nonce>>,
}

impl Block {
    pub fn new_real(
        key: LogicalKey,
        value: Option<Vec<u8>>,
        version: u32,
        deterministic_nonce: bool,
        physical_key: PhysicalKey,
    ) -> Arc<Self> {
        assert_ne!(key, DUMMY_KEY, "real block with the dummy sentinel key");
        Arc::new(Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            key,
            is_dummy: false,
            version,
            deterministic_nonce,
            valid: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            physical_key: AtomicI64::new(physical_key),
            value: Mutex::new(value),
            nonce: Arc::new(Mutex::new(Nonce {
                bytes: [0u8; 16],
                computed: false,
            })),
        })
    }

    /// A dummy filler block. Dummies carry no value of their own; encryption
    /// masks a zeroed buffer on the fly.
    pub fn new_dummy() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            key: DUMMY_KEY,
            is_dummy: true,
            version: 0,
            deterministic_nonce: false,
            valid: AtomicBool::new(true),
            stale: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            physical_key: AtomicI64::new(0),
            value: Mutex::new(None),
            nonce: Arc::new(Mutex::new(Nonce {
                bytes: [0u8; 16],
                computed: false,
            })),
        })
    }

    /// The copy-on-read primitive: a fresh, invalid, empty version of a real
    /// block, sharing the original's nonce cell and physical key.
    pub fn copy_to_new_version(block: &Arc<Block>) -> Arc<Block> {
        assert!(!block.is_dummy, "dummy blocks are never versioned");
        Arc::new(Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            key: block.key,
            is_dummy: false,
            version: block.version + 1,
            deterministic_nonce: block.deterministic_nonce,
            valid: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            physical_key: AtomicI64::new(block.physical_key()),
            value: Mutex::new(None),
            nonce: Arc::clone(&block.nonce),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> LogicalKey {
        self.key
    }

    #[cfg(test)]
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn validate(&self) {
        self.valid.store(true, Ordering::Relaxed);
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn staleify(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Relaxed)
    }

    pub fn set_cached(&self, cached: bool) {
        self.cached.store(cached, Ordering::Relaxed);
    }

    pub fn physical_key(&self) -> PhysicalKey {
        self.physical_key.load(Ordering::Relaxed)
    }

    pub fn set_physical_key(&self, key: PhysicalKey) {
        self.physical_key.store(key, Ordering::Relaxed);
    }

    /// Overwrites the plaintext value. Used for logical writes; taking the
    /// value lock here is what fences against a concurrent decrypt.
    pub fn set_value(&self, value: Option<Vec<u8>>) {
        *self.value.lock() = value;
    }

    pub fn has_value(&self) -> bool {
        self.value.lock().is_some()
    }

    pub fn value_clone(&self) -> Option<Vec<u8>> {
        self.value.lock().clone()
    }

    /// Masks the value with a nonce-derived keystream and clears the
    /// in-memory plaintext, returning the ciphertext. With a deterministic
    /// nonce the ciphertext depends only on the physical key and the value,
    /// which is what makes rewrites reproducible across recovery.
    pub fn encrypt_and_clear(&self, ctx: &MaskContext, scratch: &mut CryptoScratch) -> Vec<u8> {
        let mut out = if self.is_dummy {
            vec![0u8; ctx.value_size()]
        } else {
            self.value
                .lock()
                .take()
                .unwrap_or_else(|| panic!("encrypting block {} with no value", self.key))
        };
        let mut nonce = self.nonce.lock();
        if self.deterministic_nonce {
            Self::compute_deterministic_nonce(&mut nonce, self.physical_key());
        } else if ctx.enabled() {
            scratch.rng.fill_bytes(&mut nonce.bytes[..ctx.nonce_len()]);
        }
        ctx.apply(&nonce.bytes[..ctx.nonce_len()], &mut out, scratch);
        out
    }

    /// Reverses the mask and installs the plaintext. A no-op if a newer write
    /// already populated the value: the ciphertext read back from storage
    /// must not clobber it.
    pub fn decrypt_and_set(&self, data: Vec<u8>, ctx: &MaskContext, scratch: &mut CryptoScratch) {
        assert!(!self.is_dummy, "decrypting a dummy block");
        let mut guard = self.value.lock();
        if guard.is_some() {
            return;
        }
        let mut nonce = self.nonce.lock();
        if self.deterministic_nonce && !nonce.computed {
            Self::compute_deterministic_nonce(&mut nonce, self.physical_key());
        }
        let mut data = data;
        ctx.apply(&nonce.bytes[..ctx.nonce_len()], &mut data, scratch);
        drop(nonce);
        *guard = Some(data);
    }

    fn compute_deterministic_nonce(nonce: &mut Nonce, physical_key: PhysicalKey) {
        nonce.bytes[..8].copy_from_slice(&physical_key.to_le_bytes());
        nonce.computed = true;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dummy {
            write!(f, "Block::Dummy")
        } else {
            f.debug_struct("Block")
                .field("key", &self.key)
                .field("version", &self.version)
                .field("valid", &self.is_valid())
                .field("stale", &self.is_stale())
                .field("cached", &self.is_cached())
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OramConfig;

    fn mask_setup() -> (MaskContext, CryptoScratch) {
        let config = OramConfig {
            value_size: 64,
            client_key: vec![5u8; 16],
            ..OramConfig::default()
        };
        (MaskContext::new(&config).unwrap(), CryptoScratch::new(64))
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let (ctx, mut scratch) = mask_setup();
        let value = vec![0xabu8; 64];
        let block = Block::new_real(7, Some(value.clone()), 0, false, 0);

        let ciphertext = block.encrypt_and_clear(&ctx, &mut scratch);
        assert!(!block.has_value());
        assert_ne!(ciphertext, value);

        block.decrypt_and_set(ciphertext, &ctx, &mut scratch);
        assert_eq!(block.value_clone().unwrap(), value);
    }

    #[test]
    fn decrypt_does_not_clobber_a_newer_write() {
        let (ctx, mut scratch) = mask_setup();
        let block = Block::new_real(7, Some(vec![1u8; 64]), 0, false, 0);
        let ciphertext = block.encrypt_and_clear(&ctx, &mut scratch);

        // A subsequent write lands before the read-back completes.
        block.set_value(Some(vec![2u8; 64]));
        block.decrypt_and_set(ciphertext, &ctx, &mut scratch);
        assert_eq!(block.value_clone().unwrap(), vec![2u8; 64]);
    }

    #[test]
    fn deterministic_nonce_reproduces_ciphertext() {
        let (ctx, mut scratch) = mask_setup();
        let value = vec![0x5au8; 64];
        let a = Block::new_real(7, Some(value.clone()), 0, true, 9999);
        let b = Block::new_real(7, Some(value.clone()), 0, true, 9999);
        let ct_a = a.encrypt_and_clear(&ctx, &mut scratch);
        let ct_b = b.encrypt_and_clear(&ctx, &mut scratch);
        assert_eq!(ct_a, ct_b);

        let c = Block::new_real(7, Some(value), 0, true, 1);
        assert_ne!(c.encrypt_and_clear(&ctx, &mut scratch), ct_a);
    }

    #[test]
    fn versions_share_the_nonce_cell() {
        let (ctx, mut scratch) = mask_setup();
        let original = Block::new_real(7, Some(vec![9u8; 64]), 0, false, 0);
        // The copy exists before the original is (re)masked.
        let copy = Block::copy_to_new_version(&original);
        assert_eq!(copy.version(), 1);
        let ciphertext = original.encrypt_and_clear(&ctx, &mut scratch);

        copy.decrypt_and_set(ciphertext, &ctx, &mut scratch);
        assert_eq!(copy.value_clone().unwrap(), vec![9u8; 64]);
    }

    #[test]
    fn dummy_blocks_mask_a_zeroed_buffer() {
        let (ctx, mut scratch) = mask_setup();
        let dummy = Block::new_dummy();
        let ciphertext = dummy.encrypt_and_clear(&ctx, &mut scratch);
        assert_eq!(ciphertext.len(), 64);
        assert!(!dummy.has_value());
    }
}
