// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The untrusted backing store boundary.
//!
//! The engine only ever sees an opaque `i64`-keyed byte store. The store is
//! untrusted: everything written through this boundary is already masked,
//! and the engine's entire security argument is about the *pattern* of these
//! calls, not their contents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{OramError, PhysicalKey};

/// Whether a write stores a value or removes the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Store the value under the key.
    Write,
    /// Remove the key.
    Delete,
}

/// One write against the backing store.
#[derive(Clone, Debug)]
pub struct WriteOp {
    /// The physical key written or deleted.
    pub key: PhysicalKey,
    /// The bytes stored; `None` for deletes.
    pub value: Option<Vec<u8>>,
    /// Write or delete.
    pub kind: WriteKind,
}

impl WriteOp {
    /// A plain write of `value` under `key`.
    pub fn write(key: PhysicalKey, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
            kind: WriteKind::Write,
        }
    }

    /// A delete of `key`.
    pub fn delete(key: PhysicalKey) -> Self {
        Self {
            key,
            value: None,
            kind: WriteKind::Delete,
        }
    }
}

/// Completion callback for asynchronous reads; receives one entry per
/// requested key, in request order, `None` for absent keys.
pub type ReadCompletion = Box<dyn FnOnce(Vec<Option<Vec<u8>>>) + Send>;

/// Completion callback for asynchronous writes.
pub type WriteCompletion = Box<dyn FnOnce() + Send>;

/// A blocking key→bytes store.
pub trait SyncBackingStore {
    /// Reads one key, `None` if absent.
    fn read(&mut self, key: PhysicalKey) -> Result<Option<Vec<u8>>, OramError>;

    /// Reads a batch of keys, preserving order.
    fn read_many(&mut self, keys: &[PhysicalKey]) -> Result<Vec<Option<Vec<u8>>>, OramError> {
        keys.iter().map(|key| self.read(*key)).collect()
    }

    /// Applies one write.
    fn write(&mut self, op: WriteOp) -> Result<(), OramError>;

    /// Applies a batch of writes.
    fn write_many(&mut self, ops: Vec<WriteOp>) -> Result<(), OramError> {
        for op in ops {
            self.write(op)?;
        }
        Ok(())
    }
}

/// A callback-completing key→bytes store, safe to drive from worker threads.
pub trait AsyncBackingStore: Send + Sync {
    /// Schedules a read of one key.
    fn read(&self, key: PhysicalKey, completion: ReadCompletion);
    /// Schedules a batch read.
    fn read_many(&self, keys: Vec<PhysicalKey>, completion: ReadCompletion);
    /// Schedules one write.
    fn write(&self, op: WriteOp, completion: WriteCompletion);
    /// Schedules a batch of writes.
    fn write_many(&self, ops: Vec<WriteOp>, completion: WriteCompletion);
}

/// An in-memory backing store.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<PhysicalKey, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored keys.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    fn read_one(&self, key: PhysicalKey) -> Option<Vec<u8>> {
        log::trace!("physical read -- {key}");
        self.map.lock().get(&key).cloned()
    }

    fn write_one(&self, op: WriteOp) {
        log::trace!("physical write -- {} ({:?})", op.key, op.kind);
        let mut map = self.map.lock();
        match op.kind {
            WriteKind::Write => {
                map.insert(op.key, op.value.unwrap_or_default());
            }
            WriteKind::Delete => {
                map.remove(&op.key);
            }
        }
    }
}

impl SyncBackingStore for MemoryStore {
    fn read(&mut self, key: PhysicalKey) -> Result<Option<Vec<u8>>, OramError> {
        Ok(self.read_one(key))
    }

    fn write(&mut self, op: WriteOp) -> Result<(), OramError> {
        self.write_one(op);
        Ok(())
    }
}

/// Shared physical-operation counters, exposed by [`CountingStore`].
#[derive(Default, Debug)]
pub struct StoreCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl StoreCounters {
    /// Total physical reads issued so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total physical writes issued so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// A store wrapper that counts physical reads and writes. The obliviousness
/// proxy tests assert on these counters: padded batches must issue the same
/// operation counts no matter which keys they carried.
pub struct CountingStore<S> {
    inner: S,
    counters: Arc<StoreCounters>,
}

impl<S> CountingStore<S> {
    /// Wraps `inner`, counting every physical operation against it.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counters: Arc::new(StoreCounters::default()),
        }
    }

    /// A handle to the counters that survives moving the store into an engine.
    pub fn counters(&self) -> Arc<StoreCounters> {
        Arc::clone(&self.counters)
    }
}

impl<S: SyncBackingStore> SyncBackingStore for CountingStore<S> {
    fn read(&mut self, key: PhysicalKey) -> Result<Option<Vec<u8>>, OramError> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read(key)
    }

    fn read_many(&mut self, keys: &[PhysicalKey]) -> Result<Vec<Option<Vec<u8>>>, OramError> {
        self.counters
            .reads
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        self.inner.read_many(keys)
    }

    fn write(&mut self, op: WriteOp) -> Result<(), OramError> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.write(op)
    }

    fn write_many(&mut self, ops: Vec<WriteOp>) -> Result<(), OramError> {
        self.counters
            .writes
            .fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.inner.write_many(ops)
    }
}

/// Presents a blocking store through the async interface; operations execute
/// on the calling thread and complete inline.
pub struct AsyncOverSync<S> {
    inner: Mutex<S>,
}

impl<S: SyncBackingStore> AsyncOverSync<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<S: SyncBackingStore + Send> AsyncBackingStore for AsyncOverSync<S> {
    fn read(&self, key: PhysicalKey, completion: ReadCompletion) {
        let value = self
            .inner
            .lock()
            .read(key)
            .unwrap_or_else(|err| panic!("backing store read failed: {err}"));
        completion(vec![value]);
    }

    fn read_many(&self, keys: Vec<PhysicalKey>, completion: ReadCompletion) {
        let values = self
            .inner
            .lock()
            .read_many(&keys)
            .unwrap_or_else(|err| panic!("backing store read failed: {err}"));
        completion(values);
    }

    fn write(&self, op: WriteOp, completion: WriteCompletion) {
        self.inner
            .lock()
            .write(op)
            .unwrap_or_else(|err| panic!("backing store write failed: {err}"));
        completion();
    }

    fn write_many(&self, ops: Vec<WriteOp>, completion: WriteCompletion) {
        self.inner
            .lock()
            .write_many(ops)
            .unwrap_or_else(|err| panic!("backing store write failed: {err}"));
        completion();
    }
}

/// Presents an async store through the blocking interface by waiting on each
/// completion. Useful for driving an [`crate::AsyncRingOram`] from
/// sequential code.
pub struct SyncOverAsync<S> {
    inner: Arc<S>,
}

impl<S: AsyncBackingStore> SyncOverAsync<S> {
    /// Wraps `inner`.
    pub fn new(inner: Arc<S>) -> Self {
        Self { inner }
    }
}

impl<S: AsyncBackingStore> SyncBackingStore for SyncOverAsync<S> {
    fn read(&mut self, key: PhysicalKey) -> Result<Option<Vec<u8>>, OramError> {
        Ok(self.read_many(&[key])?.pop().flatten())
    }

    fn read_many(&mut self, keys: &[PhysicalKey]) -> Result<Vec<Option<Vec<u8>>>, OramError> {
        let signal = Arc::new(Signal::new());
        let tx = Arc::clone(&signal);
        self.inner
            .read_many(keys.to_vec(), Box::new(move |values| tx.notify(values)));
        Ok(signal.wait())
    }

    fn write(&mut self, op: WriteOp) -> Result<(), OramError> {
        self.write_many(vec![op])
    }

    fn write_many(&mut self, ops: Vec<WriteOp>) -> Result<(), OramError> {
        let signal = Arc::new(Signal::new());
        let tx = Arc::clone(&signal);
        self.inner.write_many(ops, Box::new(move || tx.notify(())));
        signal.wait();
        Ok(())
    }
}

/// A one-shot completion signal: a slot plus a condvar. The async paths hand
/// a notifying closure to the store and the driving thread blocks in `wait`.
pub(crate) struct Signal<T> {
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self, value: T) {
        let mut slot = self.slot.lock();
        *slot = Some(value);
        self.cv.notify_all();
    }

    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.cv.wait(&mut slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_read_write_delete() {
        let mut store = MemoryStore::new();
        assert_eq!(store.read(1).unwrap(), None);
        store.write(WriteOp::write(1, vec![1, 2, 3])).unwrap();
        assert_eq!(store.read(1).unwrap(), Some(vec![1, 2, 3]));
        store.write(WriteOp::delete(1)).unwrap();
        assert_eq!(store.read(1).unwrap(), None);
    }

    #[test]
    fn counting_store_counts() {
        let mut store = CountingStore::new(MemoryStore::new());
        let counters = store.counters();
        store.write(WriteOp::write(1, vec![0])).unwrap();
        store.read(1).unwrap();
        store.read_many(&[1, 2, 3]).unwrap();
        assert_eq!(counters.reads(), 4);
        assert_eq!(counters.writes(), 1);
    }

    #[test]
    fn adapters_round_trip() {
        let store = Arc::new(AsyncOverSync::new(MemoryStore::new()));
        let mut sync = SyncOverAsync::new(Arc::clone(&store));
        sync.write(WriteOp::write(9, vec![7])).unwrap();
        assert_eq!(sync.read(9).unwrap(), Some(vec![7]));
        assert_eq!(sync.read_many(&[9, 10]).unwrap(), vec![Some(vec![7]), None]);
    }
}
