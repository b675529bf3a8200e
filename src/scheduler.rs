// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The asynchronous I/O machinery: a worker pool, a dependency task graph,
//! and batch completion tracking.
//!
//! The graph preserves program order on conflicting resources. Two
//! operations conflict when they target the same physical slot (tracked by
//! the slot's partial key, which is stable across rewrites) or when both
//! touch the same live logical key. Each scheduled task carries a
//! predecessor count and a successor list; completing a task decrements its
//! successors and releases any that reach zero to the pool. Log-entry writes
//! form their own chain, and the physical reads of a logged access are
//! ordered after that access's log write, which is what makes the log
//! "write-ahead" under pipelining.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::block::Block;
use crate::mask::{CryptoScratch, MaskContext, RecoveryCipher};
use crate::recover::LogEntryId;
use crate::store::{AsyncBackingStore, WriteOp};
use crate::{LogicalKey, PhysicalKey};

/// Work shipped to the pool. Each worker passes its own scratch state in.
pub(crate) type Job = Box<dyn FnOnce(&mut CryptoScratch) + Send>;

struct PoolShared {
    queue: Mutex<PoolQueue>,
    cv: Condvar,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

/// A fixed set of worker threads over one shared queue. Every worker owns a
/// `CryptoScratch` so encryption never touches hidden global state. On drop
/// the pool drains all queued work (including work enqueued by completions)
/// before joining.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, value_size: usize) -> Self {
        assert!(threads > 0, "worker pool needs at least one thread");
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("oram-worker-{i}"))
                    .spawn(move || {
                        let mut scratch = CryptoScratch::new(value_size);
                        loop {
                            let job = {
                                let mut queue = shared.queue.lock();
                                loop {
                                    if let Some(job) = queue.jobs.pop_front() {
                                        break Some(job);
                                    }
                                    if queue.shutdown {
                                        break None;
                                    }
                                    shared.cv.wait(&mut queue);
                                }
                            };
                            match job {
                                Some(job) => job(&mut scratch),
                                None => return,
                            }
                        }
                    })
                    .expect("spawning worker thread")
            })
            .collect();
        Self { shared, workers }
    }

    pub fn execute(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        queue.jobs.push_back(job);
        self.shared.cv.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.cv.notify_all();
        // The last handle can be released from inside a job, in which case
        // the dropping thread is one of the workers; it cannot join itself
        // and will exit its loop on the shutdown flag instead.
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

/// Detects the end of a batch without racing the thread that issues it: an
/// issued-task count is only trusted once the issuing thread has declared the
/// batch's metadata complete, and the batch finishes when both that flag is
/// set and the completed count has caught up.
pub(crate) struct BatchTracker {
    pool: Arc<WorkerPool>,
    state: Mutex<BatchState>,
}

struct BatchState {
    created: usize,
    completed: usize,
    metadata_ready: bool,
    completion: Option<Box<dyn FnOnce() + Send>>,
}

impl BatchTracker {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(BatchState {
                created: 0,
                completed: 0,
                metadata_ready: false,
                completion: None,
            }),
        }
    }

    /// Installs the completion for the batch about to be issued.
    pub fn begin_batch(&self, completion: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        assert!(
            state.completion.is_none() && !state.metadata_ready,
            "batch issued while another batch is in flight"
        );
        state.completion = Some(completion);
    }

    /// Counts a task issued for the current batch. Engine thread only.
    pub fn add_task(&self) {
        self.state.lock().created += 1;
    }

    /// Counts a finished task; fires the completion if the batch is done.
    pub fn finished_task(&self) {
        let mut state = self.state.lock();
        state.completed += 1;
        self.maybe_finish(&mut state);
    }

    /// Declares that the issuing thread has finished scheduling the batch,
    /// fixing the created count.
    pub fn metadata_ready(&self) {
        let mut state = self.state.lock();
        state.metadata_ready = true;
        self.maybe_finish(&mut state);
    }

    fn maybe_finish(&self, state: &mut BatchState) {
        if !state.metadata_ready || state.completed != state.created {
            return;
        }
        let completion = state
            .completion
            .take()
            .expect("batch finished with no completion installed");
        log::debug!("batch finished: {} physical tasks", state.completed);
        state.created = 0;
        state.completed = 0;
        state.metadata_ready = false;
        // Run off this thread: the finisher may hold engine or graph locks.
        self.pool.execute(Box::new(move |_| completion()));
    }
}

pub(crate) type TaskId = u64;

enum TaskWork {
    ReadBlock {
        store_key: PhysicalKey,
        block: Arc<Block>,
    },
    WriteBlock {
        store_key: PhysicalKey,
        block: Arc<Block>,
    },
    WriteLogEntry {
        store_key: PhysicalKey,
        payload: Vec<u8>,
    },
}

struct TaskNode {
    pred: usize,
    succ: Vec<TaskId>,
    work: Option<TaskWork>,
    is_read: bool,
    conflict_key: Option<PhysicalKey>,
    real_key: Option<LogicalKey>,
    log_entry: Option<LogEntryId>,
}

#[derive(Default)]
struct GraphState {
    next_id: TaskId,
    tasks: HashMap<TaskId, TaskNode>,
    last_physical: HashMap<PhysicalKey, TaskId>,
    last_real: HashMap<LogicalKey, TaskId>,
    last_log_entry: HashMap<LogEntryId, TaskId>,
}

/// The dependency-scheduled dispatcher for block and log-entry I/O.
pub(crate) struct Scheduler {
    /// Handle to ourselves for the task closures shipped to the pool.
    weak_self: Weak<Scheduler>,
    pool: Arc<WorkerPool>,
    store: Arc<dyn AsyncBackingStore>,
    mask: Arc<MaskContext>,
    recovery_cipher: Arc<RecoveryCipher>,
    tracker: Arc<BatchTracker>,
    read_listener: Box<dyn Fn(&Arc<Block>) + Send + Sync>,
    state: Mutex<GraphState>,
    /// Scratch buffers for decrypting in store completions, which may run on
    /// any thread. Checked out per completion, returned after.
    scratch_pool: Mutex<Vec<CryptoScratch>>,
}

impl Scheduler {
    pub fn new(
        pool: Arc<WorkerPool>,
        store: Arc<dyn AsyncBackingStore>,
        mask: Arc<MaskContext>,
        recovery_cipher: Arc<RecoveryCipher>,
        tracker: Arc<BatchTracker>,
        read_listener: Box<dyn Fn(&Arc<Block>) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            pool,
            store,
            mask,
            recovery_cipher,
            tracker,
            read_listener,
            state: Mutex::new(GraphState::default()),
            scratch_pool: Mutex::new(Vec::new()),
        })
    }

    fn strong_self(&self) -> Arc<Scheduler> {
        self.weak_self
            .upgrade()
            .expect("scheduler dropped with tasks in flight")
    }

    /// Schedules a slot read into `block`, ordered after the last operation
    /// on the same slot and after the access's log-entry write.
    pub fn schedule_read(
        &self,
        conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: Arc<Block>,
        recovery_dep: Option<LogEntryId>,
    ) {
        self.tracker.add_task();
        let mut dispatch_now = None;
        {
            let mut state = self.state.lock();
            let id = state.alloc_id();
            let mut node = TaskNode {
                pred: 0,
                succ: Vec::new(),
                work: Some(TaskWork::ReadBlock {
                    store_key,
                    block: Arc::clone(&block),
                }),
                is_read: true,
                conflict_key: Some(conflict_key),
                real_key: (!block.is_dummy && !block.is_stale()).then(|| block.key()),
                log_entry: None,
            };
            if let Some(dep) = recovery_dep {
                if let Some(&pred) = state.last_log_entry.get(&dep) {
                    state.link(pred, id, &mut node);
                }
            }
            if let Some(&pred) = state.last_physical.get(&conflict_key) {
                let pred_node = &state.tasks[&pred];
                assert!(
                    !pred_node.is_read,
                    "slot {conflict_key} read twice without an intervening write"
                );
                state.link(pred, id, &mut node);
            }
            state.last_physical.insert(conflict_key, id);
            if let Some(key) = node.real_key {
                state.last_real.insert(key, id);
            }
            if node.pred == 0 {
                dispatch_now = node.work.take().map(|work| (id, work));
            }
            state.tasks.insert(id, node);
        }
        if let Some((id, work)) = dispatch_now {
            self.dispatch(id, work);
        }
    }

    /// Schedules a slot write of `block`, ordered after the slot's last
    /// operation and after the read that produced this block's version.
    pub fn schedule_write(
        &self,
        conflict_key: PhysicalKey,
        store_key: PhysicalKey,
        block: Arc<Block>,
    ) {
        self.tracker.add_task();
        let mut dispatch_now = None;
        {
            let mut state = self.state.lock();
            let id = state.alloc_id();
            let mut node = TaskNode {
                pred: 0,
                succ: Vec::new(),
                work: Some(TaskWork::WriteBlock {
                    store_key,
                    block: Arc::clone(&block),
                }),
                is_read: false,
                conflict_key: Some(conflict_key),
                // Recorded so a later writer can tell this write carried a
                // real block; writes never enter the last-real map.
                real_key: (!block.is_dummy).then(|| block.key()),
                log_entry: None,
            };
            let pred_physical = state.last_physical.get(&conflict_key).copied();
            let pred_real = if block.is_dummy {
                None
            } else {
                state.last_real.get(&block.key()).copied()
            };
            if let Some(pred) = pred_physical {
                let pred_node = &state.tasks[&pred];
                assert!(
                    pred_node.is_read || pred_node.real_key.is_none(),
                    "write to slot {conflict_key} would overtake a live write"
                );
                state.link(pred, id, &mut node);
            }
            if let Some(pred) = pred_real {
                if pred_physical != Some(pred) {
                    let pred_node = &state.tasks[&pred];
                    assert!(pred_node.is_read, "real-key predecessor must be a read");
                    state.link(pred, id, &mut node);
                }
            }
            if pred_real.is_none() && !block.is_dummy {
                assert!(
                    block.has_value() || block.is_stale(),
                    "writing block {} before its value exists",
                    block.key()
                );
            }
            state.last_physical.insert(conflict_key, id);
            if node.pred == 0 {
                dispatch_now = node.work.take().map(|work| (id, work));
            }
            state.tasks.insert(id, node);
        }
        if let Some((id, work)) = dispatch_now {
            self.dispatch(id, work);
        }
    }

    /// Schedules a log-entry write, chained after the previous log entry of
    /// the same epoch. Log writes are not counted against the batch: every
    /// logged access's slot reads depend on them, so batch completion already
    /// implies the log is on storage.
    pub fn schedule_log_entry(
        &self,
        entry_id: LogEntryId,
        prev_entry: Option<LogEntryId>,
        store_key: PhysicalKey,
        payload: Vec<u8>,
    ) {
        let mut dispatch_now = None;
        let mut dispatch_id = 0;
        {
            let mut state = self.state.lock();
            let id = state.alloc_id();
            let mut node = TaskNode {
                pred: 0,
                succ: Vec::new(),
                work: Some(TaskWork::WriteLogEntry { store_key, payload }),
                is_read: false,
                conflict_key: None,
                real_key: None,
                log_entry: Some(entry_id),
            };
            if let Some(prev) = prev_entry {
                if let Some(&pred) = state.last_log_entry.get(&prev) {
                    state.link(pred, id, &mut node);
                }
            }
            state.last_log_entry.insert(entry_id, id);
            if node.pred == 0 {
                dispatch_now = node.work.take();
                dispatch_id = id;
            }
            state.tasks.insert(id, node);
        }
        if let Some(work) = dispatch_now {
            self.dispatch(dispatch_id, work);
        }
    }

    fn dispatch(&self, id: TaskId, work: TaskWork) {
        let scheduler = self.strong_self();
        self.pool.execute(Box::new(move |scratch| {
            scheduler.run_task(id, work, scratch)
        }));
    }

    fn run_task(&self, id: TaskId, work: TaskWork, scratch: &mut CryptoScratch) {
        match work {
            TaskWork::ReadBlock { store_key, block } => {
                let scheduler = self.strong_self();
                self.store.read(
                    store_key,
                    Box::new(move |mut values| {
                        let value = values.pop().flatten();
                        if !block.is_dummy {
                            let value = value.unwrap_or_else(|| {
                                panic!("slot {store_key} missing for block {}", block.key())
                            });
                            scheduler.decrypt_into(&block, value);
                            (scheduler.read_listener)(&block);
                        }
                        scheduler.finish_task(id, true);
                    }),
                );
            }
            TaskWork::WriteBlock { store_key, block } => {
                let ciphertext = block.encrypt_and_clear(&self.mask, scratch);
                let scheduler = self.strong_self();
                self.store.write(
                    WriteOp::write(store_key, ciphertext),
                    Box::new(move || scheduler.finish_task(id, true)),
                );
            }
            TaskWork::WriteLogEntry { store_key, payload } => {
                let mut payload = payload;
                self.recovery_cipher.mask(&mut payload, store_key);
                let scheduler = self.strong_self();
                self.store.write(
                    WriteOp::write(store_key, payload),
                    Box::new(move || scheduler.finish_task(id, false)),
                );
            }
        }
    }

    fn decrypt_into(&self, block: &Arc<Block>, value: Vec<u8>) {
        let mut scratch = self
            .scratch_pool
            .lock()
            .pop()
            .unwrap_or_else(|| CryptoScratch::new(self.mask.value_size()));
        block.decrypt_and_set(value, &self.mask, &mut scratch);
        self.scratch_pool.lock().push(scratch);
    }

    fn finish_task(&self, id: TaskId, counted: bool) {
        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            let node = state.tasks.remove(&id).expect("finishing unknown task");
            for succ in node.succ {
                let succ_node = state
                    .tasks
                    .get_mut(&succ)
                    .expect("successor vanished before release");
                succ_node.pred -= 1;
                if succ_node.pred == 0 {
                    if let Some(work) = succ_node.work.take() {
                        released.push((succ, work));
                    }
                }
            }
            if let Some(conflict_key) = node.conflict_key {
                if state.last_physical.get(&conflict_key) == Some(&id) {
                    state.last_physical.remove(&conflict_key);
                }
            }
            if node.is_read {
                if let Some(real_key) = node.real_key {
                    if state.last_real.get(&real_key) == Some(&id) {
                        state.last_real.remove(&real_key);
                    }
                }
            }
            if let Some(entry) = node.log_entry {
                if state.last_log_entry.get(&entry) == Some(&id) {
                    state.last_log_entry.remove(&entry);
                }
            }
        }
        for (succ, work) in released {
            self.dispatch(succ, work);
        }
        if counted {
            self.tracker.finished_task();
        }
    }
}

impl GraphState {
    fn alloc_id(&mut self) -> TaskId {
        self.next_id += 1;
        self.next_id
    }

    fn link(&mut self, pred: TaskId, id: TaskId, node: &mut TaskNode) {
        assert!(id > pred, "task ids must increase along dependencies");
        let pred_node = self.tasks.get_mut(&pred).expect("predecessor vanished");
        pred_node.succ.push(id);
        node.pred += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OramConfig;
    use crate::store::{AsyncOverSync, MemoryStore, ReadCompletion, WriteCompletion};
    use crate::store::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mask_context() -> Arc<MaskContext> {
        let config = OramConfig {
            value_size: 8,
            encrypt_blocks: false,
            ..OramConfig::default()
        };
        Arc::new(MaskContext::new(&config).unwrap())
    }

    /// A store that records the order of operations on each key.
    struct RecordingStore {
        inner: AsyncOverSync<MemoryStore>,
        ops: Mutex<Vec<(PhysicalKey, &'static str)>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                inner: AsyncOverSync::new(MemoryStore::new()),
                ops: Mutex::new(Vec::new()),
            }
        }
    }

    impl AsyncBackingStore for RecordingStore {
        fn read(&self, key: PhysicalKey, completion: ReadCompletion) {
            self.ops.lock().push((key, "read"));
            self.inner.read(key, completion);
        }
        fn read_many(&self, keys: Vec<PhysicalKey>, completion: ReadCompletion) {
            self.inner.read_many(keys, completion);
        }
        fn write(&self, op: WriteOp, completion: WriteCompletion) {
            self.ops.lock().push((op.key, "write"));
            self.inner.write(op, completion);
        }
        fn write_many(&self, ops: Vec<WriteOp>, completion: WriteCompletion) {
            self.inner.write_many(ops, completion);
        }
    }

    fn scheduler_over(
        store: Arc<RecordingStore>,
        threads: usize,
    ) -> (Arc<Scheduler>, Arc<BatchTracker>) {
        let pool = Arc::new(WorkerPool::new(threads, 8));
        let tracker = Arc::new(BatchTracker::new(Arc::clone(&pool)));
        let scheduler = Scheduler::new(
            pool,
            store,
            mask_context(),
            Arc::new(RecoveryCipher::new(&[1u8; 16]).unwrap()),
            Arc::clone(&tracker),
            Box::new(|_| {}),
        );
        (scheduler, tracker)
    }

    fn wait_for_batch(tracker: &BatchTracker) {
        let signal = Arc::new(Signal::new());
        let tx = Arc::clone(&signal);
        tracker.begin_batch(Box::new(move || tx.notify(())));
        tracker.metadata_ready();
        signal.wait();
    }

    #[test]
    fn conflicting_slot_ops_run_in_issue_order() {
        let store = Arc::new(RecordingStore::new());
        let (scheduler, tracker) = scheduler_over(Arc::clone(&store), 4);

        for round in 0..10 {
            let writer = Block::new_real(7, Some(vec![round as u8; 8]), 0, false, 0);
            scheduler.schedule_write(99, 99, writer);
            let reader = Block::new_real(7, None, 1, false, 0);
            scheduler.schedule_read(99, 99, reader, None);
        }
        wait_for_batch(&tracker);

        let ops = store.ops.lock();
        let slot_ops: Vec<&'static str> =
            ops.iter().filter(|(k, _)| *k == 99).map(|(_, op)| *op).collect();
        assert_eq!(slot_ops.len(), 20);
        for pair in slot_ops.chunks(2) {
            assert_eq!(pair, ["write", "read"]);
        }
    }

    #[test]
    fn batch_completion_waits_for_metadata() {
        let store = Arc::new(RecordingStore::new());
        let (scheduler, tracker) = scheduler_over(Arc::clone(&store), 2);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let signal = Arc::new(Signal::new());
        let tx = Arc::clone(&signal);
        tracker.begin_batch(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            tx.notify(());
        }));

        // Tasks can easily all finish before the issuer declares the batch.
        for i in 0..8 {
            let block = Block::new_real(i + 1, Some(vec![0u8; 8]), 0, false, 0);
            scheduler.schedule_write(i, i, block);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "fired before metadata was ready");

        tracker.metadata_ready();
        signal.wait();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn log_entry_chain_orders_before_dependent_reads() {
        let store = Arc::new(RecordingStore::new());
        let (scheduler, tracker) = scheduler_over(Arc::clone(&store), 4);

        // Seed the slot so the read has something to find.
        let seed = Block::new_real(5, Some(vec![1u8; 8]), 0, false, 0);
        scheduler.schedule_write(50, 50, seed);
        scheduler.schedule_log_entry(1, None, 1000, vec![0u8; 16]);
        let reader = Block::new_real(5, None, 1, false, 0);
        scheduler.schedule_read(50, 50, reader, Some(1));
        wait_for_batch(&tracker);

        let ops = store.ops.lock();
        let log_pos = ops.iter().position(|(k, _)| *k == 1000).unwrap();
        let read_pos = ops
            .iter()
            .position(|(k, op)| *k == 50 && *op == "read")
            .unwrap();
        assert!(log_pos < read_pos, "log write must precede the dependent read");
    }
}
