//! Work queue and worker pool.
//!
//! Reconciliation is driven by keys pushed onto a [`WorkQueue`]. A key is
//! never handed to two workers at once: adding a key that is being processed
//! marks it dirty, and it is queued again once the current worker is done.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::error::Result;

/// What a reconciler wants done with its key afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do.
    Done,
    /// Try again soon, with backoff.
    Requeue,
    /// Try again after a fixed delay.
    RequeueAfter(Duration),
}

/// Reconciles one key at a time.
pub trait Reconciler: Send + Sync + 'static {
    /// Queue key.
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Queue name used in logs.
    fn name(&self) -> &'static str;

    /// Drives `key` one step towards its desired state.
    fn reconcile(&self, key: &Self::Key) -> impl Future<Output = Result<ReconcileOutcome>> + Send;
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            shutdown: false,
        }
    }
}

/// A deduplicating FIFO of keys. Cloning shares the queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Arc<Mutex<QueueState<K>>>,
    notify: Arc<Notify>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<K> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `key` unless it is already queued.
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutdown || state.queued.contains(&key) {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        state.queued.insert(key.clone());
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queues `key` after `delay`. Requires a tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown {
            state.queued.insert(key.clone());
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Counts a failure for `key`, returning the total so far.
    pub fn record_failure(&self, key: &K) -> u32 {
        let mut state = self.state.lock();
        let n = state.failures.entry(key.clone()).or_insert(0);
        *n += 1;
        *n
    }

    /// Resets the failure count for `key`.
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Keys waiting to be processed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true if no key is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

/// Spawns and owns the workers serving one queue.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks that feed keys from `queue` to `reconciler`.
    /// Workers only act while `leader` is true; keys taken on a standby
    /// replica are dropped and picked up again by the next pass.
    pub fn spawn<R: Reconciler>(
        reconciler: Arc<R>,
        queue: WorkQueue<R::Key>,
        workers: usize,
        backoff: Backoff,
        leader: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|worker| {
                let reconciler = Arc::clone(&reconciler);
                let queue = queue.clone();
                let backoff = backoff.clone();
                let leader = leader.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let key = tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            key = queue.get() => key,
                        };
                        let Some(key) = key else { break };
                        if !*leader.borrow() {
                            debug!(queue = reconciler.name(), key = %key, "not leader, dropping key");
                            queue.done(&key);
                            continue;
                        }
                        process(&*reconciler, &queue, &backoff, key, worker).await;
                    }
                })
            })
            .collect();
        Self { handles }
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

async fn process<R: Reconciler>(
    reconciler: &R,
    queue: &WorkQueue<R::Key>,
    backoff: &Backoff,
    key: R::Key,
    worker: usize,
) {
    let outcome = reconciler.reconcile(&key).await;
    queue.done(&key);
    match outcome {
        Ok(ReconcileOutcome::Done) => queue.forget(&key),
        Ok(ReconcileOutcome::Requeue) => {
            let attempt = queue.record_failure(&key);
            queue.add_after(key, backoff.jittered(attempt));
        }
        Ok(ReconcileOutcome::RequeueAfter(delay)) => {
            queue.forget(&key);
            queue.add_after(key, delay);
        }
        Err(e) if e.is_retryable() => {
            let attempt = queue.record_failure(&key);
            let delay = backoff.jittered(attempt);
            warn!(queue = reconciler.name(), worker, key = %key, attempt, error = %e, "reconcile failed, requeueing");
            queue.add_after(key, delay);
        }
        Err(e) => {
            error!(queue = reconciler.name(), worker, key = %key, error = %e, "reconcile failed");
            queue.forget(&key);
        }
    }
}
