//! The work queue that sits between the watches and the reconcile workers. It has the same
//! semantics as the rate limited work queues used by most Kubernetes controllers:
//!
//! - a key that's already waiting in the queue is only queued once
//! - a key is never handed to two workers at the same time. If a key is added while it's being
//!   processed, then it's marked as dirty and is queued again once the worker calls `done`
//! - `add_rate_limited` delays a key by its backoff, which grows with every call until the key is
//!   `forget`-ed
use crate::config::BackoffConfig;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use prometheus::IntGauge;
use tokio::sync::Notify;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Decides how long a key should wait before being retried, based on the number of times in a
/// row that it has been requeued
pub trait BackoffPolicy: Send + Sync + 'static {
    fn backoff_for(&self, failures: u32) -> Duration;
}

/// Always waits for the same amount of time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn backoff_for(&self, _failures: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff with jitter, as computed by `backoff::ExponentialBackoff`
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoffPolicy {
    config: BackoffConfig,
}

// the interval stops growing long before this
const MAX_BACKOFF_STEPS: u32 = 64;

impl ExponentialBackoffPolicy {
    pub fn new(config: BackoffConfig) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy { config }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.config.initial_interval,
            initial_interval: self.config.initial_interval,
            randomization_factor: self.config.randomization_factor,
            multiplier: self.config.multiplier,
            max_interval: self.config.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn backoff_for(&self, failures: u32) -> Duration {
        let mut backoff = self.new_backoff();
        let mut interval = self.config.initial_interval;
        for _ in 0..failures.clamp(1, MAX_BACKOFF_STEPS) {
            interval = backoff.next_backoff().unwrap_or(self.config.max_interval);
        }
        interval
    }
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct QueueInner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: Box<dyn BackoffPolicy>,
    depth: Option<IntGauge>,
}

/// A cheaply cloneable handle to a work queue
pub struct WorkQueue<K> {
    inner: Arc<QueueInner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(backoff: impl BackoffPolicy) -> WorkQueue<K> {
        WorkQueue::build(Box::new(backoff), None)
    }

    /// Same as `new`, but keeps the given gauge updated with the number of waiting keys
    pub fn with_depth_gauge(backoff: impl BackoffPolicy, depth: IntGauge) -> WorkQueue<K> {
        WorkQueue::build(Box::new(backoff), Some(depth))
    }

    fn build(backoff: Box<dyn BackoffPolicy>, depth: Option<IntGauge>) -> WorkQueue<K> {
        WorkQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
                depth,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // a panic while holding this lock leaves the state consistent, so poisoning is ignored
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update_depth(&self, state: &QueueState<K>) {
        if let Some(gauge) = self.inner.depth.as_ref() {
            gauge.set(state.queue.len() as i64);
        }
    }

    /// Queues the key for processing, unless it's already waiting
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            log::debug!("Ignoring key {:?} since the queue is shutting down", key);
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            log::trace!("Key {:?} is being processed, will be requeued when done", key);
            return;
        }
        state.queue.push_back(key);
        self.update_depth(&state);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds the key after the given delay. Must be called from within a tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay == Duration::from_secs(0) {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds the key after its backoff, and increments its failure count
    pub fn add_rate_limited(&self, key: K) {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.inner.backoff.backoff_for(failures);
        log::debug!(
            "Requeueing key {:?} after {:?}, requeue count: {}",
            key,
            delay,
            failures
        );
        self.add_after(key, delay);
    }

    /// Resets the backoff for the key
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// The number of times in a row that the key has been requeued with a backoff
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key to process. Returns `None` once the queue has been shut down and
    /// there's nothing left to process. Every key that's returned must be passed to `done`.
    pub async fn get(&self) -> Option<K> {
        loop {
            // created before checking the state so that a notification in between isn't lost
            let notified = self.inner.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.update_depth(&state);
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the key as no longer being processed. If it was added again while it was being
    /// processed, then it goes back into the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            self.update_depth(&state);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting new keys and wakes up all the workers. Keys that are already queued are
    /// still handed out by `get`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// The number of keys waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::time::Instant;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(FixedBackoff(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn waiting_keys_are_deduplicated() {
        let queue = queue();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(2, queue.len());
        assert_eq!(Some("a"), queue.get().await);
        assert_eq!(Some("b"), queue.get().await);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_processing_is_requeued_on_done() {
        let queue = queue();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        queue.add("a");
        // never handed to a second worker while the first is still processing it
        assert_eq!(0, queue.len());
        queue.done(&key);
        assert_eq!(1, queue.len());
        assert_eq!(Some("a"), queue.get().await);
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_returns_none_after_shutdown() {
        let queue = queue();
        queue.add("a");
        queue.shut_down();
        queue.add("b");
        assert_eq!(Some("a"), queue.get().await);
        assert_eq!(None, queue.get().await);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let queue = queue();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(None, worker.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_keys_wait_for_their_backoff() {
        let queue = queue();
        let start = Instant::now();
        queue.add_rate_limited("a");
        assert_eq!(1, queue.num_requeues(&"a"));
        assert!(queue.is_empty());
        assert_eq!(Some("a"), queue.get().await);
        assert!(start.elapsed() >= Duration::from_secs(5));

        queue.forget(&"a");
        assert_eq!(0, queue.num_requeues(&"a"));
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let policy = ExponentialBackoffPolicy::new(BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1000),
            multiplier: 2.0,
            randomization_factor: 0.0,
        });
        assert_eq!(Duration::from_millis(100), policy.backoff_for(1));
        assert_eq!(Duration::from_millis(200), policy.backoff_for(2));
        assert_eq!(Duration::from_millis(400), policy.backoff_for(3));
        assert_eq!(Duration::from_millis(1000), policy.backoff_for(10));
        assert_eq!(Duration::from_millis(1000), policy.backoff_for(10_000));
    }
}
