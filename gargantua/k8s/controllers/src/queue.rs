use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

/// A key-addressed work queue shared by a controller's watches and workers.
///
/// A key is handed to at most one worker at a time: adding a key while it is being processed
/// marks it dirty, and it is queued again when the worker calls [`WorkQueue::done`]. Delayed adds
/// for the same key coalesce to the earliest deadline.
pub struct WorkQueue<K> {
    inner: Arc<Mutex<Inner<K>>>,
    notify: Arc<Notify>,
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    delayed: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

const BASE_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1000);

// === impl WorkQueue ===

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: HashMap::new(),
                failures: HashMap::new(),
                shutting_down: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queues a key for immediate processing, replacing any delayed add.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        inner.delayed.remove(&key);
        if inner.insert(key) {
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Queues a key once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }

        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        let at = inner.delayed.entry(key).or_insert(deadline);
        if deadline < *at {
            *at = deadline;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Queues a key after a delay that doubles with each consecutive failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut inner = self.inner.lock();
            let failures = inner.failures.entry(key.clone()).or_default();
            let delay = backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears a key's failure history.
    pub fn forget(&self, key: &K) {
        self.inner.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut inner = self.inner.lock();
                inner.promote(Instant::now());
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
                inner.delayed.values().min().copied()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks a key as processed, queueing it again if it was added in the meantime.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Stops accepting keys. Keys already queued are still handed out.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;
        inner.delayed.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Completes when the queue has been shut down.
    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().shutting_down {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// The number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Inner ===

impl<K: Clone + Eq + Hash> Inner<K> {
    /// Marks a key dirty, queueing it unless a worker holds it. Returns false if it was already
    /// dirty.
    fn insert(&mut self, key: K) -> bool {
        if !self.dirty.insert(key.clone()) {
            return false;
        }
        if !self.processing.contains(&key) {
            self.queue.push_back(key);
        }
        true
    }

    fn promote(&mut self, now: Instant) {
        let mut due = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, k.clone()))
            .collect::<Vec<_>>();
        if due.is_empty() {
            return;
        }
        due.sort_by_key(|(at, _)| *at);
        for (_, key) in due {
            self.delayed.remove(&key);
            self.insert(key);
        }
    }
}

fn backoff(failures: u32) -> Duration {
    BASE_BACKOFF
        .checked_mul(2u32.saturating_pow(failures))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}
