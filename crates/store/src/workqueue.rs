//! Ordered, deduplicating work queue with delayed and rate-limited adds.
//!
//! An item is never handed to two consumers at once: while it is being
//! processed, further adds only mark it dirty and it is queued again on
//! `done`.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;

use crate::ratelimit::ItemExponentialRateLimiter;

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

struct Inner<K: Eq + Hash> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Mutex<ItemExponentialRateLimiter<K>>,
}

pub struct WorkQueue<K: Eq + Hash> {
    inner: Arc<Inner<K>>,
}

impl<K: Eq + Hash> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_rate_limiter(ItemExponentialRateLimiter::default())
    }

    pub fn with_rate_limiter(limiter: ItemExponentialRateLimiter<K>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Mutex::new(limiter),
            }),
        }
    }

    pub fn add(&self, item: K) {
        let mut st = lock(&self.inner.state);
        if st.shutting_down || !st.dirty.insert(item.clone()) {
            return;
        }
        if st.processing.contains(&item) {
            return;
        }
        st.queue.push_back(item);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = lock(&self.inner.state);
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `item` finished; requeue it if it was re-added meanwhile.
    pub fn done(&self, item: &K) {
        let mut st = lock(&self.inner.state);
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.add(item);
                });
            }
            Err(_) => self.add(item),
        }
    }

    /// Add `item` after its current backoff delay.
    pub fn add_rate_limited(&self, item: K) {
        let delay = lock(&self.inner.limiter).when(item.clone());
        self.add_after(item, delay);
    }

    /// Reset backoff for `item`.
    pub fn forget(&self, item: &K) {
        lock(&self.inner.limiter).forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.inner.limiter).num_requeues(item)
    }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        lock(&self.inner.state).shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }
}
