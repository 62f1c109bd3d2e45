//! ObjectQueue: collapses repeated observations of one identity into a single
//! pending unit of work without losing observations that arrive while the
//! identity is being processed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use konform_core::{ActualResource, ObjectKey};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::ratelimit::ItemExponentialRateLimiter;
use crate::workqueue::WorkQueue;

#[derive(Default)]
struct Tracked {
    /// Best known observation per identity.
    objects: FxHashMap<ObjectKey, Arc<ActualResource>>,
    /// Identities needing another pass.
    dirty: FxHashSet<ObjectKey>,
}

struct Inner {
    mux: Mutex<Tracked>,
    underlying: WorkQueue<ObjectKey>,
}

#[derive(Clone)]
pub struct ObjectQueue {
    inner: Arc<Inner>,
}

impl Default for ObjectQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectQueue {
    pub fn new() -> Self {
        Self::with_rate_limiter(ItemExponentialRateLimiter::default())
    }

    pub fn with_rate_limiter(limiter: ItemExponentialRateLimiter<ObjectKey>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mux: Mutex::new(Tracked::default()),
                underlying: WorkQueue::with_rate_limiter(limiter),
            }),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.inner.mux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an observation and schedule its identity.
    ///
    /// An observation older (by generation) than the stored one is ignored.
    /// Equal generations replace the stored object: metadata-only edits do
    /// not bump the generation.
    pub fn add(&self, obj: ActualResource) {
        let key = match obj.key() {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "dropping observation without identity");
                return;
            }
        };
        let mut t = self.tracked();
        if let Some(old) = t.objects.get(&key) {
            if old.generation() > obj.generation() {
                debug!(key = %key, stored = old.generation(), got = obj.generation(), "ignoring stale observation");
                counter!("queue_stale_ignored_total", 1u64);
                return;
            }
        }
        t.objects.insert(key.clone(), Arc::new(obj));
        t.dirty.insert(key.clone());
        self.inner.underlying.add(key);
        drop(t);
        counter!("queue_adds_total", 1u64);
        gauge!("queue_depth", self.inner.underlying.len() as f64);
    }

    /// Wait for the next observation. `None` means the queue shut down.
    pub async fn get(&self) -> Option<Arc<ActualResource>> {
        loop {
            let key = self.inner.underlying.get().await?;
            let mut t = self.tracked();
            t.dirty.remove(&key);
            match t.objects.get(&key) {
                Some(obj) => return Some(Arc::clone(obj)),
                None => {
                    drop(t);
                    // Already delivered by an earlier get; nothing left to do.
                    debug!(key = %key, "queued identity has no stored observation");
                    self.inner.underlying.done(&key);
                }
            }
        }
    }

    /// Finish processing. The stored observation is evicted unless the
    /// identity was marked dirty again in the meantime.
    pub fn done(&self, obj: &ActualResource) {
        let Ok(key) = obj.key() else { return };
        let mut t = self.tracked();
        self.inner.underlying.done(&key);
        if !t.dirty.contains(&key) {
            t.objects.remove(&key);
        }
    }

    /// Schedule another attempt after the identity's backoff delay.
    pub fn retry(&self, obj: &ActualResource) {
        let Ok(key) = obj.key() else { return };
        let mut t = self.tracked();
        t.objects.entry(key.clone()).or_insert_with(|| Arc::new(obj.clone()));
        t.dirty.insert(key.clone());
        self.inner.underlying.add_rate_limited(key);
        counter!("queue_retries_total", 1u64);
    }

    /// Reset the identity's backoff after a success.
    pub fn forget(&self, obj: &ActualResource) {
        if let Ok(key) = obj.key() {
            self.inner.underlying.forget(&key);
        }
    }

    pub fn num_requeues(&self, obj: &ActualResource) -> u32 {
        obj.key().map(|k| self.inner.underlying.num_requeues(&k)).unwrap_or(0)
    }

    /// Identities waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.underlying.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.inner.underlying.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.underlying.is_shutting_down()
    }
}
