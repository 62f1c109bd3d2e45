//! Per-item exponential backoff for requeues.

use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Delay for an item doubles with each consecutive failure, starting at
/// `base` and capped at `max`. `forget` resets the item.
#[derive(Debug, Clone)]
pub struct ItemExponentialRateLimiter<K: Eq + Hash> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash> Default for ItemExponentialRateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K: Eq + Hash> ItemExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }

    /// Delay before `item` may be processed again; records one more failure.
    pub fn when(&mut self, item: K) -> Duration {
        let count = self.failures.entry(item).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        // 2^31 * 5ms is far past any sane max; clamp the shift.
        let factor = 1u64.checked_shl(exp.min(31)).unwrap_or(u64::MAX);
        let nanos = (self.base.as_nanos() as u64).saturating_mul(factor);
        Duration::from_nanos(nanos).min(self.max)
    }

    pub fn forget(&mut self, item: &K) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}
