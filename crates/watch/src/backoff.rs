use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with up to 10% jitter for watch reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = (capped.as_millis() as u64) / 10;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..jitter_ms) } else { 0 };
        capped + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// A watch timeout drawn uniformly from `[min, max)`.
pub fn watch_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}
