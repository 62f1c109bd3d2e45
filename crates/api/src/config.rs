use std::time::Duration;

use konform_apply::{DEFAULT_FIELD_MANAGER, DEFAULT_MAX_CONFLICT_RETRIES};
use konform_core::Scope;
use konform_watch::WatcherConfig;

/// Runtime settings for one reconciler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scope: Scope,
    pub workers: usize,
    /// Interval between full apply-and-prune passes.
    pub resync: Duration,
    pub field_manager: String,
    pub max_conflict_retries: u32,
    /// Backoff between passes retried because a declared kind could not be
    /// resolved or watched.
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub watch: WatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope: Scope::Root,
            workers: 4,
            resync: Duration::from_secs(3600),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            watch: WatcherConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    /// Defaults overridden by `KONFORM_*` variables; unparseable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        let scope = std::env::var("KONFORM_SCOPE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(Scope::Namespace)
            .unwrap_or(d.scope);
        let watch = WatcherConfig {
            timeout_min: env_parse("KONFORM_WATCH_TIMEOUT_MIN_SECS").map(Duration::from_secs).unwrap_or(d.watch.timeout_min),
            timeout_max: env_parse("KONFORM_WATCH_TIMEOUT_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch.timeout_max),
            ..d.watch
        };
        Self {
            scope,
            workers: env_parse("KONFORM_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            resync: env_parse("KONFORM_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync),
            field_manager: std::env::var("KONFORM_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
            max_conflict_retries: env_parse("KONFORM_MAX_CONFLICT_RETRIES").unwrap_or(d.max_conflict_retries),
            retry_base: d.retry_base,
            retry_max: env_parse("KONFORM_RETRY_MAX_SECS").map(Duration::from_secs).unwrap_or(d.retry_max),
            watch,
        }
    }
}
