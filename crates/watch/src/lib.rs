//! konform change detection: a filtered watch per declared kind, feeding the
//! object queue, and the manager that follows the declared kind set.

#![forbid(unsafe_code)]

mod backoff;
pub mod filtered;
pub mod manager;

pub use backoff::Backoff;
pub use filtered::{FilteredWatcher, WatcherConfig};
pub use manager::WatchManager;
