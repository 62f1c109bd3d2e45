//! konform in-RAM state: the declared resource cache and the object work queue.

#![forbid(unsafe_code)]

pub mod declared;
pub mod queue;
pub mod ratelimit;
pub mod workqueue;

pub use declared::{DeclaredResourceCache, DeclaredSnapshot};
pub use queue::ObjectQueue;
pub use ratelimit::ItemExponentialRateLimiter;
pub use workqueue::WorkQueue;
