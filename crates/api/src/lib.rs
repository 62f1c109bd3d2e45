//! konform engine façade.
//!
//! `Engine` ties the declared cache, the watch manager, the object queue and
//! the appliers together for one scope. Frontends call `sync` with a new
//! declared state and `run_workers` once; everything else is driven by
//! watch events.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
mod worker;

pub use config::EngineConfig;
pub use engine::{Engine, PlanEntry};
pub use konform_diff::Operation;

use konform_core::{CoreError, MultiError};

/// Errors from a sync or resync.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The declared set was rejected; the previous one stays published.
    #[error("declared state: {0}")]
    Declared(#[from] CoreError),
    #[error("reconcile: {0}")]
    Reconcile(#[from] MultiError),
}

pub type EngineResult<T> = Result<T, EngineError>;
