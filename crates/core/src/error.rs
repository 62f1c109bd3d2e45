//! Error taxonomy shared by every konform crate.

use std::fmt;

use crate::identity::{Gvk, ResourceId};

/// Failures turning an input object into the internal representation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("normalize: {0}")]
    Normalize(String),
}

/// Errors reported by a resource-store client.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency failure: the supplied resource version is stale.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The watch cursor is too old to resume from.
    #[error("expired: {0}")]
    Expired(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// How an error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid or contradictory directives; needs a declarative fix.
    Policy,
    /// Another scope owns the object; needs a declarative fix.
    Ownership,
    /// Network, concurrency or propagation delay; retried with backoff.
    Transient,
    /// An unreachable state; never acted on destructively.
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Policy => "policy",
            Self::Ownership => "ownership",
            Self::Transient => "transient",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A per-object reconciliation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("{id}: invalid management annotation {value:?}")]
    InvalidManagement { id: ResourceId, value: String },

    #[error("{id}: management conflict: managed by {manager:?}, cannot be managed by {scope:?}")]
    ManagementConflict { id: ResourceId, manager: String, scope: String },

    #[error("{gvk}: kind not recognized by the resource store")]
    UnknownKind { gvk: Gvk },

    #[error("{id}: {source}")]
    Store { id: ResourceId, source: StoreError },

    /// A kind-level store failure, such as a watch that could not be opened.
    #[error("{gvk}: {source}")]
    Kind { gvk: Gvk, source: StoreError },

    #[error("{id}: still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { id: ResourceId, attempts: u32 },

    #[error("internal: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn store(id: &ResourceId, source: StoreError) -> Self {
        match source {
            StoreError::UnknownKind(_) => Self::UnknownKind { gvk: id.gvk() },
            source => Self::Store { id: id.clone(), source },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidManagement { .. } => ErrorClass::Policy,
            Self::ManagementConflict { .. } => ErrorClass::Ownership,
            Self::Store { source: StoreError::Invalid(_), .. } => ErrorClass::Policy,
            Self::UnknownKind { .. }
            | Self::Store { .. }
            | Self::Kind { .. }
            | Self::ConflictRetriesExhausted { .. } => ErrorClass::Transient,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<CoreError> for ReconcileError {
    fn from(e: CoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Errors accumulated across a batch; the batch is never aborted early.
#[derive(Debug, Clone, Default)]
pub struct MultiError {
    errors: Vec<ReconcileError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ReconcileError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ReconcileError] {
        &self.errors
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => f.write_str("no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "{} errors: ", n)?;
                for (i, e) in self.errors.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl From<ReconcileError> for MultiError {
    fn from(e: ReconcileError) -> Self {
        Self { errors: vec![e] }
    }
}

impl FromIterator<ReconcileError> for MultiError {
    fn from_iter<I: IntoIterator<Item = ReconcileError>>(iter: I) -> Self {
        Self { errors: iter.into_iter().collect() }
    }
}
