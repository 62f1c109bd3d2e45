//! konform apply: single-object writes for the worker, full apply-and-prune
//! passes for resyncs, and the persisted inventory that makes pruning safe.

#![forbid(unsafe_code)]

pub mod applier;
pub mod bulk;
pub mod inventory;

pub use applier::{management_conflict, Applier, ApplierConfig, DEFAULT_FIELD_MANAGER, DEFAULT_MAX_CONFLICT_RETRIES};
pub use bulk::BulkApplier;
pub use inventory::{inventory_id, Inventory, INVENTORY_NAME};
