//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `CheckpointStore`: Partitioned tier/error output with id-level dedupe
//! - `FlushTransaction`: Write-ahead batches with crash recovery
//! - `AuditLog`: Raw model and judge exchanges, one JSON line each

mod audit;
mod store;
mod transaction;

pub use audit::*;
pub use store::*;
pub use transaction::*;
