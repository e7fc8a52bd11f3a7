//! Sync engine for fetching and storing mail
//!
//! Cycles are idempotent and can be safely retried: the cursor only moves
//! when a batch commits.

mod backoff;
mod delta;
mod engine;
mod scheduler;

pub use backoff::BackoffPolicy;
pub use delta::{DeltaBatch, DeltaFetcher};
pub use engine::{SyncEngine, SyncError, SyncReport, SyncRunner};
pub use scheduler::{AccountStatus, AccountSyncState, SyncRequest, SyncScheduler};
