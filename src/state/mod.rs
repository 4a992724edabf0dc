//! State management module for the cairn reconciliation engine.
//!
//! This module provides persistent storage of the last-known actual state of
//! every resource, one record per resource, plus single-writer locking.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEWAL_SECS, LockInfo, generate_holder_id};
pub use memory::{JournalEntry, MemoryStateStore};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{STATE_VERSION, StateRecord, StateSnapshot};
