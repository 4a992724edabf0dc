//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{StateRecord, StateSnapshot};
use crate::error::Result;
use crate::graph::ResourceId;

/// Trait for state storage backends.
///
/// Records are stored individually; `commit` and `remove` touch exactly one
/// record so an interrupted run never damages the others.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every record. Called once per run, before planning.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Reads a single record.
    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>>;

    /// Writes or replaces the record for `id`.
    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()>;

    /// Deletes the record for `id`. Missing records are not an error.
    async fn remove(&self, id: &ResourceId) -> Result<()>;

    /// Acquires the state lock.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the lock held under `lock_id` by a full expiry period.
    ///
    /// A lock that expired but was not taken over is revived. Fails if the
    /// lock is gone or now belongs to someone else.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes the lock regardless of owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<StateSnapshot> {
        (**self).load().await
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        (**self).get(id).await
    }

    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        (**self).commit(id, record).await
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        (**self).remove(id).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).renew_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
