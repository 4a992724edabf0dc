//! In-process state storage backend.
//!
//! Used for dry runs and tests. Every mutation is appended to a journal so
//! callers can observe the order in which records were written.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, StateError};
use crate::graph::ResourceId;

use super::lock::{LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// A mutation recorded by [`MemoryStateStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A record was written.
    Commit(ResourceId),
    /// A record was deleted.
    Remove(ResourceId),
}

/// In-process state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<StateSnapshot>,
    lock: Mutex<Option<LockInfo>>,
    journal: Mutex<Vec<JournalEntry>>,
    failing: Mutex<HashSet<ResourceId>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            records: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    /// Makes every later commit or removal of `id` fail.
    pub async fn fail_writes_for(&self, id: ResourceId) {
        self.failing.lock().await.insert(id);
    }

    /// Backdates the current lock so it reads as expired.
    pub async fn expire_lock(&self) {
        if let Some(lock) = self.lock.lock().await.as_mut() {
            lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        }
    }

    /// Returns the mutations performed so far, oldest first.
    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().await.clone()
    }

    async fn check_writable(&self, id: &ResourceId) -> Result<()> {
        if self.failing.lock().await.contains(id) {
            return Err(StateError::backend(format!("Write rejected for {id}")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self.records.read().await.clone())
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        self.check_writable(id).await?;
        self.records.write().await.insert(record.clone());
        self.journal.lock().await.push(JournalEntry::Commit(id.clone()));
        debug!(resource = %id, "Committed state record in memory");
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        self.check_writable(id).await?;
        self.records.write().await.remove(id);
        self.journal.lock().await.push(JournalEntry::Remove(id.clone()));
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        if let Some(existing) = slot.as_ref().filter(|lock| !lock.is_expired()) {
            return Err(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let info = LockInfo::new(&holder_or_generated(holder), operation);
        *slot = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut slot = self.lock.lock().await;
        if slot.as_ref().is_some_and(|lock| lock.lock_id == lock_id) {
            *slot = None;
        }
        Ok(())
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        let lock = slot
            .as_mut()
            .filter(|lock| lock.lock_id == lock_id)
            .ok_or_else(|| StateError::lock_lost(lock_id))?;
        lock.refresh();
        Ok(lock.clone())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
