//! Local file-based state storage backend.
//!
//! Each record lives in its own JSON file under `.cairn/records/`, written
//! through a temporary file and a rename so a crash mid-write leaves the
//! previous version intact.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{CairnError, Result, StateError};
use crate::graph::ResourceId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".cairn";

/// Subdirectory holding one file per record.
const RECORDS_DIR: &str = "records";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory holding record files.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.cairn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| CairnError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join(RECORDS_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            records_dir,
            lock_path,
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path of the file holding `id`.
    fn record_path(&self, id: &ResourceId) -> Result<PathBuf> {
        let file_name = id.to_string();
        let safe = file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe || file_name.contains("..") {
            return Err(StateError::backend(format!(
                "Resource identifier cannot be used as a file name: {id}"
            ))
            .into());
        }
        Ok(self.records_dir.join(format!("{file_name}.json")))
    }

    /// Ensures a directory exists.
    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create {}: {e}", temp_path.display()))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StateError::backend(format!("Failed to write {}: {e}", temp_path.display()))
        })?;

        file.sync_all().await.map_err(|e| {
            StateError::backend(format!("Failed to sync {}: {e}", temp_path.display()))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            StateError::backend(format!("Failed to rename {}: {e}", temp_path.display()))
        })?;

        Ok(())
    }

    /// Reads and parses one record file.
    async fn read_record(path: &Path) -> Result<StateRecord> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read {}: {e}", path.display()))
        })?;

        let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display()))
        })?;

        record.check_version()?;
        Ok(record)
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();

        if !self.records_dir.exists() {
            debug!("State directory does not exist: {}", self.records_dir.display());
            return Ok(snapshot);
        }

        let mut entries = fs::read_dir(&self.records_dir)
            .await
            .map_err(|e| StateError::backend(format!("Failed to list state records: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::backend(format!("Failed to list state records: {e}")))?
        {
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => snapshot.insert(Self::read_record(&path).await?),
                Some("tmp") => warn!("Ignoring interrupted write: {}", path.display()),
                _ => {}
            }
        }

        info!(
            records = snapshot.len(),
            "Loaded state from: {}",
            self.records_dir.display()
        );
        Ok(snapshot)
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        Self::ensure_dir(&self.records_dir).await?;
        let path = self.record_path(id)?;

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        Self::write_atomic(&path, &content).await?;
        debug!(resource = %id, "Committed state record");
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        let path = self.record_path(id)?;
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| {
                StateError::backend(format!("Failed to delete {}: {e}", path.display()))
            })?;
            debug!(resource = %id, "Removed state record");
        }
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(&holder_or_generated(holder), operation);

        Self::ensure_dir(&self.base_dir).await?;
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&self.lock_path, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock_info = self
            .read_lock_file()
            .await?
            .filter(|existing| existing.lock_id == lock_id)
            .ok_or_else(|| StateError::lock_lost(lock_id))?;
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&self.lock_path, &content).await?;

        debug!(lock_id, expires_at = %lock_info.expires_at, "Renewed state lock");
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
