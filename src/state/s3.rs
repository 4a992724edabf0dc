//! S3-based state storage backend.
//!
//! Each record is stored as its own object under `{prefix}records/`, so a
//! commit is a single PUT and never rewrites other records.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};
use crate::graph::ResourceId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Key segment under which records are stored.
const RECORDS_KEY: &str = "records/";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets the key of the object holding `id`.
    fn record_key(&self, id: &ResourceId) -> String {
        self.key(&format!("{RECORDS_KEY}{id}.json"))
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists every key under `prefix`, following continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(ToString::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    fn parse_record(key: &str, content: &str) -> Result<StateRecord> {
        let record: StateRecord = serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {key}: {e}")))?;
        record.check_version()?;
        Ok(record)
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let prefix = self.key(RECORDS_KEY);
        debug!("Loading state from s3://{}/{prefix}", self.bucket);

        let mut snapshot = StateSnapshot::new();
        for key in self.list_keys(&prefix).await? {
            if !key.ends_with(".json") {
                continue;
            }
            // Deleted between list and get
            let Some(content) = self.get_object(&key).await? else {
                warn!("Record disappeared during load: {key}");
                continue;
            };
            snapshot.insert(Self::parse_record(&key, &content)?);
        }

        info!(records = snapshot.len(), "Loaded state from s3://{}/{prefix}", self.bucket);
        Ok(snapshot)
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let key = self.record_key(id);
        match self.get_object(&key).await? {
            Some(content) => Self::parse_record(&key, &content).map(Some),
            None => Ok(None),
        }
    }

    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        let key = self.record_key(id);

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        self.put_object(&key, &content).await?;
        debug!(resource = %id, "Committed state record to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        let key = self.record_key(id);
        self.delete_object(&key).await?;
        debug!(resource = %id, "Removed state record");
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.get_lock_info().await? {
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

        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        self.put_object(&self.key(LOCK_KEY), &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
            .get_lock_info()
            .await?
            .filter(|existing| existing.lock_id == lock_id)
            .ok_or_else(|| StateError::lock_lost(lock_id))?;
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.put_object(&self.key(LOCK_KEY), &content).await?;

        debug!(lock_id, expires_at = %lock_info.expires_at, "Renewed state lock");
        Ok(lock_info)
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at s3://{}/{}", self.bucket, self.key(LOCK_KEY));
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let lock_info: LockInfo = serde_json::from_str(&content)
                .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;

            return Ok(Some(lock_info));
        }

        Ok(None)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("webshop/prod/")), "webshop/prod/");
        assert_eq!(normalize_prefix(Some("/webshop")), "webshop/");
    }
}
