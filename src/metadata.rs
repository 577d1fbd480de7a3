//! Sidecar metadata persistence and the in-memory session cache.
//!
//! Every upload owns a zero-byte `{id}.info` object whose user metadata
//! carries the JSON-encoded upload record, the multipart upload id, and the
//! tus version. The cache avoids a HeadObject round trip per operation and
//! is invalidated on errors so a stale upload id never survives a restart.

use crate::client::ObjectStore;
use crate::error::StoreError;
use crate::types::{Upload, UploadSession, TUS_VERSION};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Sidecar key suffix
const INFO_SUFFIX: &str = ".info";

/// Thread-safe metadata store backed by sidecar objects
pub struct MetadataStore {
    client: Arc<dyn ObjectStore>,
    cache: RwLock<HashMap<String, UploadSession>>,
}

impl MetadataStore {
    pub fn new(client: Arc<dyn ObjectStore>) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn info_key(id: &str) -> String {
        format!("{}{}", id, INFO_SUFFIX)
    }

    /// Persist the upload record as a sidecar object and refresh the cache.
    pub async fn save(&self, upload: &Upload, upload_id: &str) -> Result<(), StoreError> {
        let mut user_metadata = HashMap::new();
        user_metadata.insert("file".to_string(), serde_json::to_string(upload)?);
        user_metadata.insert("upload_id".to_string(), upload_id.to_string());
        user_metadata.insert("tus_version".to_string(), TUS_VERSION.to_string());

        self.client
            .put_object(&Self::info_key(&upload.id), Bytes::new(), &user_metadata)
            .await?;

        self.cache.write().insert(
            upload.id.clone(),
            UploadSession {
                file: upload.clone(),
                upload_id: upload_id.to_string(),
                tus_version: TUS_VERSION.to_string(),
            },
        );

        debug!(id = %upload.id, "saved upload sidecar");
        Ok(())
    }

    /// Return the session for an upload, reading the sidecar on cache miss.
    pub async fn get(&self, id: &str) -> Result<UploadSession, StoreError> {
        if let Some(session) = self.cache.read().get(id) {
            return Ok(session.clone());
        }

        let metadata = self
            .client
            .head_object(&Self::info_key(id))
            .await
            .map_err(|e| match e {
                StoreError::FileNotFound(_) => StoreError::FileNotFound(id.to_string()),
                other => other,
            })?;

        let file_json = metadata.get("file").ok_or_else(|| {
            StoreError::InvalidMetadata(format!("sidecar for {} has no file record", id))
        })?;
        let file: Upload = serde_json::from_str(file_json)?;

        // Some S3-compatible providers (DigitalOcean Spaces) normalize
        // metadata keys, turning `upload_id` into `upload-id`.
        let upload_id = metadata
            .get("upload_id")
            .or_else(|| metadata.get("upload-id"))
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidMetadata(format!("sidecar for {} has no upload id", id))
            })?;

        let tus_version = metadata
            .get("tus_version")
            .or_else(|| metadata.get("tus-version"))
            .cloned()
            .unwrap_or_else(|| TUS_VERSION.to_string());

        let session = UploadSession {
            file,
            upload_id,
            tus_version,
        };
        self.cache.write().insert(id.to_string(), session.clone());

        debug!(id, "loaded upload sidecar");
        Ok(session)
    }

    /// Drop the cache entry for an upload; idempotent.
    pub fn clear(&self, id: &str) {
        self.cache.write().remove(id);
    }

    /// Whether the cache currently holds a session for this upload.
    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.read().contains_key(id)
    }
}
