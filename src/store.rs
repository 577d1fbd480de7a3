//! Upload lifecycle: create, append, offset reconstruction, completion.
//!
//! The store adapts tus semantics onto a multipart upload per file. The
//! front end serializes PATCH requests per upload id (a tus protocol
//! requirement); the store does not take a per-upload lock.

use crate::client::{ObjectStore, S3Client};
use crate::config::S3StoreConfig;
use crate::coordinator::{PartCoordinator, MIN_PART_SIZE};
use crate::error::StoreError;
use crate::metadata::MetadataStore;
use crate::types::{coerce_ascii, parse_metadata_string, Part, Upload, UploadOffset, TUS_VERSION};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

/// tus protocol extensions this store supports
pub const EXTENSIONS: &[&str] = &["creation", "creation-with-upload", "creation-defer-length"];

/// Directory the splitter spills chunk files into. Owned temp dirs are
/// removed when the store is dropped.
enum Scratch {
    Owned(TempDir),
    Configured(PathBuf),
}

impl Scratch {
    fn path(&self) -> &Path {
        match self {
            Scratch::Owned(dir) => dir.path(),
            Scratch::Configured(path) => path,
        }
    }
}

/// tus storage backend over an S3-compatible object store
pub struct S3Store {
    client: Arc<dyn ObjectStore>,
    metadata: MetadataStore,
    coordinator: PartCoordinator,
    scratch: Scratch,
}

impl S3Store {
    /// Connect to the configured object store.
    pub async fn connect(config: S3StoreConfig) -> Result<Self, StoreError> {
        let client: Arc<dyn ObjectStore> = Arc::new(S3Client::new(&config).await);
        Self::with_client(&config, client)
    }

    /// Build a store over an existing client. Test suites use this with an
    /// in-memory object store.
    pub fn with_client(
        config: &S3StoreConfig,
        client: Arc<dyn ObjectStore>,
    ) -> Result<Self, StoreError> {
        if config.part_size < MIN_PART_SIZE {
            warn!(
                part_size = config.part_size,
                "part size is below the 5 MiB floor; every non-final chunk will be discarded"
            );
        }

        let scratch = match &config.tmp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Scratch::Configured(dir.clone())
            }
            None => Scratch::Owned(tempfile::Builder::new().prefix("tus-s3-store-").tempdir()?),
        };

        let metadata = MetadataStore::new(Arc::clone(&client));
        let coordinator = PartCoordinator::new(Arc::clone(&client), config.part_size);

        Ok(Self {
            client,
            metadata,
            coordinator,
            scratch,
        })
    }

    /// tus extensions the store declares to the front end.
    pub fn extensions(&self) -> &'static [&'static str] {
        EXTENSIONS
    }

    /// Initiate an upload: open the multipart upload and persist the
    /// sidecar. Returns the upload unchanged.
    #[instrument(skip(self, upload), fields(id = %upload.id))]
    pub async fn create(&self, upload: Upload) -> Result<Upload, StoreError> {
        if let Err(e) = self.client.bucket_exists().await {
            self.metadata.clear(&upload.id);
            return Err(e);
        }

        let parsed = parse_metadata_string(upload.upload_metadata.as_deref().unwrap_or_default());
        let content_type = parsed.get("contentType").and_then(|v| v.decoded.clone());

        let mut user_metadata = HashMap::new();
        user_metadata.insert("tus_version".to_string(), TUS_VERSION.to_string());
        if let Some(length) = upload.upload_length {
            user_metadata.insert("upload_length".to_string(), length.to_string());
        }
        if upload.upload_defer_length {
            user_metadata.insert("upload_defer_length".to_string(), "1".to_string());
        }
        if let Some(ref raw) = upload.upload_metadata {
            user_metadata.insert("upload_metadata".to_string(), coerce_ascii(raw));
        }
        if let Some(original_name) = parsed.get("filename").and_then(|v| v.encoded.clone()) {
            user_metadata.insert("original_name".to_string(), original_name);
        }

        let upload_id = match self
            .client
            .create_multipart_upload(&upload.id, &user_metadata, content_type.as_deref())
            .await
        {
            Ok(upload_id) => upload_id,
            Err(e) => {
                self.metadata.clear(&upload.id);
                return Err(e);
            }
        };

        if let Err(e) = self.metadata.save(&upload, &upload_id).await {
            // Don't leave an orphaned multipart upload behind
            if let Err(abort_error) = self
                .client
                .abort_multipart_upload(&upload.id, &upload_id)
                .await
            {
                warn!(
                    id = %upload.id,
                    error = %abort_error,
                    "failed to abort multipart upload after create failure"
                );
            }
            self.metadata.clear(&upload.id);
            return Err(e);
        }

        info!(id = %upload.id, upload_id = %upload_id, "created upload");
        Ok(upload)
    }

    /// Append one PATCH body to the upload. Returns the new offset. When the
    /// offset reaches the declared length the multipart upload is completed.
    ///
    /// A client disconnect (`RequestTimeout`, `NoSuchUpload`) is not fatal:
    /// parts that reached the object store are kept and the current offset
    /// is returned so the client can resume. A scratch-disk failure
    /// (`FilesystemError`) is surfaced but does not invalidate the cached
    /// session; only object-store faults do that.
    #[instrument(skip(self, body))]
    pub async fn write(
        &self,
        body: BoxStream<'static, Result<Bytes, StoreError>>,
        id: &str,
    ) -> Result<u64, StoreError> {
        let session = self.metadata.get(id).await?;

        // One enumeration supplies both the next part number and the offset
        let parts = match self.retrieve_parts_for(id, &session.upload_id).await {
            Ok(parts) => parts,
            Err(StoreError::NoSuchUpload) => {
                // The multipart upload is gone: already completed
                let offset = self.get_offset(id).await?;
                return Ok(offset.size);
            }
            Err(e) => {
                self.metadata.clear(id);
                return Err(e);
            }
        };
        let next_part_number = parts.len() as i32 + 1;
        let initial_size: u64 = parts.iter().map(|p| p.size).sum();

        let result = self
            .coordinator
            .process(
                id,
                &session.upload_id,
                session.file.upload_length,
                next_part_number,
                initial_size,
                body,
                self.scratch.path(),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if e.is_disconnect() => {
                debug!(id, error = %e, "client disconnected mid-write; keeping accepted parts");
                let offset = self.get_offset(id).await?;
                return Ok(offset.size);
            }
            Err(e @ StoreError::FilesystemError(_)) => {
                // Local scratch-disk fault: the affected chunk's bytes were
                // never accepted and the client resends them. The sidecar
                // and upload id at the object store are still good, so the
                // cached session stays, unlike a Transport failure.
                warn!(id, error = %e, "chunk spill failed; surfacing without dropping session");
                return Err(e);
            }
            Err(e) => {
                self.metadata.clear(id);
                return Err(e);
            }
        }

        let offset = self.get_offset(id).await?;
        if session.file.upload_length == Some(offset.size) {
            let parts = offset.parts.unwrap_or_default();
            if let Err(e) = self
                .client
                .complete_multipart_upload(id, &session.upload_id, &parts)
                .await
            {
                self.metadata.clear(id);
                return Err(e);
            }
            self.metadata.clear(id);
            info!(id, size = offset.size, "upload completed");
            return Ok(offset.size);
        }

        Ok(offset.size)
    }

    /// Reconstruct the current offset by enumerating uploaded parts.
    ///
    /// When the multipart upload no longer exists the upload has been
    /// completed; the declared length is returned and `parts` is `None`.
    #[instrument(skip(self))]
    pub async fn get_offset(&self, id: &str) -> Result<UploadOffset, StoreError> {
        let session = self.metadata.get(id).await?;

        match self.retrieve_parts_for(id, &session.upload_id).await {
            Ok(parts) => {
                let size = parts.iter().map(|p| p.size).sum();
                Ok(UploadOffset {
                    upload: session.file,
                    size,
                    parts: Some(parts),
                })
            }
            Err(StoreError::NoSuchUpload) => {
                let size = session.file.upload_length.unwrap_or(0);
                Ok(UploadOffset {
                    upload: session.file,
                    size,
                    parts: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Record the total length of a deferred-length upload.
    #[instrument(skip(self))]
    pub async fn declare_upload_length(&self, id: &str, length: u64) -> Result<(), StoreError> {
        let mut session = self.metadata.get(id).await?;
        session.file.upload_length = Some(length);
        session.file.upload_defer_length = false;
        self.metadata.save(&session.file, &session.upload_id).await
    }

    /// Number of parts accepted so far.
    pub async fn count_parts(&self, id: &str) -> Result<usize, StoreError> {
        Ok(self.retrieve_parts(id).await?.len())
    }

    /// All uploaded parts for this upload, as the contiguous prefix
    /// `1..=N`. A trailing gap means a client disconnected before those
    /// parts were flushed; the gapped parts are not reported and their
    /// bytes count as never accepted.
    pub async fn retrieve_parts(&self, id: &str) -> Result<Vec<Part>, StoreError> {
        let session = self.metadata.get(id).await?;
        self.retrieve_parts_for(id, &session.upload_id).await
    }

    async fn retrieve_parts_for(&self, key: &str, upload_id: &str) -> Result<Vec<Part>, StoreError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .client
                .list_parts(key, upload_id, marker.as_deref())
                .await?;
            parts.extend(page.parts);
            match page.next_part_number_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        parts.sort_by_key(|p| p.part_number);
        let contiguous = parts
            .into_iter()
            .enumerate()
            .take_while(|(i, p)| p.part_number == *i as i32 + 1)
            .map(|(_, p)| p)
            .collect();
        Ok(contiguous)
    }

    /// Drop the cached session for an upload; idempotent.
    pub fn clear_cache(&self, id: &str) {
        self.metadata.clear(id);
    }

    /// Whether the session cache currently holds this upload.
    pub fn is_cached(&self, id: &str) -> bool {
        self.metadata.is_cached(id)
    }
}
