//! Object-store client: a thin typed facade over the S3 operations the
//! upload store needs.
//!
//! The trait keeps the store testable against an in-memory double; the
//! `S3Client` implementation targets AWS S3 and S3-compatible services
//! (MinIO, DigitalOcean Spaces, LocalStack) via a custom endpoint.

use crate::config::S3StoreConfig;
use crate::error::StoreError;
use crate::types::Part;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// One page of ListParts results. `next_part_number_marker` is set only
/// when more pages remain.
#[derive(Debug, Clone, Default)]
pub struct PartPage {
    pub parts: Vec<Part>,
    pub next_part_number_marker: Option<String>,
}

/// The object-store operations the upload store relies on.
///
/// This trait is object-safe and can be used with `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Succeeds when the configured bucket exists; `BucketMissing` on 404.
    async fn bucket_exists(&self) -> Result<(), StoreError>;

    /// Open a multipart upload and return its upload id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        user_metadata: &HashMap<String, String>,
        content_type: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Store an object with user metadata. The store only uses this for the
    /// zero-byte sidecar.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        user_metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Fetch an object's user-metadata map.
    async fn head_object(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Upload one part, streaming from a file on disk; returns its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &Path,
    ) -> Result<String, StoreError>;

    /// List one page of uploaded parts.
    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        part_number_marker: Option<&str>,
    ) -> Result<PartPage, StoreError>;

    /// Finalize the multipart upload from the ordered parts list; returns
    /// the assembled object's location when the store reports one.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<Option<String>, StoreError>;

    /// Abort a multipart upload, discarding its parts.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;
}

/// S3 client for the upload store
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new client from configuration
    pub async fn new(config: &S3StoreConfig) -> Self {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));

        // Set custom endpoint if provided (for MinIO, Spaces, LocalStack, etc.)
        if let Some(ref ep) = config.endpoint {
            config_loader = config_loader.endpoint_url(ep);
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "tus-s3-store-config",
        );
        config_loader = config_loader.credentials_provider(credentials);

        let sdk_config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        let client = Client::from_conf(s3_config);

        debug!(bucket = %config.bucket, "S3 client initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

/// Map an SDK error onto a store error by service error code.
fn classify<E, R>(op: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match err.as_service_error().and_then(|e| e.code()) {
        Some("NoSuchUpload") => StoreError::NoSuchUpload,
        Some("RequestTimeout") => StoreError::RequestTimeout,
        _ => StoreError::Transport(format!("{} failed: {}", op, err)),
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn bucket_exists(&self) -> Result<(), StoreError> {
        use aws_sdk_s3::operation::head_bucket::HeadBucketError;

        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let SdkError::ServiceError(service_error) = &e {
                    if matches!(service_error.err(), HeadBucketError::NotFound(_)) {
                        return Err(StoreError::BucketMissing);
                    }
                }
                Err(StoreError::Transport(format!("head_bucket failed: {}", e)))
            }
        }
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        user_metadata: &HashMap<String, String>,
        content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);

        for (k, v) in user_metadata {
            request = request.metadata(k, v);
        }
        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", e))?;

        let upload_id = response.upload_id().ok_or_else(|| {
            StoreError::Transport("CreateMultipartUpload response missing UploadId".to_string())
        })?;

        debug!(key, upload_id, "created multipart upload");
        Ok(upload_id.to_string())
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        user_metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body));

        for (k, v) in user_metadata {
            request = request.metadata(k, v);
        }

        request.send().await.map_err(|e| classify("put_object", e))?;

        debug!(key, "stored object");
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        use aws_sdk_s3::operation::head_object::HeadObjectError;

        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(service_error) = &e {
                    if matches!(service_error.err(), HeadObjectError::NotFound(_)) {
                        return StoreError::FileNotFound(key.to_string());
                    }
                }
                StoreError::Transport(format!("head_object failed: {}", e))
            })?;

        let metadata = response
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(metadata)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &Path,
    ) -> Result<String, StoreError> {
        let stream = ByteStream::from_path(body).await.map_err(|e| {
            StoreError::FilesystemError(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(stream)
            .send()
            .await
            .map_err(|e| classify("upload_part", e))?;

        let etag = response.e_tag().ok_or_else(|| {
            StoreError::Transport("UploadPart response missing ETag".to_string())
        })?;

        debug!(key, part_number, "uploaded part");
        Ok(etag.to_string())
    }

    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        part_number_marker: Option<&str>,
    ) -> Result<PartPage, StoreError> {
        let mut request = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id);

        if let Some(marker) = part_number_marker {
            request = request.part_number_marker(marker);
        }

        let response = request.send().await.map_err(|e| classify("list_parts", e))?;

        let parts = response
            .parts()
            .iter()
            .filter_map(|p| {
                Some(Part {
                    part_number: p.part_number()?,
                    size: p.size()? as u64,
                    etag: p.e_tag()?.to_string(),
                })
            })
            .collect();

        // NextPartNumberMarker is only meaningful on truncated responses
        let next_part_number_marker = if response.is_truncated().unwrap_or(false) {
            response.next_part_number_marker().map(str::to_string)
        } else {
            None
        };

        Ok(PartPage {
            parts,
            next_part_number_marker,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<Option<String>, StoreError> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", e))?;

        debug!(key, parts = parts.len(), "completed multipart upload");
        Ok(response.location().map(str::to_string))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", e))?;

        debug!(key, upload_id, "aborted multipart upload");
        Ok(())
    }
}
