//! Shared test infrastructure for integration tests
//!
//! Provides an in-memory object store double, stream builders, and data
//! generators.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tus_s3_store::client::{ObjectStore, PartPage};
use tus_s3_store::config::S3StoreConfig;
use tus_s3_store::error::StoreError;
use tus_s3_store::store::S3Store;
use tus_s3_store::types::Part;

pub const MIB: usize = 1024 * 1024;

struct MockPart {
    size: u64,
    etag: String,
}

struct MockUpload {
    key: String,
    parts: BTreeMap<i32, MockPart>,
    user_metadata: HashMap<String, String>,
    content_type: Option<String>,
}

struct StoredObject {
    body: Bytes,
    user_metadata: HashMap<String, String>,
}

/// Record of a finalized multipart upload
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub part_count: usize,
    pub total_size: u64,
}

/// In-memory object store double.
///
/// Multipart state lives in a guarded map keyed by upload id; completion
/// removes the upload so later ListParts calls observe `NoSuchUpload`, the
/// same way S3 behaves once an upload is assembled.
pub struct MockObjectStore {
    uploads: RwLock<HashMap<String, MockUpload>>,
    objects: RwLock<HashMap<String, StoredObject>>,
    completed: RwLock<HashMap<String, CompletedUpload>>,
    id_counter: AtomicU64,
    page_size: usize,
    /// HeadBucket returns 404 when set
    pub bucket_missing: AtomicBool,
    /// PutObject fails when set
    pub fail_put_object: AtomicBool,
    /// UploadPart fails when set
    pub fail_upload_part: AtomicBool,
    /// Serve user-metadata keys the way DigitalOcean Spaces does
    /// (underscores normalized to hyphens)
    pub spaces_metadata_keys: AtomicBool,
    head_object_calls: AtomicU64,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            uploads: RwLock::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
            page_size,
            bucket_missing: AtomicBool::new(false),
            fail_put_object: AtomicBool::new(false),
            fail_upload_part: AtomicBool::new(false),
            spaces_metadata_keys: AtomicBool::new(false),
            head_object_calls: AtomicU64::new(0),
        }
    }

    /// Number of multipart uploads still open
    pub fn live_upload_count(&self) -> usize {
        self.uploads.read().len()
    }

    /// The finalized upload for a key, if completion happened
    pub fn completed(&self, key: &str) -> Option<CompletedUpload> {
        self.completed.read().get(key).cloned()
    }

    /// The multipart upload id currently open for a key
    pub fn upload_id_for(&self, key: &str) -> Option<String> {
        self.uploads
            .read()
            .iter()
            .find(|(_, u)| u.key == key)
            .map(|(id, _)| id.clone())
    }

    /// User metadata recorded at CreateMultipartUpload time
    pub fn multipart_user_metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.uploads
            .read()
            .values()
            .find(|u| u.key == key)
            .map(|u| u.user_metadata.clone())
    }

    /// Content type recorded at CreateMultipartUpload time
    pub fn multipart_content_type(&self, key: &str) -> Option<String> {
        self.uploads
            .read()
            .values()
            .find(|u| u.key == key)
            .and_then(|u| u.content_type.clone())
    }

    /// Sizes of the currently uploaded parts, in part-number order
    pub fn part_sizes(&self, key: &str) -> Vec<u64> {
        self.uploads
            .read()
            .values()
            .find(|u| u.key == key)
            .map(|u| u.parts.values().map(|p| p.size).collect())
            .unwrap_or_default()
    }

    /// Fabricate an uploaded part, bypassing the splitter. Used to model
    /// state left behind by earlier (possibly failed) writes.
    pub fn inject_part(&self, upload_id: &str, part_number: i32, size: u64) {
        let etag = format!("\"{}\"", hex::encode(Md5::digest(part_number.to_le_bytes())));
        if let Some(upload) = self.uploads.write().get_mut(upload_id) {
            upload.parts.insert(part_number, MockPart { size, etag });
        }
    }

    /// How many HeadObject calls the store issued (cache-miss detector)
    pub fn head_object_calls(&self) -> u64 {
        self.head_object_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn bucket_exists(&self) -> Result<(), StoreError> {
        if self.bucket_missing.load(Ordering::SeqCst) {
            return Err(StoreError::BucketMissing);
        }
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        user_metadata: &HashMap<String, String>,
        content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("mpu-{:04}", n);
        self.uploads.write().insert(
            upload_id.clone(),
            MockUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
                user_metadata: user_metadata.clone(),
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(upload_id)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        user_metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        if self.fail_put_object.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("injected put_object failure".to_string()));
        }
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                body,
                user_metadata: user_metadata.clone(),
            },
        );
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.head_object_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.read();
        let object = objects
            .get(key)
            .ok_or_else(|| StoreError::FileNotFound(key.to_string()))?;

        if self.spaces_metadata_keys.load(Ordering::SeqCst) {
            return Ok(object
                .user_metadata
                .iter()
                .map(|(k, v)| (k.replace('_', "-"), v.clone()))
                .collect());
        }
        Ok(object.user_metadata.clone())
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: &Path,
    ) -> Result<String, StoreError> {
        if self.fail_upload_part.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("injected upload_part failure".to_string()));
        }
        if !(1..=10000).contains(&part_number) {
            return Err(StoreError::Transport(
                "part number must be between 1 and 10000".to_string(),
            ));
        }

        let data = std::fs::read(body).map_err(StoreError::FilesystemError)?;
        let etag = format!("\"{}\"", hex::encode(Md5::digest(&data)));

        let mut uploads = self.uploads.write();
        let upload = uploads.get_mut(upload_id).ok_or(StoreError::NoSuchUpload)?;
        upload.parts.insert(
            part_number,
            MockPart {
                size: data.len() as u64,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn list_parts(
        &self,
        _key: &str,
        upload_id: &str,
        part_number_marker: Option<&str>,
    ) -> Result<PartPage, StoreError> {
        let uploads = self.uploads.read();
        let upload = uploads.get(upload_id).ok_or(StoreError::NoSuchUpload)?;

        let marker: i32 = part_number_marker
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);

        let remaining: Vec<Part> = upload
            .parts
            .iter()
            .filter(|(&n, _)| n > marker)
            .map(|(&n, p)| Part {
                part_number: n,
                size: p.size,
                etag: p.etag.clone(),
            })
            .collect();

        let truncated = remaining.len() > self.page_size;
        let parts: Vec<Part> = remaining.into_iter().take(self.page_size).collect();
        let next_part_number_marker = if truncated {
            parts.last().map(|p| p.part_number.to_string())
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
        let mut uploads = self.uploads.write();
        let upload = uploads.get(upload_id).ok_or(StoreError::NoSuchUpload)?;

        if parts.is_empty() {
            return Err(StoreError::Transport(
                "you must specify at least one part".to_string(),
            ));
        }
        for window in parts.windows(2) {
            if window[0].part_number >= window[1].part_number {
                return Err(StoreError::Transport(
                    "the list of parts was not in ascending order".to_string(),
                ));
            }
        }

        let mut total_size = 0u64;
        for part in parts {
            let stored = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Transport(format!("part {} has not been uploaded", part.part_number))
            })?;
            if stored.etag != part.etag {
                return Err(StoreError::Transport(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            total_size += stored.size;
        }

        uploads.remove(upload_id);
        self.completed.write().insert(
            key.to_string(),
            CompletedUpload {
                part_count: parts.len(),
                total_size,
            },
        );
        Ok(Some(format!("https://bucket.example/{}", key)))
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.uploads.write().remove(upload_id);
        Ok(())
    }
}

// === Store construction ===

/// Build a store over a fresh mock, spilling chunks into a dedicated temp
/// dir the test can inspect.
pub fn test_store(part_size: u64) -> (S3Store, Arc<MockObjectStore>, TempDir) {
    let mock = Arc::new(MockObjectStore::new());
    store_over(Arc::clone(&mock), part_size)
        .map(|(store, tmp)| (store, mock, tmp))
        .expect("store construction failed")
}

/// Build a store spilling chunks into an explicit scratch path (for tests
/// that sabotage the scratch directory).
pub fn store_with_scratch(
    mock: Arc<MockObjectStore>,
    part_size: u64,
    scratch: &Path,
) -> Result<S3Store, StoreError> {
    let mut config = S3StoreConfig::new("test", "test", "bucket");
    config.part_size = part_size;
    config.tmp_dir = Some(scratch.to_path_buf());
    S3Store::with_client(&config, mock)
}

/// Build a store over an existing mock (for custom page sizes or flags).
pub fn store_over(
    mock: Arc<MockObjectStore>,
    part_size: u64,
) -> Result<(S3Store, TempDir), StoreError> {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let mut config = S3StoreConfig::new("test", "test", "bucket");
    config.part_size = part_size;
    config.tmp_dir = Some(tmp.path().to_path_buf());
    let store = S3Store::with_client(&config, mock)?;
    Ok((store, tmp))
}

/// Count leftover chunk files in the scratch dir.
pub fn chunk_files(tmp: &TempDir) -> usize {
    std::fs::read_dir(tmp.path()).map(|d| d.count()).unwrap_or(0)
}

// === Stream builders ===

/// A well-behaved stream delivering `data` in `item_size` pieces.
pub fn byte_stream(data: Vec<u8>, item_size: usize) -> BoxStream<'static, Result<Bytes, StoreError>> {
    let items: Vec<Result<Bytes, StoreError>> = data
        .chunks(item_size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(items).boxed()
}

/// A zero-byte stream.
pub fn empty_stream() -> BoxStream<'static, Result<Bytes, StoreError>> {
    futures::stream::empty().boxed()
}

/// A stream that delivers `data` and then fails, the way an aborted client
/// connection surfaces.
pub fn disconnecting_stream(
    data: Vec<u8>,
    item_size: usize,
    error: StoreError,
) -> BoxStream<'static, Result<Bytes, StoreError>> {
    let mut items: Vec<Result<Bytes, StoreError>> = data
        .chunks(item_size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    items.push(Err(error));
    futures::stream::iter(items).boxed()
}

// === Data generators ===

/// Generate deterministic binary data
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}
