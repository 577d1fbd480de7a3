//! Maps chunk files produced by the splitter onto multipart parts.
//!
//! One coordinator run corresponds to one client PATCH. Part numbers are
//! assigned serially in the order the splitter finishes chunk files; the
//! actual part uploads run concurrently on spawned tasks. Chunk files are
//! deleted once their upload resolves, whether it succeeded or not.

use crate::client::ObjectStore;
use crate::error::StoreError;
use crate::splitter::{ChunkEvent, StreamSplitter};
use crate::types::Part;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Minimum size of a non-final part (5 MiB), imposed by S3
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Outcome of one chunk the splitter produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk was uploaded as a part
    Uploaded(Part),
    /// Non-final chunk below the S3 minimum; dropped so the client
    /// resends those bytes with its next request
    Skipped { size: u64 },
}

enum ChunkSlot {
    Skipped { size: u64 },
    Task(JoinHandle<Result<Part, StoreError>>),
}

/// Drives one PATCH request through the splitter and onto the object store
pub struct PartCoordinator {
    client: Arc<dyn ObjectStore>,
    part_size: u64,
}

impl PartCoordinator {
    pub fn new(client: Arc<dyn ObjectStore>, part_size: u64) -> Self {
        Self { client, part_size }
    }

    /// Consume `body`, uploading eligible chunks as parts
    /// `next_part_number..`. `current_size` is the cumulative size of
    /// already-accepted bytes; together with `upload_length` it determines
    /// which chunk is final and therefore exempt from the size floor.
    #[allow(clippy::too_many_arguments)]
    pub async fn process(
        &self,
        key: &str,
        upload_id: &str,
        upload_length: Option<u64>,
        mut next_part_number: i32,
        mut current_size: u64,
        body: BoxStream<'static, Result<Bytes, StoreError>>,
        scratch_dir: &Path,
    ) -> Result<Vec<ChunkOutcome>, StoreError> {
        let splitter = StreamSplitter::new(self.part_size, scratch_dir);
        let mut events = splitter.split(body);

        let mut slots: Vec<ChunkSlot> = Vec::new();
        let mut pending_path: Option<PathBuf> = None;
        let mut stream_error: Option<StoreError> = None;

        while let Some(event) = events.recv().await {
            match event {
                ChunkEvent::Started(path) => {
                    pending_path = Some(path);
                }
                ChunkEvent::Finished { path, size } => {
                    pending_path = None;
                    current_size += size;
                    let part_number = next_part_number;
                    next_part_number += 1;

                    let is_final = upload_length == Some(current_size);
                    if !is_final && size < MIN_PART_SIZE {
                        // The tus protocol lets the server accept fewer
                        // bytes than offered; the client resends these.
                        debug!(key, part_number, size, "dropping small non-final chunk");
                        remove_chunk_file(&path).await;
                        slots.push(ChunkSlot::Skipped { size });
                        continue;
                    }

                    slots.push(ChunkSlot::Task(self.spawn_part_upload(
                        key,
                        upload_id,
                        part_number,
                        path,
                        size,
                    )));
                }
                ChunkEvent::Error(e) => {
                    if let Some(path) = pending_path.take() {
                        remove_chunk_file(&path).await;
                    }
                    stream_error = Some(e);
                    break;
                }
                ChunkEvent::Done => break,
            }
        }

        // Await every in-flight part; a single failure does not cancel the
        // others, and parts that reached the store stay there for resumption.
        let mut outcomes = Vec::with_capacity(slots.len());
        let mut first_failure: Option<StoreError> = None;
        for slot in slots {
            match slot {
                ChunkSlot::Skipped { size } => outcomes.push(ChunkOutcome::Skipped { size }),
                ChunkSlot::Task(handle) => match handle.await {
                    Ok(Ok(part)) => outcomes.push(ChunkOutcome::Uploaded(part)),
                    Ok(Err(e)) => {
                        if first_failure.is_none() {
                            first_failure = Some(e);
                        }
                    }
                    Err(join_error) => {
                        if first_failure.is_none() {
                            first_failure = Some(StoreError::Transport(format!(
                                "part upload task failed: {}",
                                join_error
                            )));
                        }
                    }
                },
            }
        }

        if let Some(e) = stream_error {
            return Err(e);
        }
        if let Some(e) = first_failure {
            return Err(e);
        }
        Ok(outcomes)
    }

    fn spawn_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: PathBuf,
        size: u64,
    ) -> JoinHandle<Result<Part, StoreError>> {
        let client = Arc::clone(&self.client);
        let key = key.to_string();
        let upload_id = upload_id.to_string();

        tokio::spawn(async move {
            let result = client.upload_part(&key, &upload_id, part_number, &path).await;
            remove_chunk_file(&path).await;
            match result {
                Ok(etag) => {
                    debug!(key = %key, part_number, size, "part accepted");
                    Ok(Part {
                        part_number,
                        size,
                        etag,
                    })
                }
                Err(e) => Err(e),
            }
        })
    }
}

async fn remove_chunk_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove chunk file");
    }
}
