//! Splits an incoming byte stream into bounded chunk files on local disk.
//!
//! Bytes are spilled into temporary files of at most `max_chunk_size` bytes.
//! Consumers receive `ChunkEvent`s over a channel, strictly in production
//! order; `Done` or `Error` is always the final event. On upstream error the
//! pending chunk file is closed but never reported as finished, so the
//! consumer can delete it via the path announced in `Started`.

use crate::error::StoreError;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events emitted while the splitter consumes a stream
#[derive(Debug)]
pub enum ChunkEvent {
    /// A chunk file was opened for the next arriving byte
    Started(PathBuf),
    /// A chunk file reached the size bound or the stream ended
    Finished { path: PathBuf, size: u64 },
    /// The stream ended; every finished chunk has been reported
    Done,
    /// The stream failed; the pending chunk file was not finished
    Error(StoreError),
}

/// Process-wide counter for unique chunk file names
static CHUNK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stateful transformer from a byte stream into chunk files
pub struct StreamSplitter {
    max_chunk_size: u64,
    directory: PathBuf,
}

struct OpenChunk {
    file: File,
    path: PathBuf,
    written: u64,
}

impl StreamSplitter {
    pub fn new(max_chunk_size: u64, directory: impl Into<PathBuf>) -> Self {
        assert!(max_chunk_size > 0, "chunk size must be positive");
        Self {
            max_chunk_size,
            directory: directory.into(),
        }
    }

    /// Consume `body` on a background task, spilling it into chunk files.
    pub fn split(self, body: BoxStream<'static, Result<Bytes, StoreError>>) -> mpsc::Receiver<ChunkEvent> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            self.run(body, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        mut body: BoxStream<'static, Result<Bytes, StoreError>>,
        tx: mpsc::Sender<ChunkEvent>,
    ) {
        let mut current: Option<OpenChunk> = None;

        while let Some(item) = body.next().await {
            let mut bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Close the pending file without finishing it; the
                    // consumer deletes it by the Started path.
                    if let Some(mut chunk) = current.take() {
                        let _ = chunk.file.shutdown().await;
                    }
                    let _ = tx.send(ChunkEvent::Error(e)).await;
                    return;
                }
            };

            while !bytes.is_empty() {
                let mut chunk = match current.take() {
                    Some(chunk) => chunk,
                    None => match self.open_chunk(&tx).await {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let _ = tx.send(ChunkEvent::Error(e)).await;
                            return;
                        }
                    },
                };

                let room = (self.max_chunk_size - chunk.written) as usize;
                let take = room.min(bytes.len());
                let piece = bytes.split_to(take);
                if let Err(e) = chunk.file.write_all(&piece).await {
                    warn!(path = %chunk.path.display(), error = %e, "chunk file write failed");
                    let _ = chunk.file.shutdown().await;
                    let _ = tx.send(ChunkEvent::Error(StoreError::FilesystemError(e))).await;
                    return;
                }
                chunk.written += take as u64;

                if chunk.written == self.max_chunk_size {
                    if let Err(e) = Self::finish_chunk(chunk, &tx).await {
                        let _ = tx.send(ChunkEvent::Error(e)).await;
                        return;
                    }
                } else {
                    current = Some(chunk);
                }
            }
        }

        // Flush the partial tail
        if let Some(chunk) = current.take() {
            if let Err(e) = Self::finish_chunk(chunk, &tx).await {
                let _ = tx.send(ChunkEvent::Error(e)).await;
                return;
            }
        }

        let _ = tx.send(ChunkEvent::Done).await;
    }

    async fn open_chunk(&self, tx: &mpsc::Sender<ChunkEvent>) -> Result<OpenChunk, StoreError> {
        let n = CHUNK_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = self.directory.join(format!("{:08}.chunk", n));
        let file = File::create(&path).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to open chunk file");
            StoreError::FilesystemError(e)
        })?;
        debug!(path = %path.display(), "opened chunk file");
        let _ = tx.send(ChunkEvent::Started(path.clone())).await;
        Ok(OpenChunk {
            file,
            path,
            written: 0,
        })
    }

    async fn finish_chunk(
        mut chunk: OpenChunk,
        tx: &mpsc::Sender<ChunkEvent>,
    ) -> Result<(), StoreError> {
        chunk.file.flush().await.map_err(|e| {
            warn!(path = %chunk.path.display(), error = %e, "chunk file flush failed");
            StoreError::FilesystemError(e)
        })?;
        chunk.file.shutdown().await.map_err(StoreError::FilesystemError)?;
        debug!(path = %chunk.path.display(), size = chunk.written, "finished chunk file");
        let _ = tx
            .send(ChunkEvent::Finished {
                path: chunk.path,
                size: chunk.written,
            })
            .await;
        Ok(())
    }
}
