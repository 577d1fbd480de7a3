//! Error types for the upload store

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Bucket does not exist")]
    BucketMissing,

    #[error("Upload not found: {0}")]
    FileNotFound(String),

    #[error("Object store closed the connection before the upload finished")]
    RequestTimeout,

    #[error("The multipart upload does not exist")]
    NoSuchUpload,

    #[error("Object store error: {0}")]
    Transport(String),

    /// A chunk spill file could not be written or read back. Local to this
    /// process; says nothing about the state at the object store.
    #[error("Filesystem error: {0}")]
    FilesystemError(#[source] std::io::Error),

    #[error("Invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors raised when the client went away mid-write. Parts that reached
    /// the object store before the disconnect are kept; the upload resumes
    /// from the recomputed offset.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, StoreError::RequestTimeout | StoreError::NoSuchUpload)
    }
}
