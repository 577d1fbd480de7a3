//! tus resumable-upload storage backend for S3-compatible object stores
//!
//! This library maps tus PATCH streams onto S3 multipart uploads: incoming
//! bytes are spilled into part-sized files on local disk, uploaded as
//! numbered parts, and assembled once the declared length is reached.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metadata;
pub mod splitter;
pub mod store;
pub mod types;
