//! Core types for the tus-on-S3 upload store

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// tus protocol version recorded in sidecar metadata
pub const TUS_VERSION: &str = "1.0.0";

/// One resumable upload as declared by the client.
///
/// Serialized to JSON and carried verbatim in the sidecar object's user
/// metadata, so it round-trips across process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    /// Opaque identifier, unique per upload
    pub id: String,

    /// Total byte length declared by the client; absent while the client
    /// defers the length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_length: Option<u64>,

    /// The client has not yet declared the total length
    #[serde(default)]
    pub upload_defer_length: bool,

    /// Raw tus metadata string: comma-separated `key base64(value)` pairs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_metadata: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,
}

impl Upload {
    /// Create an upload with a known total length.
    pub fn new(id: impl Into<String>, upload_length: u64) -> Self {
        Self {
            id: id.into(),
            upload_length: Some(upload_length),
            upload_defer_length: false,
            upload_metadata: None,
            creation_date: Some(Utc::now()),
        }
    }

    /// Create an upload whose length the client will declare later.
    pub fn new_deferred(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            upload_length: None,
            upload_defer_length: true,
            upload_metadata: None,
            creation_date: Some(Utc::now()),
        }
    }

    /// Attach the raw tus metadata string.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.upload_metadata = Some(metadata.into());
        self
    }
}

/// Cached session for one upload: the upload record plus the multipart
/// upload identifier the object store assigned to it.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub file: Upload,
    pub upload_id: String,
    pub tus_version: String,
}

/// One uploaded multipart part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 1-based part number
    pub part_number: i32,
    /// Byte length of the part
    pub size: u64,
    /// Opaque identifier returned by the object store, required to
    /// complete the multipart upload
    pub etag: String,
}

/// Offset information reconstructed from the object store
#[derive(Debug, Clone)]
pub struct UploadOffset {
    pub upload: Upload,
    /// Cumulative size of accepted bytes
    pub size: u64,
    /// Parts uploaded so far. `None` once the multipart upload has been
    /// completed (the assembled object exists; the parts list is gone).
    pub parts: Option<Vec<Part>>,
}

/// One parsed tus metadata entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    /// The base64 value as it appeared on the wire; absent for bare keys
    pub encoded: Option<String>,
    /// The decoded value; absent for bare keys or undecodable base64
    pub decoded: Option<String>,
}

/// Parse the tus metadata wire format: comma-separated entries, each entry
/// `key SP base64value`. A key without a value yields an entry with neither
/// `encoded` nor `decoded` set. Empty input yields the empty mapping.
pub fn parse_metadata_string(raw: &str) -> HashMap<String, MetadataValue> {
    let mut parsed = HashMap::new();
    if raw.trim().is_empty() {
        return parsed;
    }

    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut pieces = entry.splitn(2, ' ');
        let key = match pieces.next() {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => continue,
        };
        let encoded = pieces.next().map(str::to_string);
        let decoded = encoded.as_deref().and_then(|e| {
            base64::engine::general_purpose::STANDARD
                .decode(e)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        });
        parsed.insert(key, MetadataValue { encoded, decoded });
    }

    parsed
}

/// Replace non-ASCII characters with `?`.
///
/// S3 user metadata travels in HTTP headers and must stay ASCII. The
/// untouched original string survives in the sidecar's JSON, which is what
/// HEAD responses are built from.
pub fn coerce_ascii(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect()
}
