//! File content catalog and byte-range plumbing
//!
//! Plugins hand out opaque content URIs; the catalog maps them to local
//! paths so the HTTP surface can serve the bytes with conditional and
//! partial requests.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// URI scheme prefix for catalog entries.
pub const CONTENT_URI_PREFIX: &str = "content://switchyard/";

/// Registered content, addressed by opaque URI.
pub struct FileCatalog {
    entries: RwLock<HashMap<String, PathBuf>>,
}

impl FileCatalog {
    pub fn new() -> Self {
        FileCatalog {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a local path and mint a content URI for it.
    pub fn register(&self, path: &Path) -> String {
        let uri = format!("{}{}", CONTENT_URI_PREFIX, Uuid::new_v4().simple());
        self.entries.write().insert(uri.clone(), path.to_path_buf());
        uri
    }

    /// Register a path under a caller-chosen URI, replacing any previous
    /// mapping.
    pub fn register_as(&self, uri: &str, path: &Path) {
        self.entries
            .write()
            .insert(uri.to_string(), path.to_path_buf());
    }

    pub fn resolve(&self, uri: &str) -> Option<PathBuf> {
        self.entries.read().get(uri).cloned()
    }

    pub fn unregister(&self, uri: &str) -> bool {
        self.entries.write().remove(uri).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for FileCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Validator for conditional requests, derived from the content URI and
/// its current length so it changes when the file does.
pub fn etag_for(uri: &str, len: u64) -> String {
    let digest = Sha256::digest(format!("{uri}:{len}").as_bytes());
    format!("\"{}\"", &hex::encode(digest)[..16])
}

/// Outcome of Range header evaluation against a known content length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Inclusive byte positions to serve.
    Satisfiable { start: u64, end: u64 },
    /// Range start lies past the end of the content.
    Unsatisfiable,
}

/// Parse a single-range `bytes=` header. Malformed headers yield `None`,
/// which callers treat as "serve the whole body" per RFC 7233.
pub fn parse_range(header: &str, len: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?.trim();
    // Multi-range requests are not supported; take only a lone range.
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    let start_s = start_s.trim();
    let end_s = end_s.trim();

    if start_s.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end_s.parse().ok()?;
        if suffix == 0 || len == 0 {
            return Some(ByteRange::Unsatisfiable);
        }
        let start = len.saturating_sub(suffix);
        return Some(ByteRange::Satisfiable {
            start,
            end: len - 1,
        });
    }

    let start: u64 = start_s.parse().ok()?;
    if start >= len {
        return Some(ByteRange::Unsatisfiable);
    }
    let end = if end_s.is_empty() {
        len - 1
    } else {
        let end: u64 = end_s.parse().ok()?;
        if end < start {
            return None;
        }
        end.min(len - 1)
    };
    Some(ByteRange::Satisfiable { start, end })
}
