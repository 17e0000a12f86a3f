//! Stream path validation
//!
//! Stream requests have exactly one accepted shape:
//!
//! ```text
//! /streams/<id>.ogg        len("<id>.ogg") == STREAM_NAME_LEN
//! ```
//!
//! Matching is by literal prefix, suffix and length only. Anything else,
//! including extra path segments, is rejected before the registry is consulted.

use crate::config::{OGG_SUFFIX, STREAMS_PREFIX, STREAM_ID_LEN, STREAM_NAME_LEN};

/// Validated stream identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamName(String);

impl StreamName {
    /// Create a stream name from a bare identifier (without `.ogg`)
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.len() != STREAM_ID_LEN || id.contains('/') {
            return None;
        }
        Some(Self(id))
    }

    /// Extract the stream name from a request path
    pub fn from_path(path: &str) -> Option<Self> {
        let file = path.strip_prefix(STREAMS_PREFIX)?;

        // The last '/' must be the one closing the prefix
        if file.contains('/') {
            return None;
        }
        if file.len() != STREAM_NAME_LEN {
            return None;
        }

        file.strip_suffix(OGG_SUFFIX)
            .map(|id| Self(id.to_owned()))
    }

    /// The bare identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment, `<id>.ogg`
    pub fn file_name(&self) -> String {
        format!("{}{}", self.0, OGG_SUFFIX)
    }

    /// The request path serving this stream
    pub fn path(&self) -> String {
        format!("{}{}{}", STREAMS_PREFIX, self.0, OGG_SUFFIX)
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a request path, returning its stream name
pub fn validate(path: &str) -> Option<StreamName> {
    StreamName::from_path(path)
}
