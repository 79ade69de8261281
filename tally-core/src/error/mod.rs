//! Report Errors
//!
//! Every failure in the pipeline surfaces as a [`ReportError`]. None of
//! them are downgraded to warnings: a report is either complete or absent.

use std::io;
use std::path::PathBuf;

/// Result alias used across the crate
pub type Result<T, E = ReportError> = std::result::Result<T, E>;

/// Errors raised while fetching, formatting or caching records
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Unknown resource type, bad output location, invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Listing or fetching from the record source failed
    #[error("Record source {location} unavailable: {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// A fetched batch could not be decompressed or parsed
    #[error("Malformed batch {key}: {reason}")]
    MalformedBatch { key: String, reason: String },

    /// An accepted record lacks a field its formatter requires
    #[error("Malformed {resource_type} record {record_id}: missing field {field}")]
    MalformedRecord {
        resource_type: String,
        record_id: String,
        field: String,
    },

    /// The cache manifest exists but cannot be decoded
    #[error("Cache manifest {} is corrupt: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },

    /// A cache key, value or manifest could not be encoded
    #[error("Cache entry not encodable: {0}")]
    CacheEncode(String),

    /// The cache manifest could not be read or written
    #[error("Cache I/O on {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing the report output failed
    #[error("Output error: {0}")]
    Output(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A fetch worker panicked or was aborted
    #[error("Fetch task failed: {0}")]
    Task(String),
}

impl ReportError {
    pub fn source_unavailable(location: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed_batch(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedBatch {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from the cache rather than the report itself
    pub fn is_cache_error(&self) -> bool {
        matches!(
            self,
            Self::CacheCorrupt { .. } | Self::CacheEncode(_) | Self::CacheIo { .. }
        )
    }
}
