//! # Tally Core
//!
//! Core library for reporting on compliance job output.
//!
//! A periodic compliance job leaves the resources it matched as gzip JSON
//! archives in an object store (or a single snapshot on local disk). This
//! crate collects those records over a time window, keeps the newest view
//! of each resource and renders a per-resource-type CSV report.
//!
//! ## Features
//!
//! - **Record Sources** - Paginated object-store listing and local snapshots
//! - **Batch Fetching** - Bounded concurrent download and decompression
//! - **Formatting** - Per-resource-type filter, dedup and column projection
//! - **Reports** - CSV output plus an optional raw JSON dump
//! - **Caching** - TTL-bounded file cache for results across invocations
//! - **Metrics** - Fetch counts, latency percentiles and rows written
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use tally_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ReportError> {
//!     let store = Arc::new(InMemoryObjectStore::default());
//!     let pipeline = ReportPipeline::new(FormatterRegistry::with_defaults())
//!         .with_object_store(store);
//!
//!     let root = OutputLocation::parse("s3://audit-bucket/policies")?;
//!     let policy = PolicyDescriptor::new("ec2-tag-compliance", "ec2", root.for_policy("ec2-tag-compliance"));
//!
//!     let mut stdout = std::io::stdout();
//!     let summary = pipeline
//!         .generate_report(&policy, Utc::now() - Duration::days(1), &mut stdout, None)
//!         .await?;
//!     eprintln!("{} rows", summary.rows);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod error;
pub mod fetch;
pub mod format;
pub mod metrics;
pub mod record;
pub mod report;
pub mod source;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{
        cache_from_config, CacheConfig, CacheStats, CacheStore, CacheStoreExt, FileCache,
        NullCache,
    };
    pub use crate::error::{ReportError, Result};
    pub use crate::fetch::{BatchFetcher, FetchConfig, FetchOutcome, FetchStats};
    pub use crate::format::{format_records, Formatter, FormatterRegistry, Row};
    pub use crate::metrics::{Counter, LatencyHistogram, MetricsSnapshot, ReportMetrics};
    pub use crate::record::{Batch, Record, RecordCollection, TagMap};
    pub use crate::report::{PolicyDescriptor, ReportPipeline, ReportSummary};
    pub use crate::source::{
        BatchHandle, FilesystemSource, InMemoryObjectStore, ObjectStore, ObjectStoreSource,
        OutputLocation, RecordSource,
    };

    #[cfg(feature = "s3")]
    pub use crate::source::s3::S3ObjectStore;
}
