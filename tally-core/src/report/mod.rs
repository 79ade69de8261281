//! Report Pipeline
//!
//! Ties a policy's output location to a record source, fetches every batch
//! since the start date, runs the resource type's formatter and writes the
//! CSV report. Nothing reaches the output sink unless fetching and
//! formatting both succeeded.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, CacheStoreExt};
use crate::error::{ReportError, Result};
use crate::fetch::{BatchFetcher, FetchConfig, FetchStats};
use crate::format::{format_records, Formatter, FormatterRegistry, Row};
use crate::metrics::ReportMetrics;
use crate::record::RecordCollection;
use crate::source::{FilesystemSource, ObjectStore, ObjectStoreSource, OutputLocation, RecordSource};

/// Cache namespace for fetched record sets
const RECORDS_CACHE_KEY: &str = "report-records";

/// Granularity of the listing marker
const START_HOUR_FORMAT: &str = "%Y-%m-%d-%H";

/// What a report is generated for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDescriptor {
    pub name: String,
    pub resource_type: String,
    /// Where this policy's runs left their records
    pub output: OutputLocation,
}

impl PolicyDescriptor {
    pub fn new(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        output: OutputLocation,
    ) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            output,
        }
    }
}

/// Outcome of one report run
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub run_id: Uuid,
    pub resource_type: String,
    pub batches: usize,
    pub records: usize,
    pub rows: usize,
    /// Records came from the cache rather than the source
    pub from_cache: bool,
}

pub struct ReportPipeline {
    registry: FormatterRegistry,
    fetch: FetchConfig,
    metrics: Option<Arc<ReportMetrics>>,
    store: Option<Arc<dyn ObjectStore>>,
    cache: Option<Mutex<Box<dyn CacheStore>>>,
}

impl ReportPipeline {
    pub fn new(registry: FormatterRegistry) -> Self {
        Self {
            registry,
            fetch: FetchConfig::default(),
            metrics: None,
            store: None,
            cache: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.fetch = self.fetch.with_workers(workers);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ReportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Backend used for remote output locations
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Memoize fetched records in `cache`.
    ///
    /// The cache is consulted as-is; callers decide whether to `load` it
    /// first.
    pub fn with_cache(mut self, cache: Box<dyn CacheStore>) -> Self {
        self.cache = Some(Mutex::new(cache));
        self
    }

    pub fn registry(&self) -> &FormatterRegistry {
        &self.registry
    }

    /// Generate the report for `policy` covering batches since `start_date`.
    ///
    /// The CSV (header plus one row per resource) goes to `output`. When
    /// `raw_output` is given, the full unformatted record set follows as
    /// indented JSON.
    #[instrument(skip_all, fields(policy = %policy.name, resource_type = %policy.resource_type))]
    pub async fn generate_report<W: Write>(
        &self,
        policy: &PolicyDescriptor,
        start_date: DateTime<Utc>,
        output: &mut W,
        raw_output: Option<&mut dyn Write>,
    ) -> Result<ReportSummary> {
        let started = Instant::now();
        let formatter = self.registry.get(&policy.resource_type)?;
        let run_id = Uuid::new_v4();

        // Listing resolves the start to the hour; so does the key
        let cache_key = (
            RECORDS_CACHE_KEY,
            policy.output.to_string(),
            start_date.format(START_HOUR_FORMAT).to_string(),
        );
        let cached: Option<RecordCollection> = self
            .cache
            .as_ref()
            .and_then(|cache| cache.lock().get(&cache_key));

        let from_cache = cached.is_some();
        let (records, stats) = match cached {
            Some(records) => {
                info!(records = records.len(), "Using cached records");
                (records, FetchStats::default())
            }
            None => {
                let source = self.source_for(&policy.output, start_date)?;
                let mut fetcher = BatchFetcher::new(self.fetch.clone());
                if let Some(metrics) = &self.metrics {
                    fetcher = fetcher.with_metrics(Arc::clone(metrics));
                }
                let outcome = fetcher.fetch_all(source).await?;

                if let Some(cache) = &self.cache {
                    match cache.lock().save(&cache_key, &outcome.records) {
                        Err(e) if e.is_cache_error() => {
                            warn!(error = %e, "Cache write failed, continuing without it");
                        }
                        other => other?,
                    }
                }
                (outcome.records, outcome.stats)
            }
        };

        let rows = format_records(formatter.as_ref(), &records)?;
        let rendered = render_csv(formatter.as_ref(), &rows)?;

        output.write_all(&rendered)?;
        output.flush()?;

        if let Some(raw) = raw_output {
            serde_json::to_writer_pretty(&mut *raw, &records).map_err(io::Error::from)?;
            raw.write_all(b"\n")?;
            raw.flush()?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_report(rows.len());
        }

        let summary = ReportSummary {
            run_id,
            resource_type: policy.resource_type.clone(),
            batches: stats.batches,
            records: records.len(),
            rows: rows.len(),
            from_cache,
        };
        info!(
            run_id = %summary.run_id,
            batches = summary.batches,
            records = summary.records,
            rows = summary.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Report generated"
        );
        Ok(summary)
    }

    fn source_for(
        &self,
        location: &OutputLocation,
        start_date: DateTime<Utc>,
    ) -> Result<Arc<dyn RecordSource>> {
        let source: Arc<dyn RecordSource> = match location {
            OutputLocation::Remote { bucket, key_prefix } => {
                let store = self.store.clone().ok_or_else(|| {
                    ReportError::Configuration(format!(
                        "No object store configured for {}",
                        location
                    ))
                })?;
                Arc::new(ObjectStoreSource::new(
                    store,
                    bucket.clone(),
                    key_prefix.clone(),
                    start_date,
                ))
            }
            OutputLocation::Local(dir) => Arc::new(FilesystemSource::new(dir.clone())),
        };

        debug!(source = %source.describe(), "Resolved record source");
        Ok(source)
    }
}

/// Header row then data rows, into memory
fn render_csv(formatter: &dyn Formatter, rows: &[Row]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(formatter.headers())?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| ReportError::Output(e.into_error()))
}
