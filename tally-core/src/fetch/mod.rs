//! Batch Fetcher
//!
//! Turns a source's batch listing into one merged [`RecordCollection`]
//! using a fixed-width pool of fetch tasks. Merge order follows completion
//! order and carries no meaning; formatters impose their own.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{ReportError, Result};
use crate::metrics::ReportMetrics;
use crate::record::{Batch, RecordCollection};
use crate::source::{BatchHandle, RecordSource};

/// Default number of concurrent batch fetches
pub const DEFAULT_FETCH_WORKERS: usize = 20;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Width of the fetch pool
    pub workers: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_FETCH_WORKERS,
        }
    }
}

impl FetchConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Totals reported once a fetch completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub batches: usize,
    pub records: usize,
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub records: RecordCollection,
    pub stats: FetchStats,
}

/// Concurrent batch fetcher
pub struct BatchFetcher {
    config: FetchConfig,
    metrics: Option<Arc<ReportMetrics>>,
}

impl Default for BatchFetcher {
    fn default() -> Self {
        Self::new(FetchConfig::default())
    }
}

impl BatchFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch every listed batch and merge the records.
    ///
    /// The first listing or fetch error stops submission of new batches;
    /// fetches already running are allowed to finish before that error is
    /// returned. There is no partial result.
    pub async fn fetch_all(&self, source: Arc<dyn RecordSource>) -> Result<FetchOutcome> {
        let workers = self.config.workers.max(1);
        let metrics = self.metrics.as_deref();
        let mut tasks: JoinSet<Result<Batch>> = JoinSet::new();
        let mut merged = Merge::default();
        let mut first_error: Option<ReportError> = None;

        {
            let mut handles = source.list_batches();

            loop {
                // Reap whatever already finished before submitting more
                while let Some(joined) = tasks.try_join_next() {
                    if let Err(e) = merged.take(joined, metrics) {
                        first_error = Some(e);
                        break;
                    }
                }
                if first_error.is_some() {
                    break;
                }

                // Pool full: wait for a slot
                if tasks.len() >= workers {
                    if let Some(joined) = tasks.join_next().await {
                        if let Err(e) = merged.take(joined, metrics) {
                            first_error = Some(e);
                            break;
                        }
                    }
                    continue;
                }

                // A slow listing must not hide a failed fetch
                let step = tokio::select! {
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => Step::Joined(joined),
                    listed = handles.next() => Step::Listed(listed),
                };

                let handle = match step {
                    Step::Joined(joined) => {
                        if let Err(e) = merged.take(joined, metrics) {
                            first_error = Some(e);
                            break;
                        }
                        continue;
                    }
                    Step::Listed(Some(Ok(handle))) => handle,
                    Step::Listed(Some(Err(e))) => {
                        first_error = Some(e);
                        break;
                    }
                    Step::Listed(None) => break,
                };

                let worker_source = Arc::clone(&source);
                let worker_metrics = self.metrics.clone();
                tasks.spawn(async move {
                    let started = Instant::now();
                    let batch = worker_source.fetch_batch(&handle).await?;
                    if let Some(metrics) = worker_metrics {
                        metrics.record_batch(batch.len(), started.elapsed());
                    }
                    Ok(batch)
                });
            }
        }

        // Drain in-flight fetches; no new submissions from here on
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = merged.take(joined, metrics) {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    debug!(error = %e, "Additional fetch failure while draining");
                }
            }
        }

        if let Some(e) = first_error {
            warn!(
                source = %source.describe(),
                error = %e,
                "Batch fetch failed"
            );
            return Err(e);
        }

        let stats = merged.stats;
        info!(
            source = %source.describe(),
            records = stats.records,
            batches = stats.batches,
            "Fetched {} records across {} batches",
            stats.records,
            stats.batches
        );

        Ok(FetchOutcome {
            records: merged.records,
            stats,
        })
    }
}

type Joined = std::result::Result<Result<Batch>, JoinError>;

/// Whichever of the listing and the pool made progress first
enum Step {
    Joined(Joined),
    Listed(Option<Result<BatchHandle>>),
}

/// Accumulator owned by the fetcher; workers hand batches over by return
#[derive(Default)]
struct Merge {
    records: RecordCollection,
    stats: FetchStats,
}

impl Merge {
    fn take(&mut self, joined: Joined, metrics: Option<&ReportMetrics>) -> Result<()> {
        let batch = joined
            .map_err(|e| ReportError::Task(e.to_string()))
            .and_then(|r| r)
            .inspect_err(|_| {
                if let Some(metrics) = metrics {
                    metrics.record_failure();
                }
            })?;

        self.stats.batches += 1;
        self.stats.records += batch.len();
        self.records.absorb(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{encode_batch, InMemoryObjectStore, ObjectStoreSource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use futures::stream::{self, BoxStream};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn store_with_batches(count: usize) -> Arc<InMemoryObjectStore> {
        let store = InMemoryObjectStore::new(7);
        for day in 1..=count {
            let records: Vec<_> = (0..3)
                .map(|i| json!({"InstanceId": format!("i-{}-{}", day, i)}))
                .collect();
            store.put(
                "bucket",
                format!("p/2016-01-{:02}-00/resources.json.gz", day),
                encode_batch(&records).unwrap(),
            );
        }
        Arc::new(store)
    }

    fn source(store: Arc<InMemoryObjectStore>) -> Arc<dyn RecordSource> {
        let start = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        Arc::new(ObjectStoreSource::new(store, "bucket", "p", start))
    }

    #[tokio::test]
    async fn test_fetch_merges_all_batches() {
        let metrics = Arc::new(ReportMetrics::new());
        let fetcher = BatchFetcher::new(FetchConfig::default().with_workers(4))
            .with_metrics(metrics.clone());

        let outcome = fetcher.fetch_all(source(store_with_batches(25))).await.unwrap();

        assert_eq!(outcome.stats, FetchStats { batches: 25, records: 75 });
        assert_eq!(outcome.records.len(), 75);
        assert_eq!(metrics.batches_fetched.get(), 25);
        assert_eq!(metrics.records_fetched.get(), 75);
    }

    #[tokio::test]
    async fn test_fetch_empty_source() {
        let outcome = BatchFetcher::default()
            .fetch_all(source(Arc::new(InMemoryObjectStore::default())))
            .await
            .unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.stats, FetchStats::default());
    }

    #[tokio::test]
    async fn test_single_bad_batch_fails_the_fetch() {
        let store = store_with_batches(10);
        store.put(
            "bucket",
            "p/2016-01-05-12/resources.json.gz",
            Bytes::from_static(b"garbage"),
        );

        let err = BatchFetcher::default()
            .fetch_all(source(store))
            .await
            .unwrap_err();

        assert!(
            matches!(err, ReportError::MalformedBatch { ref key, .. } if key == "p/2016-01-05-12/resources.json.gz")
        );
    }

    /// Source that fails one batch and counts submissions
    struct CountingSource {
        total: usize,
        fail_at: usize,
        /// Pause before each listed handle
        list_delay: Duration,
        fetched: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingSource {
        fn new(total: usize, fail_at: usize) -> Self {
            Self {
                total,
                fail_at,
                list_delay: Duration::ZERO,
                fetched: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordSource for CountingSource {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn list_batches(&self) -> BoxStream<'_, Result<BatchHandle>> {
            let delay = self.list_delay;
            stream::iter(0..self.total)
                .then(move |i| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(BatchHandle::new(i.to_string()))
                })
                .boxed()
        }

        async fn fetch_batch(&self, handle: &BatchHandle) -> Result<Batch> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.fetched.fetch_add(1, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let index: usize = handle.key.parse().unwrap();
            if index == self.fail_at {
                return Err(ReportError::source_unavailable(&handle.key, "connection reset"));
            }
            Batch::parse(&handle.key, Utc::now(), r#"[{"id": 1}]"#.as_bytes())
        }
    }

    #[tokio::test]
    async fn test_pool_width_is_bounded() {
        let counting = Arc::new(CountingSource::new(40, usize::MAX));
        let fetcher = BatchFetcher::new(FetchConfig::default().with_workers(3));

        let outcome = fetcher.fetch_all(counting.clone()).await.unwrap();

        assert_eq!(outcome.stats.batches, 40);
        assert!(counting.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_failure_stops_submission() {
        let counting = Arc::new(CountingSource::new(200, 0));
        let fetcher = BatchFetcher::new(FetchConfig::default().with_workers(2));

        let err = fetcher.fetch_all(counting.clone()).await.unwrap_err();

        assert!(matches!(err, ReportError::SourceUnavailable { .. }));
        assert!(counting.fetched.load(Ordering::SeqCst) < 200);
        assert_eq!(counting.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_during_slow_listing_stops_submission() {
        let counting = Arc::new(CountingSource {
            list_delay: Duration::from_millis(20),
            ..CountingSource::new(10, 0)
        });

        let err = BatchFetcher::default()
            .fetch_all(counting.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, ReportError::SourceUnavailable { .. }));
        // Batch 0 fails 5ms in, long before the listing produces batch 2
        assert!(counting.fetched.load(Ordering::SeqCst) <= 2);
        assert_eq!(counting.in_flight.load(Ordering::SeqCst), 0);
    }
}
