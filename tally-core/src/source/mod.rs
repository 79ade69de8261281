//! Record Sources
//!
//! Where the compliance job leaves its output:
//! - Object store: one gzip JSON archive per run under `<prefix>/<date>/`
//! - Local filesystem: a single `resources.json` snapshot
//!
//! Both are exposed through [`RecordSource`] so the fetcher never cares
//! which one it is reading.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ReportError, Result};
use crate::record::Batch;

#[cfg(feature = "s3")]
pub mod s3;

/// File name of a compressed run archive in the object store
pub const BATCH_ARCHIVE_NAME: &str = "resources.json.gz";

/// File name of the local snapshot
pub const SNAPSHOT_NAME: &str = "resources.json";

const S3_SCHEME: &str = "s3://";

/// Where a policy's output lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    Remote { bucket: String, key_prefix: String },
    Local(PathBuf),
}

impl OutputLocation {
    /// Parse `s3://bucket/prefix` or a local directory path
    pub fn parse(location: &str) -> Result<Self> {
        let Some(rest) = location.strip_prefix(S3_SCHEME) else {
            if location.is_empty() {
                return Err(ReportError::Configuration("empty output location".to_string()));
            }
            return Ok(Self::Local(PathBuf::from(location)));
        };

        let (bucket, key_prefix) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };

        if bucket.is_empty() {
            return Err(ReportError::Configuration(format!(
                "invalid s3 output location {}: missing bucket",
                location
            )));
        }

        Ok(Self::Remote {
            bucket: bucket.to_string(),
            key_prefix: key_prefix.to_string(),
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Location of one policy's output beneath this root
    pub fn for_policy(&self, policy_name: &str) -> Self {
        match self {
            Self::Remote { bucket, key_prefix } => Self::Remote {
                bucket: bucket.clone(),
                key_prefix: format!("{}/{}", key_prefix.trim_end_matches('/'), policy_name),
            },
            Self::Local(dir) => Self::Local(dir.join(policy_name)),
        }
    }
}

impl std::fmt::Display for OutputLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { bucket, key_prefix } => write!(f, "{}{}{}", S3_SCHEME, bucket, key_prefix),
            Self::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// A batch discovered by listing, not yet fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub key: String,
}

impl BatchHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Trait for places record batches can be read from
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Human-readable location, used in errors and logs
    fn describe(&self) -> String;

    /// Lazily enumerate the batches this source holds
    fn list_batches(&self) -> BoxStream<'_, Result<BatchHandle>>;

    /// Fetch, decompress and parse one batch
    async fn fetch_batch(&self, handle: &BatchHandle) -> Result<Batch>;
}

/// One page of an object listing request
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    /// Only keys lexically at or after this one
    pub start_at: Option<String>,
    /// Token from the previous page
    pub continuation: Option<String>,
}

/// One page of listed keys
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Set when more pages follow
    pub next_continuation: Option<String>,
}

/// Trait for object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one page of keys, in lexical order
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage>;

    /// Download a whole object
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;
}

/// In-memory object store for testing and development
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), Bytes>>,
    page_size: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl InMemoryObjectStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn put(&self, bucket: impl Into<String>, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .insert((bucket.into(), key.into()), data.into());
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let objects = self.objects.read();
        let after_token = request.continuation.as_deref();

        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(bucket, key)| {
                bucket == &request.bucket
                    && key.starts_with(&request.prefix)
                    && request.start_at.as_deref().map_or(true, |s| key.as_str() >= s)
                    && after_token.map_or(true, |t| key.as_str() > t)
            })
            .map(|(_, key)| key.clone())
            .take(self.page_size + 1)
            .collect();

        let next_continuation = if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ListPage {
            keys,
            next_continuation,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                ReportError::source_unavailable(format!("{}{}/{}", S3_SCHEME, bucket, key), "object not found")
            })
    }
}

/// Gzip a JSON array of records the way the compliance job archives them
pub fn encode_batch<T: serde::Serialize>(records: &[T]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, records)
        .map_err(|e| ReportError::Configuration(format!("records not serializable: {}", e)))?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Parse the logical batch date from the key segment before the file name
pub fn parse_batch_date(key: &str) -> Result<DateTime<Utc>> {
    let mut segments = key.rsplit('/');
    let _file = segments.next();
    let segment = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ReportError::malformed_batch(key, "no date segment in key"))?;

    parse_date_segment(segment)
        .ok_or_else(|| ReportError::malformed_batch(key, format!("unparseable batch date {:?}", segment)))
}

fn parse_date_segment(segment: &str) -> Option<DateTime<Utc>> {
    // YYYY-MM-DD-HH, as written by the compliance job
    if let (Some(day), Some('-'), Some(hour)) = (
        segment.get(..10),
        segment.chars().nth(10),
        segment.get(11..),
    ) {
        if let (Ok(day), Ok(hour)) = (NaiveDate::parse_from_str(day, "%Y-%m-%d"), hour.parse::<u32>()) {
            return day.and_hms_opt(hour, 0, 0).map(|dt| dt.and_utc());
        }
    }

    if let Ok(day) = NaiveDate::parse_from_str(segment, "%Y-%m-%d") {
        return day.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    DateTime::parse_from_rfc3339(segment)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Gzip JSON archives under a key prefix in an object store
pub struct ObjectStoreSource {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key_prefix: String,
    start_date: DateTime<Utc>,
}

impl ObjectStoreSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
            start_date,
        }
    }

    /// Listing prefix; always ends in `/` unless the whole bucket is listed
    pub fn prefix(&self) -> String {
        let trimmed = self.key_prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        }
    }

    /// First key the listing visits
    pub fn marker(&self) -> String {
        format!(
            "{}{}/{}",
            self.prefix(),
            self.start_date.format("%Y-%m-%d-%H"),
            BATCH_ARCHIVE_NAME
        )
    }
}

#[async_trait]
impl RecordSource for ObjectStoreSource {
    fn describe(&self) -> String {
        format!("{}{}/{}", S3_SCHEME, self.bucket, self.prefix())
    }

    fn list_batches(&self) -> BoxStream<'_, Result<BatchHandle>> {
        let prefix = self.prefix();
        let marker = self.marker();
        let lower_bound = marker.clone();

        // None: listing exhausted. Some(token): next page to request.
        let pages = stream::try_unfold(Some(None), move |state: Option<Option<String>>| {
            let request = state.map(|continuation| ListRequest {
                bucket: self.bucket.clone(),
                prefix: prefix.clone(),
                start_at: Some(marker.clone()),
                continuation,
            });

            async move {
                let Some(request) = request else {
                    return Ok(None);
                };
                let page = self.store.list_page(&request).await?;
                debug!(
                    bucket = %request.bucket,
                    prefix = %request.prefix,
                    keys = page.keys.len(),
                    "Listed object page"
                );
                let next = page.next_continuation.map(Some);
                Ok::<_, ReportError>(Some((page.keys, next)))
            }
        });

        pages
            .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<_, ReportError>)))
            .try_flatten()
            // Backends may approximate the start key; the marker is the bound
            .try_filter(move |key| {
                future::ready(key.ends_with(BATCH_ARCHIVE_NAME) && key.as_str() >= lower_bound.as_str())
            })
            .map_ok(BatchHandle::new)
            .boxed()
    }

    async fn fetch_batch(&self, handle: &BatchHandle) -> Result<Batch> {
        let date = parse_batch_date(&handle.key)?;
        let data = self.store.get_object(&self.bucket, &handle.key).await?;
        let batch = Batch::parse(&handle.key, date, GzDecoder::new(data.as_ref()))?;

        debug!(
            bucket = %self.bucket,
            key = %handle.key,
            records = batch.len(),
            "Fetched batch"
        );
        Ok(batch)
    }
}

/// The single snapshot file a local run leaves in its output directory
pub struct FilesystemSource {
    dir: PathBuf,
}

impl FilesystemSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_NAME)
    }
}

#[async_trait]
impl RecordSource for FilesystemSource {
    fn describe(&self) -> String {
        self.snapshot_path().display().to_string()
    }

    fn list_batches(&self) -> BoxStream<'_, Result<BatchHandle>> {
        let path = self.snapshot_path();
        stream::once(async move {
            match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => Ok(Some(BatchHandle::new(path.display().to_string()))),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(ReportError::source_unavailable(path.display().to_string(), e)),
            }
        })
        .try_filter_map(future::ok)
        .boxed()
    }

    async fn fetch_batch(&self, handle: &BatchHandle) -> Result<Batch> {
        let path = Path::new(&handle.key);
        let unavailable = |e: std::io::Error| ReportError::source_unavailable(&handle.key, e);

        let metadata = tokio::fs::metadata(path).await.map_err(unavailable)?;
        let modified = metadata.modified().map_err(unavailable)?;
        let data = tokio::fs::read(path).await.map_err(unavailable)?;

        Batch::parse(&handle.key, DateTime::<Utc>::from(modified), data.as_slice())
    }
}

/// Read a gzip JSON archive from any reader; used for ad-hoc inspection
pub fn decode_batch<R: Read>(key: &str, date: DateTime<Utc>, reader: R) -> Result<Batch> {
    Batch::parse(key, date, GzDecoder::new(reader))
}
