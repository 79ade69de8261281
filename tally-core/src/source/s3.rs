//! AWS S3 object store backend.

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::error::{ReportError, Result};
use crate::source::{ListPage, ListRequest, ObjectStore};

/// S3 backend over the default AWS credential chain
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Build a client from the environment, optionally pinning the region
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Self {
            client: S3Client::new(&config),
        }
    }

    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

/// `StartAfter` is exclusive; dropping the marker's last byte makes the
/// marker key itself visible. The shortened key also admits a few
/// non-archive keys sorting just below the marker (e.g.
/// `…/resources.json.g/…`); `ObjectStoreSource` drops everything below the
/// marker after listing.
fn exclusive_start(start_at: &str) -> String {
    let mut start = start_at.to_string();
    start.pop();
    start
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %request.bucket, prefix = %request.prefix))]
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let mut call = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix);

        if let Some(start_at) = request.start_at.as_deref().filter(|s| !s.is_empty()) {
            call = call.start_after(exclusive_start(start_at));
        }
        if let Some(token) = &request.continuation {
            call = call.continuation_token(token);
        }

        let response = call.send().await.map_err(|e| {
            ReportError::source_unavailable(
                format!("s3://{}/{}", request.bucket, request.prefix),
                aws_sdk_s3::error::DisplayErrorContext(e),
            )
        })?;

        let keys: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|object| object.key().map(String::from))
            .collect();

        let next_continuation = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(String::from)
        } else {
            None
        };

        debug!(keys = keys.len(), more = next_continuation.is_some(), "Listed S3 page");
        Ok(ListPage {
            keys,
            next_continuation,
        })
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let location = format!("s3://{}/{}", bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                ReportError::source_unavailable(&location, aws_sdk_s3::error::DisplayErrorContext(e))
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ReportError::source_unavailable(&location, e))?;

        Ok(body.into_bytes())
    }
}
