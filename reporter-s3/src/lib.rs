//! S3-compatible [`reporter::ports::ObjectStore`] adapter, built on
//! `aws-sdk-s3`. `put` is idempotent on overwrite: S3's
//! `PutObject` always replaces the object at `key`, so no read-before-write
//! is needed.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use reporter::ports::ObjectStore;
use reporter::ReportError;

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS config (env vars, profile,
    /// instance metadata), optionally overriding the endpoint for an
    /// S3-compatible backend (e.g. MinIO).
    pub async fn from_env(endpoint_override: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_override {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ReportError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(bucket, key, error = %e, "s3 put_object failed");
                ReportError::unknown(e.into_service_error())
            })?;
        Ok(())
    }
}
