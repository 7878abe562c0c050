use std::env;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use aws_sdk_s3::{
    config::BehaviorVersion,
    error::SdkError,
    operation::{
        delete_object::DeleteObjectError, get_object::GetObjectError,
        head_object::HeadObjectError, list_objects_v2::ListObjectsV2Error,
        put_object::PutObjectError,
    },
    primitives::ByteStream,
    Client,
};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use super::{ObjectStore, PutCondition, StorageError};

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint (`MinIO`, `LocalStack`). `None` means AWS.
    pub endpoint: Option<String>,
    /// Bucket holding all crmq state.
    pub bucket: String,
    /// AWS region.
    pub region: String,
}

impl S3Config {
    /// Reads `S3_ENDPOINT` (optional), `S3_BUCKET` and `S3_REGION`.
    ///
    /// # Errors
    ///
    /// Returns an error if `S3_BUCKET` or `S3_REGION` is unset.
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|e| !e.is_empty()),
            bucket: env::var("S3_BUCKET")?,
            region: env::var("S3_REGION")?,
        })
    }

    /// Creates a config from explicit values.
    #[must_use]
    pub const fn new(endpoint: Option<String>, bucket: String, region: String) -> Self {
        Self {
            endpoint,
            bucket,
            region,
        }
    }
}

/// Durable multi-process backend on S3 conditional writes.
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    config: S3Config,
    clock: Arc<RwLock<ClockSample>>,
    clock_sync_lock: Arc<Mutex<()>>,
    clock_sync_interval: StdDuration,
    clock_key: String,
}

#[derive(Debug, Clone, Default)]
struct ClockSample {
    server_time: Option<DateTime<Utc>>,
    taken_at: Option<Instant>,
}

impl S3Client {
    /// Builds the SDK client, honoring a custom endpoint with path-style addressing.
    pub async fn new(config: S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::ConfigurationError(
                "bucket name is empty".to_string(),
            ));
        }

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
            clock: Arc::new(RwLock::new(ClockSample::default())),
            clock_sync_lock: Arc::new(Mutex::new(())),
            clock_sync_interval: StdDuration::from_secs(5),
            clock_key: "clock/now".to_string(),
        })
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn cached_now(&self) -> Option<DateTime<Utc>> {
        let sample = self.clock.read().await;
        let (Some(server_time), Some(taken_at)) = (sample.server_time, sample.taken_at) else {
            return None;
        };
        drop(sample);

        let elapsed = taken_at.elapsed();
        if elapsed > self.clock_sync_interval {
            return None;
        }
        Some(server_time + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero()))
    }

    /// Touches the clock object and reads back its `Last-Modified`.
    async fn sync_server_time(&self) -> Result<DateTime<Utc>, StorageError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&self.clock_key)
            .body(ByteStream::from(Vec::new()))
            .send()
            .await
            .map_err(|ref err| map_put_error(err, &self.config.bucket, &self.clock_key))?;

        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&self.clock_key)
            .send()
            .await
            .map_err(|ref err| map_head_error(err, &self.clock_key))?;

        let modified = head
            .last_modified()
            .ok_or_else(|| StorageError::S3Error("clock object has no Last-Modified".into()))?;
        DateTime::from_timestamp(modified.secs(), modified.subsec_nanos())
            .ok_or_else(|| StorageError::S3Error("clock timestamp out of range".into()))
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    /// Server time, cached locally for a few seconds.
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        if let Some(now) = self.cached_now().await {
            return Ok(now);
        }

        let _guard = self.clock_sync_lock.lock().await;
        if let Some(now) = self.cached_now().await {
            return Ok(now);
        }

        let server_time = self.sync_server_time().await?;
        let mut sample = self.clock.write().await;
        sample.server_time = Some(server_time);
        sample.taken_at = Some(Instant::now());
        Ok(server_time)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition,
    ) -> Result<String, StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body));

        request = match condition {
            PutCondition::None => request,
            PutCondition::IfNoneMatch => request.if_none_match("*"),
            PutCondition::IfMatch(ref etag) => request.if_match(etag),
        };

        let response = request
            .send()
            .await
            .map_err(|ref err| map_put_error(err, &self.config.bucket, key))?;

        Ok(response.e_tag().map(ToString::to_string).unwrap_or_default())
    }

    async fn get_object(&self, key: &str) -> Result<(Vec<u8>, String), StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|ref err| map_get_error(err, &self.config.bucket, key))?;

        let etag = response.e_tag().map(ToString::to_string).unwrap_or_default();
        let body = response
            .body
            .collect()
            .await
            .map_err(|err| StorageError::S3Error(format!("failed to read body: {err}")))?
            .into_bytes()
            .to_vec();

        Ok((body, etag))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|ref err| map_delete_error(err))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        limit: i32,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), StorageError> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(prefix)
            .max_keys(limit);
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|ref err| map_list_error(err))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(ToString::to_string))
            .collect();
        Ok((keys, response.next_continuation_token().map(ToString::to_string)))
    }
}

fn map_put_error(err: &SdkError<PutObjectError>, bucket: &str, key: &str) -> StorageError {
    match err {
        SdkError::ServiceError(service_err) => match service_err.raw().status().as_u16() {
            409 | 412 => {
                return StorageError::PreconditionFailed {
                    key: key.to_string(),
                }
            }
            403 => {
                return StorageError::AccessDenied {
                    bucket: bucket.to_string(),
                }
            }
            _ => {}
        },
        SdkError::DispatchFailure(dispatch_err)
            if dispatch_err.is_io() || dispatch_err.is_timeout() =>
        {
            return StorageError::ConnectionError(err.to_string());
        }
        _ => {}
    }
    StorageError::S3Error(err.to_string())
}

fn map_get_error(err: &SdkError<GetObjectError>, bucket: &str, key: &str) -> StorageError {
    match err {
        SdkError::ServiceError(service_err) => {
            if matches!(service_err.err(), GetObjectError::NoSuchKey(_))
                || service_err.raw().status().as_u16() == 404
            {
                return StorageError::NotFound {
                    key: key.to_string(),
                };
            }
            if service_err.raw().status().as_u16() == 403 {
                return StorageError::AccessDenied {
                    bucket: bucket.to_string(),
                };
            }
        }
        SdkError::DispatchFailure(dispatch_err)
            if dispatch_err.is_io() || dispatch_err.is_timeout() =>
        {
            return StorageError::ConnectionError(err.to_string());
        }
        _ => {}
    }
    StorageError::S3Error(err.to_string())
}

fn map_head_error(err: &SdkError<HeadObjectError>, key: &str) -> StorageError {
    if let SdkError::ServiceError(service_err) = err {
        if matches!(service_err.err(), HeadObjectError::NotFound(_))
            || service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound {
                key: key.to_string(),
            };
        }
    }
    connection_or_other(err)
}

fn map_delete_error(err: &SdkError<DeleteObjectError>) -> StorageError {
    connection_or_other(err)
}

fn map_list_error(err: &SdkError<ListObjectsV2Error>) -> StorageError {
    connection_or_other(err)
}

fn connection_or_other<E, R>(err: &SdkError<E, R>) -> StorageError
where
    SdkError<E, R>: std::fmt::Display,
{
    if let SdkError::DispatchFailure(dispatch_err) = err {
        if dispatch_err.is_io() || dispatch_err.is_timeout() {
            return StorageError::ConnectionError(err.to_string());
        }
    }
    StorageError::S3Error(err.to_string())
}
