//! Content-addressable blob storage keyed by versioned instance identifier.
//!
//! Supports whole-object streaming fetch, a HEAD-only property lookup (used
//! by the size ceiling so no byte is transferred before validation), and
//! byte-range fetch for a single frame.

use crate::identifiers::{FrameRange, VersionedInstanceIdentifier};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

/// Blob storage errors.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for blob operations.
pub type BlobResult<T> = std::result::Result<T, BlobError>;

/// Size of a stored blob, from a HEAD lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProperties {
    pub content_length: u64,
}

/// A whole-object read: the declared length plus the body stream.
pub struct BlobFile {
    pub content_length: u64,
    pub stream: ByteStream,
}

/// Narrow read interface over the blob store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the whole stored object as a stream.
    async fn get_file(&self, version: &VersionedInstanceIdentifier) -> BlobResult<BlobFile>;

    /// Look up object size without transferring the body.
    async fn get_file_properties(
        &self,
        version: &VersionedInstanceIdentifier,
    ) -> BlobResult<FileProperties>;

    /// Fetch one frame's bytes as an independent ranged read.
    async fn get_file_frame(
        &self,
        version: &VersionedInstanceIdentifier,
        range: FrameRange,
    ) -> BlobResult<ByteStream>;
}

/// S3-backed blob store.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3BlobStore {
    /// Create a blob store from configuration, building the S3 client the
    /// same way for AWS and S3-compatible endpoints (MinIO, LocalStack).
    pub async fn new(config: &crate::config::BlobConfig) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self::with_client(
            S3Client::from_conf(builder.build()),
            config.bucket.clone(),
            config.prefix.clone(),
        )
    }

    pub fn with_client(client: S3Client, bucket: String, prefix: Option<String>) -> Self {
        let prefix = prefix.map(|p| p.trim_end_matches('/').to_string());
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Object key for a stored instance blob.
    fn file_key(&self, version: &VersionedInstanceIdentifier) -> String {
        versioned_key(self.prefix.as_deref(), version, "dcm")
    }

    /// Convert an S3 SDK error, mapping 404 to `NotFound` for the given key.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> BlobError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            if service_err.raw().status().as_u16() == 404 {
                return BlobError::NotFound(key.to_string());
            }
        }
        BlobError::S3(Box::new(err))
    }
}

/// Build the object key for one stored version.
/// Layout: `[prefix/]{partition}/{study}/{series}/{sop}_{watermark}.{suffix}`.
pub(crate) fn versioned_key(
    prefix: Option<&str>,
    version: &VersionedInstanceIdentifier,
    suffix: &str,
) -> String {
    let id = &version.identifier;
    let key = format!(
        "{}/{}/{}/{}_{}.{}",
        id.partition_key,
        id.study_instance_uid,
        id.series_instance_uid,
        id.sop_instance_uid,
        version.watermark,
        suffix
    );
    match prefix {
        Some(prefix) => format!("{}/{}", prefix, key),
        None => key,
    }
}

/// Format the S3 Range header for a frame. S3 uses an inclusive end offset.
fn range_header(range: &FrameRange) -> String {
    format!("bytes={}-{}", range.offset, range.offset + range.length - 1)
}

fn body_stream(body: aws_sdk_s3::primitives::ByteStream) -> ByteStream {
    let reader = ReaderStream::new(body.into_async_read());
    Box::pin(reader.map(|chunk| chunk.map_err(BlobError::Io)))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(watermark = version.watermark))]
    async fn get_file(&self, version: &VersionedInstanceIdentifier) -> BlobResult<BlobFile> {
        let key = self.file_key(version);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        Ok(BlobFile {
            content_length: output.content_length().unwrap_or(0) as u64,
            stream: body_stream(output.body),
        })
    }

    #[instrument(skip(self), fields(watermark = version.watermark))]
    async fn get_file_properties(
        &self,
        version: &VersionedInstanceIdentifier,
    ) -> BlobResult<FileProperties> {
        let key = self.file_key(version);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        Ok(FileProperties {
            content_length: output.content_length().unwrap_or(0) as u64,
        })
    }

    #[instrument(skip(self), fields(watermark = version.watermark))]
    async fn get_file_frame(
        &self,
        version: &VersionedInstanceIdentifier,
        range: FrameRange,
    ) -> BlobResult<ByteStream> {
        if range.length == 0 {
            return Err(BlobError::InvalidRange(
                "frame range length must be non-zero".to_string(),
            ));
        }

        let key = self.file_key(version);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .range(range_header(&range))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        Ok(body_stream(output.body))
    }
}
