//! Per-instance metadata documents: the full structured dataset and the
//! precomputed frame-offset index.
//!
//! Both are JSON documents stored next to the instance blob, written once per
//! watermark by the store path and immutable afterwards. The frame index must
//! exactly match how the write path laid out frame boundaries in the blob; a
//! missing entry means the index is stale or absent, never silently wrong.

use crate::blob_store::versioned_key;
use crate::identifiers::{FrameRange, VersionedInstanceIdentifier};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::instrument;

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("frame index not found for watermark {0}")]
    IndexNotFound(i64),

    #[error("metadata document not found for watermark {0}")]
    DocumentNotFound(i64),

    #[error("malformed metadata document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Read interface over per-watermark metadata documents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the frame-offset index for one stored version. Fails with
    /// `IndexNotFound` when no index was written for this watermark.
    async fn get_frames_range(
        &self,
        version: &VersionedInstanceIdentifier,
    ) -> MetadataResult<BTreeMap<u32, FrameRange>>;

    /// Fetch the full structured dataset document for one stored version.
    /// Not on the blob retrieval path: the host's metadata endpoint serves
    /// these documents directly, bypassing the orchestrator.
    async fn get_instance_metadata_document(
        &self,
        version: &VersionedInstanceIdentifier,
    ) -> MetadataResult<Bytes>;
}

/// S3-backed metadata store sharing the blob bucket.
pub struct S3MetadataStore {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3MetadataStore {
    pub fn new(client: S3Client, bucket: String, prefix: Option<String>) -> Self {
        let prefix = prefix.map(|p| p.trim_end_matches('/').to_string());
        Self {
            client,
            bucket,
            prefix,
        }
    }

    async fn get_document(
        &self,
        version: &VersionedInstanceIdentifier,
        suffix: &str,
    ) -> MetadataResult<Option<Bytes>> {
        let key = versioned_key(self.prefix.as_deref(), version, suffix);
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
                    if service_err.raw().status().as_u16() == 404 {
                        return Ok(None);
                    }
                }
                return Err(MetadataError::S3(Box::new(err)));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| MetadataError::S3(Box::new(e)))?
            .into_bytes();
        Ok(Some(bytes))
    }
}

#[async_trait]
impl MetadataStore for S3MetadataStore {
    #[instrument(skip(self), fields(watermark = version.watermark))]
    async fn get_frames_range(
        &self,
        version: &VersionedInstanceIdentifier,
    ) -> MetadataResult<BTreeMap<u32, FrameRange>> {
        let bytes = self
            .get_document(version, "frames.json")
            .await?
            .ok_or(MetadataError::IndexNotFound(version.watermark))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[instrument(skip(self), fields(watermark = version.watermark))]
    async fn get_instance_metadata_document(
        &self,
        version: &VersionedInstanceIdentifier,
    ) -> MetadataResult<Bytes> {
        self.get_document(version, "metadata.json")
            .await?
            .ok_or(MetadataError::DocumentNotFound(version.watermark))
    }
}
