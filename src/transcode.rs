//! Codec seams: transcoding and frame extraction.
//!
//! Both operations require the whole object in memory and are performed by an
//! external codec; the orchestrator treats them as black boxes and enforces
//! the transfer ceiling before handing bytes over.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Converts a stored object from its native transfer syntax to a requested
/// target syntax.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, object: Bytes, target_transfer_syntax: &str) -> Result<Bytes>;
}

/// Parses a full object and yields the payload of each requested frame
/// number, in request order.
///
/// Fails with `FrameNotFound` when a requested frame number does not exist in
/// the object. When `original_requested` is false the extracted payloads are
/// recoded to `target_transfer_syntax`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(
        &self,
        object: Bytes,
        frames: &[u32],
        original_requested: bool,
        target_transfer_syntax: &str,
    ) -> Result<Vec<Bytes>>;
}
