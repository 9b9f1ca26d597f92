//! Error taxonomy for the retrieve core.
//!
//! Validation failures (`NotFound`, `NotAcceptable`, `FrameNotFound`) are
//! raised before any output streaming begins. Storage-layer failures are
//! carried opaquely in `DataStore` and re-raised unchanged; the transport
//! layer maps each member to its own response signal.

use crate::blob_store::BlobError;
use crate::catalog::CatalogError;
use crate::metadata_store::MetadataError;
use thiserror::Error;

/// Errors surfaced by the retrieval orchestrator.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// No instance matched the requested resource. Logical absence, not a
    /// fault.
    #[error("no matching instances were found")]
    NotFound,

    /// Specific requested frame numbers are absent from an otherwise valid
    /// instance.
    #[error("requested frames not found: {0:?}")]
    FrameNotFound(Vec<u32>),

    /// Negotiation impossible, an unsupported request combination, or the
    /// object exceeds the configured transfer ceiling.
    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    /// An underlying storage call failed. Never retried or downgraded here.
    #[error("data store failure: {0}")]
    DataStore(#[from] anyhow::Error),
}

/// Result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrieveError>;

impl From<CatalogError> for RetrieveError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound => RetrieveError::NotFound,
            CatalogError::Database(e) => RetrieveError::DataStore(e.into()),
        }
    }
}

impl From<BlobError> for RetrieveError {
    fn from(err: BlobError) -> Self {
        RetrieveError::DataStore(anyhow::Error::new(err))
    }
}

impl From<MetadataError> for RetrieveError {
    fn from(err: MetadataError) -> Self {
        RetrieveError::DataStore(anyhow::Error::new(err))
    }
}
