//! Medical Image Retrieve Service
//!
//! Core retrieval engine for a medical imaging store: serves large binary
//! image objects (instances) addressed by tenant partition and the
//! study / series / SOP instance hierarchy, with on-the-fly transfer syntax
//! transcoding and frame-level byte-range retrieval. Blobs live in S3,
//! instance metadata in PostgreSQL, frame indexes as JSON documents beside
//! the blobs.
//!
//! ## Architecture
//!
//! ```text
//! Transport layer              S3 Bucket                 PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Retrieve     │           │ {partition}/ │          │ instance     │
//! │ Request      │──────────▶│   {study}/   │          │ catalog      │
//! └──────────────┘           │   {series}/  │          └──────────────┘
//!        │                   │   blobs +    │                 ▲
//!        ▼                   │   indexes    │                 │
//! ┌──────────────┐           └──────────────┘                 │
//! │ Encoding     │                  ▲                         │
//! │ Negotiation  │                  │                         │
//! └──────────────┘                  │                         │
//!        │                          │                         │
//!        ▼                          │                         │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Retrieve     │──────────▶│ Blob /       │                │
//! │ Orchestrator │           │ Metadata     │                │
//! └──────────────┘           │ Stores       │                │
//!        │                   └──────────────┘                │
//!        ▼                                                    │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Item Stream  │           │ Instance     │────────────────┘
//! │ (lazy)       │           │ Catalog      │
//! └──────────────┘           └──────────────┘
//! ```

pub mod blob_store;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod identifiers;
pub mod metadata_store;
pub mod negotiate;
pub mod retrieve;
pub mod transcode;

pub use blob_store::{BlobFile, BlobStore, ByteStream, FileProperties, S3BlobStore};
pub use catalog::{InstanceCatalog, SchemaVersion, SqlInstanceCatalog};
pub use config::Config;
pub use error::{Result, RetrieveError};
pub use identifiers::{
    FrameRange, InstanceIdentifier, InstanceMetadata, InstanceProperties, ResourceType,
    VersionedInstanceIdentifier,
};
pub use metadata_store::{MetadataStore, S3MetadataStore};
pub use negotiate::{AcceptedEncoding, Negotiation, TargetEncoding};
pub use retrieve::{
    BillingContext, InstanceStream, RetrieveRequest, RetrieveResponse, RetrieveService,
    RetrievedInstance,
};
pub use transcode::{FrameExtractor, Transcoder};
