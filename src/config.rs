use crate::catalog::SchemaVersion;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the retrieve service core.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Catalog database configuration
    pub database: DatabaseConfig,
    /// Blob storage configuration
    pub blob: BlobConfig,
    /// Retrieval behavior configuration
    #[serde(default)]
    pub retrieve: RetrieveConfig,
}

/// Catalog database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Schema version the catalog is currently written at
    #[serde(default = "default_schema_version")]
    pub schema_version: SchemaVersion,
}

/// Blob storage (S3-compatible) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Bucket holding instance blobs and their metadata documents
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix inside the bucket
    pub prefix: Option<String>,
}

/// Retrieval behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveConfig {
    /// Ceiling on whole-object transfers for transcoding or frame parsing,
    /// in bytes. Objects larger than this are rejected before any byte is
    /// transferred.
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    /// Capacity of the instance-metadata cache (entries)
    #[serde(default = "default_instance_cache_capacity")]
    pub instance_cache_capacity: usize,
    /// TTL for instance-metadata cache entries in seconds
    #[serde(default = "default_instance_cache_ttl_secs")]
    pub instance_cache_ttl_secs: u64,
    /// Capacity of the frame-index cache (entries). Entries are keyed by
    /// watermark and immutable, so no TTL applies.
    #[serde(default = "default_frames_cache_capacity")]
    pub frames_cache_capacity: usize,
}

// Default value functions

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_schema_version() -> SchemaVersion {
    SchemaVersion::V2
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_download_bytes() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_instance_cache_capacity() -> usize {
    2048
}

fn default_instance_cache_ttl_secs() -> u64 {
    60
}

fn default_frames_cache_capacity() -> usize {
    1024
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            max_download_bytes: default_max_download_bytes(),
            instance_cache_capacity: default_instance_cache_capacity(),
            instance_cache_ttl_secs: default_instance_cache_ttl_secs(),
            frames_cache_capacity: default_frames_cache_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/retrieve").required(false))
            .add_source(config::File::with_name("/etc/imaging/retrieve").required(false))
            // Override with environment variables
            // RETRIEVE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("RETRIEVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    /// Get instance cache TTL as Duration
    pub fn instance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.retrieve.instance_cache_ttl_secs)
    }
}
