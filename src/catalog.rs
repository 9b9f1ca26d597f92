//! Versioned instance catalog.
//!
//! Resolves (partition key, study, series, instance) to the matching stored
//! instances with their properties. The storage schema evolves over time; old
//! rows must stay readable, so the lookup is a chain of version-tagged
//! readers. The base reader implements the oldest supported shape; each later
//! version overrides only the column list and row mapping that changed,
//! delegating the shared scoping and ordering to the base. Every version
//! preserves the contract: ascending by SOP instance UID then watermark, at
//! most one row (the current watermark) per logical instance.

use crate::config::DatabaseConfig;
use crate::identifiers::{
    InstanceIdentifier, InstanceMetadata, InstanceProperties, ResourceType,
    VersionedInstanceIdentifier,
};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::debug;

/// Catalog lookup errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no matching instances")]
    NotFound,

    #[error("catalog query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Supported catalog schema generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// Base shape: identifiers and watermark only. Predates encoding
    /// recording, so properties come back unknown.
    V1,
    /// Adds `transfer_syntax_uid` and `has_frame_metadata` columns.
    V2,
}

/// Lookup into the instance catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceCatalog: Send + Sync {
    /// Resolve the addressed resource to its current stored instances,
    /// ordered ascending by SOP instance UID then watermark. Fails with
    /// `NotFound` when nothing matches.
    async fn lookup<'a>(
        &self,
        resource: ResourceType,
        partition_key: i32,
        study_instance_uid: &'a str,
        series_instance_uid: Option<&'a str>,
        sop_instance_uid: Option<&'a str>,
    ) -> CatalogResult<Vec<InstanceMetadata>>;
}

struct LookupScope<'a> {
    partition_key: i32,
    study_instance_uid: &'a str,
    series_instance_uid: Option<&'a str>,
    sop_instance_uid: Option<&'a str>,
}

/// Rows whose watermark is the current one carry this status; rows being
/// written or tombstoned are never returned.
const STATUS_CREATED: i16 = 1;

/// Base reader for the oldest supported schema shape.
struct V1Reader;

impl V1Reader {
    const COLUMNS: &'static str =
        "study_instance_uid, series_instance_uid, sop_instance_uid, watermark";

    /// Build the versioned lookup statement. Scoping, status filtering,
    /// current-watermark selection, and ordering are shared by every schema
    /// version; only the column list varies.
    fn select_sql(&self, columns: &str, scope: &LookupScope<'_>) -> String {
        let mut sql = format!(
            "SELECT DISTINCT ON (sop_instance_uid) {columns} \
             FROM instance \
             WHERE partition_key = $1 AND study_instance_uid = $2"
        );

        let mut param = 2;
        if scope.series_instance_uid.is_some() {
            param += 1;
            sql.push_str(&format!(" AND series_instance_uid = ${}", param));
        }
        if scope.sop_instance_uid.is_some() {
            param += 1;
            sql.push_str(&format!(" AND sop_instance_uid = ${}", param));
        }

        sql.push_str(&format!(" AND status = {}", STATUS_CREATED));
        sql.push_str(" ORDER BY sop_instance_uid ASC, watermark DESC");
        sql
    }

    async fn lookup(
        &self,
        pool: &PgPool,
        scope: &LookupScope<'_>,
    ) -> Result<Vec<InstanceMetadata>, sqlx::Error> {
        let sql = self.select_sql(Self::COLUMNS, scope);
        let rows: Vec<V1Row> = bind_scope(sqlx::query_as(&sql), scope).fetch_all(pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_metadata(scope.partition_key))
            .collect())
    }
}

/// Reader for the generation that records the original transfer syntax and
/// whether a frame index was written. Reuses the base statement builder for
/// everything but the column list and row mapping.
struct V2Reader {
    base: V1Reader,
}

impl V2Reader {
    const COLUMNS: &'static str = "study_instance_uid, series_instance_uid, sop_instance_uid, \
         watermark, transfer_syntax_uid, has_frame_metadata";

    async fn lookup(
        &self,
        pool: &PgPool,
        scope: &LookupScope<'_>,
    ) -> Result<Vec<InstanceMetadata>, sqlx::Error> {
        let sql = self.base.select_sql(Self::COLUMNS, scope);
        let rows: Vec<V2Row> = bind_scope(sqlx::query_as(&sql), scope).fetch_all(pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_metadata(scope.partition_key))
            .collect())
    }
}

fn bind_scope<'q, O>(
    query: sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    scope: &LookupScope<'_>,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    let mut query = query
        .bind(scope.partition_key)
        .bind(scope.study_instance_uid.to_string());
    if let Some(series) = scope.series_instance_uid {
        query = query.bind(series.to_string());
    }
    if let Some(sop) = scope.sop_instance_uid {
        query = query.bind(sop.to_string());
    }
    query
}

#[derive(FromRow)]
struct V1Row {
    study_instance_uid: String,
    series_instance_uid: String,
    sop_instance_uid: String,
    watermark: i64,
}

impl V1Row {
    fn into_metadata(self, partition_key: i32) -> InstanceMetadata {
        InstanceMetadata {
            version_id: VersionedInstanceIdentifier::new(
                InstanceIdentifier::new(
                    partition_key,
                    self.study_instance_uid,
                    self.series_instance_uid,
                    self.sop_instance_uid,
                ),
                self.watermark,
            ),
            // Rows of this generation predate encoding recording.
            properties: InstanceProperties::default(),
        }
    }
}

#[derive(FromRow)]
struct V2Row {
    study_instance_uid: String,
    series_instance_uid: String,
    sop_instance_uid: String,
    watermark: i64,
    transfer_syntax_uid: Option<String>,
    has_frame_metadata: bool,
}

impl V2Row {
    fn into_metadata(self, partition_key: i32) -> InstanceMetadata {
        InstanceMetadata {
            version_id: VersionedInstanceIdentifier::new(
                InstanceIdentifier::new(
                    partition_key,
                    self.study_instance_uid,
                    self.series_instance_uid,
                    self.sop_instance_uid,
                ),
                self.watermark,
            ),
            properties: InstanceProperties {
                transfer_syntax_uid: self
                    .transfer_syntax_uid
                    .filter(|syntax| !syntax.trim().is_empty()),
                has_frame_metadata: self.has_frame_metadata,
            },
        }
    }
}

/// Catalog over Postgres, dispatching to the reader for the schema version
/// currently active.
pub struct SqlInstanceCatalog {
    pool: PgPool,
    version: SchemaVersion,
}

impl SqlInstanceCatalog {
    pub fn new(pool: PgPool, version: SchemaVersion) -> Self {
        Self { pool, version }
    }

    /// Connect a pool with the configured limits and timeouts.
    pub async fn connect(config: &DatabaseConfig) -> CatalogResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(std::time::Duration::from_secs(
                config.idle_timeout_secs,
            )))
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool, config.schema_version))
    }
}

#[async_trait]
impl InstanceCatalog for SqlInstanceCatalog {
    async fn lookup<'a>(
        &self,
        resource: ResourceType,
        partition_key: i32,
        study_instance_uid: &'a str,
        series_instance_uid: Option<&'a str>,
        sop_instance_uid: Option<&'a str>,
    ) -> CatalogResult<Vec<InstanceMetadata>> {
        debug!(
            ?resource,
            partition_key,
            study_instance_uid,
            schema_version = ?self.version,
            "catalog lookup"
        );

        let scope = LookupScope {
            partition_key,
            study_instance_uid,
            series_instance_uid,
            sop_instance_uid,
        };

        let instances = match self.version {
            SchemaVersion::V1 => V1Reader.lookup(&self.pool, &scope).await?,
            SchemaVersion::V2 => {
                V2Reader { base: V1Reader }
                    .lookup(&self.pool, &scope)
                    .await?
            }
        };

        if instances.is_empty() {
            return Err(CatalogError::NotFound);
        }
        Ok(instances)
    }
}
