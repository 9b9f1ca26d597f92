use serde::{Deserialize, Serialize};

/// Kind of resource addressed by a retrieve request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    /// Every instance in a study.
    Study,
    /// Every instance in a series.
    Series,
    /// A single instance.
    Instance,
    /// Specific frames of a single instance.
    Frames,
}

/// Logical address of an instance: tenant partition plus the three-level
/// study / series / SOP instance hierarchy. Identifies the object regardless
/// of how many stored versions exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentifier {
    pub partition_key: i32,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
}

impl InstanceIdentifier {
    pub fn new(
        partition_key: i32,
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            partition_key,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: series_instance_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
        }
    }

    /// Deterministic cache key for metadata lookups by logical identity.
    /// Stable across watermarks, so "current metadata" lookups hit before the
    /// watermark is known.
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.partition_key,
            self.study_instance_uid,
            self.series_instance_uid,
            self.sop_instance_uid
        )
    }
}

/// One physical stored blob: a logical identifier pinned to the watermark
/// assigned at store time. Higher watermark means a more recent write of the
/// same logical instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedInstanceIdentifier {
    pub identifier: InstanceIdentifier,
    pub watermark: i64,
}

impl VersionedInstanceIdentifier {
    pub fn new(identifier: InstanceIdentifier, watermark: i64) -> Self {
        Self {
            identifier,
            watermark,
        }
    }
}

/// What is known about a stored instance's encoding. `transfer_syntax_uid` is
/// `None` for rows written before the encoding was recorded at store time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceProperties {
    pub transfer_syntax_uid: Option<String>,
    pub has_frame_metadata: bool,
}

/// A catalog row: one stored version paired with its properties. Immutable
/// once read for a given watermark; a later write creates a new watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub version_id: VersionedInstanceIdentifier,
    pub properties: InstanceProperties,
}

/// Location of one frame's payload inside a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub offset: u64,
    pub length: u64,
}

impl FrameRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}
