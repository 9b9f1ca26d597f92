//! Transfer-syntax negotiation.
//!
//! Maps the client's ranked accepted encodings plus the resource type to one
//! target encoding, the response media type, and whether the response must be
//! single-part. Negotiation happens before any storage I/O; failure is
//! `NotAcceptable`.

use crate::error::RetrieveError;
use crate::identifiers::ResourceType;

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";

/// Wildcard token: the caller wants the object in its original encoding.
pub const ANY_TRANSFER_SYNTAX: &str = "*";

pub const MEDIA_TYPE_DICOM: &str = "application/dicom";
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// One entry from the client's accept list, ranked by list order.
#[derive(Debug, Clone, Default)]
pub struct AcceptedEncoding {
    /// Requested media type; `None` accepts the resource's default.
    pub media_type: Option<String>,
    /// Requested transfer syntax; `None` means the descriptor default,
    /// `"*"` means the original stored encoding.
    pub transfer_syntax: Option<String>,
}

impl AcceptedEncoding {
    pub fn transfer_syntax(syntax: impl Into<String>) -> Self {
        Self {
            media_type: None,
            transfer_syntax: Some(syntax.into()),
        }
    }

    pub fn original() -> Self {
        Self::transfer_syntax(ANY_TRANSFER_SYNTAX)
    }
}

/// The negotiated target encoding for the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEncoding {
    /// Serve stored bytes as-is. `requested` keeps the caller's token for the
    /// legacy fallback when the stored encoding was never recorded.
    Original { requested: String },
    /// Re-encode to the given transfer syntax.
    Transcode(String),
}

impl TargetEncoding {
    pub fn is_original(&self) -> bool {
        matches!(self, TargetEncoding::Original { .. })
    }
}

/// Outcome of negotiation.
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub target: TargetEncoding,
    pub media_type: String,
    pub is_single_part: bool,
}

struct Descriptor {
    media_type: &'static str,
    is_single_part: bool,
    default_syntax: &'static str,
    supported: &'static [&'static str],
}

const TRANSCODE_TARGETS: &[&str] = &[
    IMPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN,
    JPEG_BASELINE,
    JPEG_2000_LOSSLESS,
];

fn descriptor(resource: ResourceType) -> Descriptor {
    match resource {
        ResourceType::Study | ResourceType::Series => Descriptor {
            media_type: MEDIA_TYPE_DICOM,
            is_single_part: false,
            default_syntax: EXPLICIT_VR_LITTLE_ENDIAN,
            supported: TRANSCODE_TARGETS,
        },
        ResourceType::Instance => Descriptor {
            media_type: MEDIA_TYPE_DICOM,
            is_single_part: true,
            default_syntax: EXPLICIT_VR_LITTLE_ENDIAN,
            supported: TRANSCODE_TARGETS,
        },
        ResourceType::Frames => Descriptor {
            media_type: MEDIA_TYPE_OCTET_STREAM,
            is_single_part: false,
            default_syntax: EXPLICIT_VR_LITTLE_ENDIAN,
            supported: TRANSCODE_TARGETS,
        },
    }
}

/// Compare transfer syntax UIDs, tolerating surrounding whitespace.
pub fn transfer_syntax_matches(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// Resolve the client's ranked accept list against the resource descriptor.
/// The first acceptable entry wins.
pub fn resolve(
    resource: ResourceType,
    accepted: &[AcceptedEncoding],
) -> Result<Negotiation, RetrieveError> {
    let descriptor = descriptor(resource);

    for encoding in accepted {
        if let Some(media_type) = &encoding.media_type {
            if !media_type.trim().eq_ignore_ascii_case(descriptor.media_type) {
                continue;
            }
        }

        let syntax = encoding
            .transfer_syntax
            .as_deref()
            .map(str::trim)
            .unwrap_or(descriptor.default_syntax);

        if syntax == ANY_TRANSFER_SYNTAX {
            return Ok(Negotiation {
                target: TargetEncoding::Original {
                    requested: syntax.to_string(),
                },
                media_type: descriptor.media_type.to_string(),
                is_single_part: descriptor.is_single_part,
            });
        }

        if descriptor
            .supported
            .iter()
            .any(|supported| transfer_syntax_matches(supported, syntax))
        {
            return Ok(Negotiation {
                target: TargetEncoding::Transcode(syntax.to_string()),
                media_type: descriptor.media_type.to_string(),
                is_single_part: descriptor.is_single_part,
            });
        }
    }

    Err(RetrieveError::NotAcceptable(
        "none of the accepted encodings can be served for this resource".to_string(),
    ))
}
