//! Retrieval orchestration.
//!
//! Composes the catalog, blob and metadata stores, caches, negotiator, and
//! codecs into the retrieval algorithm: negotiate the target encoding, decide
//! which stored representation satisfies the request, decide whether
//! server-side transcoding or a byte-range fast path applies, then stream the
//! result back one item at a time.
//!
//! Ordering is strict: every validation failure (`NotFound`,
//! `NotAcceptable`, `FrameNotFound`, the transfer ceiling) is raised before
//! the returned stream yields its first item. Once streaming begins only I/O
//! faults can surface, as `DataStore` items.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};

use crate::blob_store::{BlobError, BlobStore, ByteStream};
use crate::cache::AsideCache;
use crate::catalog::{CatalogError, InstanceCatalog};
use crate::config::RetrieveConfig;
use crate::error::{Result, RetrieveError};
use crate::identifiers::{
    FrameRange, InstanceIdentifier, InstanceMetadata, InstanceProperties, ResourceType,
    VersionedInstanceIdentifier,
};
use crate::metadata_store::MetadataStore;
use crate::negotiate::{self, AcceptedEncoding, Negotiation, TargetEncoding};
use crate::transcode::{FrameExtractor, Transcoder};

/// A retrieve request as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub resource: ResourceType,
    pub partition_key: i32,
    pub study_instance_uid: String,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    /// Requested frame numbers (1-based). Only meaningful for `Frames`.
    pub frames: Vec<u32>,
    /// Client-accepted encodings, ranked by preference.
    pub accepted: Vec<AcceptedEncoding>,
}

impl RetrieveRequest {
    pub fn for_study(
        partition_key: i32,
        study_instance_uid: impl Into<String>,
        accepted: Vec<AcceptedEncoding>,
    ) -> Self {
        Self {
            resource: ResourceType::Study,
            partition_key,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: None,
            sop_instance_uid: None,
            frames: Vec::new(),
            accepted,
        }
    }

    pub fn for_series(
        partition_key: i32,
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        accepted: Vec<AcceptedEncoding>,
    ) -> Self {
        Self {
            resource: ResourceType::Series,
            partition_key,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: Some(series_instance_uid.into()),
            sop_instance_uid: None,
            frames: Vec::new(),
            accepted,
        }
    }

    pub fn for_instance(
        partition_key: i32,
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        accepted: Vec<AcceptedEncoding>,
    ) -> Self {
        Self {
            resource: ResourceType::Instance,
            partition_key,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: Some(series_instance_uid.into()),
            sop_instance_uid: Some(sop_instance_uid.into()),
            frames: Vec::new(),
            accepted,
        }
    }

    pub fn for_frames(
        partition_key: i32,
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        frames: Vec<u32>,
        accepted: Vec<AcceptedEncoding>,
    ) -> Self {
        Self {
            resource: ResourceType::Frames,
            partition_key,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: Some(series_instance_uid.into()),
            sop_instance_uid: Some(sop_instance_uid.into()),
            frames,
            accepted,
        }
    }
}

/// One unit of output: a payload stream with its declared encoding and
/// length.
pub struct RetrievedInstance {
    pub stream: ByteStream,
    pub transfer_syntax_uid: String,
    pub content_length: u64,
}

/// Single-pass lazy sequence of result items. Enumerating it triggers
/// storage I/O per item.
pub type InstanceStream = Pin<Box<dyn Stream<Item = Result<RetrievedInstance>> + Send>>;

/// The orchestrator's output: a lazy item sequence plus the negotiated
/// response framing.
pub struct RetrieveResponse {
    pub instances: InstanceStream,
    pub media_type: String,
    pub is_single_part: bool,
}

/// Per-request metering side channel. The orchestrator records the bytes fed
/// to the transcoder whenever transcoding occurs; the calling layer reads it
/// after the response is consumed. One per request, never process-wide.
#[derive(Debug, Default)]
pub struct BillingContext {
    transcode_requested: AtomicBool,
    bytes_transcoded: AtomicU64,
}

impl BillingContext {
    pub fn record_transcode(&self, bytes: u64) {
        self.transcode_requested.store(true, Ordering::Relaxed);
        self.bytes_transcoded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transcode_requested(&self) -> bool {
        self.transcode_requested.load(Ordering::Relaxed)
    }

    pub fn bytes_transcoded(&self) -> u64 {
        self.bytes_transcoded.load(Ordering::Relaxed)
    }
}

/// Decide whether the stored representation must be re-encoded to satisfy
/// the negotiated target. Serving the original bytes always satisfies an
/// original-encoding request; otherwise transcode whenever the stored
/// encoding is unknown or differs from the target.
fn needs_transcoding(target: &TargetEncoding, properties: &InstanceProperties) -> bool {
    match target {
        TargetEncoding::Original { .. } => false,
        TargetEncoding::Transcode(syntax) => match &properties.transfer_syntax_uid {
            Some(stored) => !negotiate::transfer_syntax_matches(stored, syntax),
            None => true,
        },
    }
}

/// The transfer syntax declared on an emitted item. When the original
/// encoding was requested but the stored row predates encoding recording,
/// the caller's requested token is echoed verbatim; that token may be the
/// non-concrete wildcard, a deliberate compatibility allowance for legacy
/// rows.
fn effective_transfer_syntax(target: &TargetEncoding, properties: &InstanceProperties) -> String {
    match target {
        TargetEncoding::Original { requested } => properties
            .transfer_syntax_uid
            .clone()
            .unwrap_or_else(|| requested.clone()),
        TargetEncoding::Transcode(syntax) => syntax.clone(),
    }
}

/// Request UIDs carried into fault logs for diagnostic correlation.
#[derive(Debug, Clone)]
struct RequestUids {
    study: String,
    series: String,
    sop: String,
}

impl RequestUids {
    fn of(request: &RetrieveRequest) -> Self {
        Self {
            study: request.study_instance_uid.clone(),
            series: request.series_instance_uid.clone().unwrap_or_default(),
            sop: request.sop_instance_uid.clone().unwrap_or_default(),
        }
    }

    /// Convert a store error, logging storage faults with the request UIDs
    /// before re-raising them unchanged.
    fn fault(&self, err: impl Into<RetrieveError>) -> RetrieveError {
        let err = err.into();
        if let RetrieveError::DataStore(fault) = &err {
            error!(
                study_instance_uid = %self.study,
                series_instance_uid = %self.series,
                sop_instance_uid = %self.sop,
                error = %fault,
                "storage operation failed"
            );
        }
        err
    }
}

/// Run a storage future, aborting promptly on cancellation. `None` means the
/// request was cancelled and production should simply stop.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}

fn bytes_stream(bytes: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(std::future::ready(Ok::<_, BlobError>(bytes))))
}

fn empty_response(negotiation: Negotiation) -> RetrieveResponse {
    RetrieveResponse {
        instances: Box::pin(futures::stream::empty()),
        media_type: negotiation.media_type,
        is_single_part: negotiation.is_single_part,
    }
}

/// The top-level retrieval component.
pub struct RetrieveService<C, B, M, T, F> {
    catalog: Arc<C>,
    blobs: Arc<B>,
    metadata: Arc<M>,
    transcoder: Arc<T>,
    extractor: Arc<F>,
    /// Current instance metadata by logical identity, shared across requests.
    instance_cache: AsideCache<String, InstanceMetadata>,
    /// Frame index by watermark. Watermarks are immutable, so no TTL.
    frames_cache: AsideCache<i64, Arc<BTreeMap<u32, FrameRange>>>,
    max_download_bytes: u64,
}

impl<C, B, M, T, F> RetrieveService<C, B, M, T, F>
where
    C: InstanceCatalog,
    B: BlobStore + 'static,
    M: MetadataStore,
    T: Transcoder + 'static,
    F: FrameExtractor,
{
    pub fn new(
        catalog: Arc<C>,
        blobs: Arc<B>,
        metadata: Arc<M>,
        transcoder: Arc<T>,
        extractor: Arc<F>,
        config: &RetrieveConfig,
    ) -> Self {
        Self {
            catalog,
            blobs,
            metadata,
            transcoder,
            extractor,
            instance_cache: AsideCache::new(
                "instance_metadata",
                config.instance_cache_capacity,
                Some(Duration::from_secs(config.instance_cache_ttl_secs)),
            ),
            frames_cache: AsideCache::new("frames_range", config.frames_cache_capacity, None),
            max_download_bytes: config.max_download_bytes,
        }
    }

    /// Serve one retrieve request. All validation happens here; the returned
    /// stream performs only I/O.
    #[instrument(
        skip(self, request, billing, cancel),
        fields(
            resource = ?request.resource,
            partition_key = request.partition_key,
            study_instance_uid = %request.study_instance_uid,
        )
    )]
    pub async fn retrieve(
        &self,
        request: RetrieveRequest,
        billing: Arc<BillingContext>,
        cancel: CancellationToken,
    ) -> Result<RetrieveResponse> {
        let negotiation = negotiate::resolve(request.resource, &request.accepted)?;
        match request.resource {
            ResourceType::Frames => {
                self.retrieve_frames(request, negotiation, billing, cancel)
                    .await
            }
            _ => {
                self.retrieve_instances(request, negotiation, billing, cancel)
                    .await
            }
        }
    }

    async fn retrieve_instances(
        &self,
        request: RetrieveRequest,
        negotiation: Negotiation,
        billing: Arc<BillingContext>,
        cancel: CancellationToken,
    ) -> Result<RetrieveResponse> {
        let uids = RequestUids::of(&request);
        let instances = self
            .catalog
            .lookup(
                request.resource,
                request.partition_key,
                &request.study_instance_uid,
                request.series_instance_uid.as_deref(),
                request.sop_instance_uid.as_deref(),
            )
            .await
            .map_err(|e| uids.fault(e))?;

        let Some(first) = instances.first() else {
            return Err(RetrieveError::NotFound);
        };
        let transcode = needs_transcoding(&negotiation.target, &first.properties);

        // Each instance may carry a different native encoding, and
        // per-instance transcoding inside one multipart response is not
        // supported.
        if instances.len() > 1 && !negotiation.target.is_original() {
            return Err(RetrieveError::NotAcceptable(
                "multiple instances matched; request the original transfer syntax".to_string(),
            ));
        }

        let Negotiation {
            target,
            media_type,
            is_single_part,
        } = negotiation;

        let blobs = Arc::clone(&self.blobs);
        let stream: InstanceStream = if let (true, TargetEncoding::Transcode(target_syntax)) =
            (transcode, target.clone())
        {
            let Some(instance) = instances.into_iter().next() else {
                return Err(RetrieveError::NotFound);
            };

            // The ceiling is validated before the stream exists so the
            // NotAcceptable surfaces from this call, not mid-stream.
            if self
                .ensure_within_limit(&instance.version_id, &uids, &cancel)
                .await?
                .is_none()
            {
                return Ok(empty_response(Negotiation {
                    target,
                    media_type,
                    is_single_part,
                }));
            }

            let transcoder = Arc::clone(&self.transcoder);
            Box::pin(try_stream! {
                let Some(fetched) = cancellable(&cancel, blobs.get_file(&instance.version_id)).await else {
                    return;
                };
                let file = fetched.map_err(|e| uids.fault(e))?;
                let Some(collected) = collect_body(file.stream, &cancel).await else {
                    return;
                };
                let object = collected.map_err(|e| uids.fault(e))?;
                let original_len = object.len() as u64;

                let Some(transcoded) = cancellable(&cancel, transcoder.transcode(object, &target_syntax)).await else {
                    return;
                };
                let transcoded = transcoded?;
                billing.record_transcode(original_len);
                metrics::counter!("retrieve.transcoded.bytes").increment(original_len);

                yield RetrievedInstance {
                    content_length: transcoded.len() as u64,
                    transfer_syntax_uid: target_syntax.clone(),
                    stream: bytes_stream(transcoded),
                };
            })
        } else {
            let target = target.clone();
            let uids = uids.clone();
            Box::pin(try_stream! {
                for instance in instances {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Some(fetched) = cancellable(&cancel, blobs.get_file(&instance.version_id)).await else {
                        return;
                    };
                    let file = fetched.map_err(|e| uids.fault(e))?;
                    yield RetrievedInstance {
                        content_length: file.content_length,
                        transfer_syntax_uid: effective_transfer_syntax(&target, &instance.properties),
                        stream: file.stream,
                    };
                }
            })
        };

        Ok(RetrieveResponse {
            instances: stream,
            media_type,
            is_single_part,
        })
    }

    async fn retrieve_frames(
        &self,
        request: RetrieveRequest,
        negotiation: Negotiation,
        billing: Arc<BillingContext>,
        cancel: CancellationToken,
    ) -> Result<RetrieveResponse> {
        let uids = RequestUids::of(&request);
        let (Some(series), Some(sop)) = (
            request.series_instance_uid.clone(),
            request.sop_instance_uid.clone(),
        ) else {
            // A frame request without a full instance address matches nothing.
            return Err(RetrieveError::NotFound);
        };
        let identifier = InstanceIdentifier::new(
            request.partition_key,
            request.study_instance_uid.clone(),
            series,
            sop,
        );

        let catalog = Arc::clone(&self.catalog);
        let instance = self
            .instance_cache
            .get_or_populate(identifier.cache_key(), identifier, |id| async move {
                let instances = catalog
                    .lookup(
                        ResourceType::Instance,
                        id.partition_key,
                        &id.study_instance_uid,
                        Some(&id.series_instance_uid),
                        Some(&id.sop_instance_uid),
                    )
                    .await?;
                instances.into_iter().next().ok_or(CatalogError::NotFound)
            })
            .await
            .map_err(|e| uids.fault(e))?;

        let transcode = needs_transcoding(&negotiation.target, &instance.properties);

        if !transcode && instance.properties.has_frame_metadata {
            self.frames_fast_path(request.frames, instance, negotiation, uids, cancel)
                .await
        } else {
            self.frames_slow_path(
                request.frames,
                instance,
                negotiation,
                transcode,
                billing,
                uids,
                cancel,
            )
            .await
        }
    }

    /// Serve frames as independent byte-range reads, without downloading or
    /// parsing the whole object.
    async fn frames_fast_path(
        &self,
        frames: Vec<u32>,
        instance: InstanceMetadata,
        negotiation: Negotiation,
        uids: RequestUids,
        cancel: CancellationToken,
    ) -> Result<RetrieveResponse> {
        let version = instance.version_id.clone();
        let metadata = Arc::clone(&self.metadata);
        let index = self
            .frames_cache
            .get_or_populate(version.watermark, version.clone(), |v| async move {
                metadata.get_frames_range(&v).await.map(Arc::new)
            })
            .await
            .map_err(|e| uids.fault(e))?;

        // All-or-nothing: every requested frame must exist in the index
        // before any output is produced.
        let missing: Vec<u32> = frames
            .iter()
            .copied()
            .filter(|number| !index.contains_key(number))
            .collect();
        if !missing.is_empty() {
            return Err(RetrieveError::FrameNotFound(missing));
        }

        let syntax = effective_transfer_syntax(&negotiation.target, &instance.properties);
        let blobs = Arc::clone(&self.blobs);
        let stream: InstanceStream = Box::pin(try_stream! {
            for number in frames {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(range) = index.get(&number).copied() else {
                    return;
                };
                let Some(fetched) = cancellable(&cancel, blobs.get_file_frame(&version, range)).await else {
                    return;
                };
                let body = fetched.map_err(|e| uids.fault(e))?;
                yield RetrievedInstance {
                    content_length: range.length,
                    transfer_syntax_uid: syntax.clone(),
                    stream: body,
                };
            }
        });

        Ok(RetrieveResponse {
            instances: stream,
            media_type: negotiation.media_type,
            is_single_part: negotiation.is_single_part,
        })
    }

    /// Download and parse the whole object, then emit the extracted frame
    /// payloads. Used when transcoding is needed or no frame index exists.
    #[allow(clippy::too_many_arguments)]
    async fn frames_slow_path(
        &self,
        frames: Vec<u32>,
        instance: InstanceMetadata,
        negotiation: Negotiation,
        transcode: bool,
        billing: Arc<BillingContext>,
        uids: RequestUids,
        cancel: CancellationToken,
    ) -> Result<RetrieveResponse> {
        if self
            .ensure_within_limit(&instance.version_id, &uids, &cancel)
            .await?
            .is_none()
        {
            return Ok(empty_response(negotiation));
        }

        let Some(fetched) = cancellable(&cancel, self.blobs.get_file(&instance.version_id)).await
        else {
            return Ok(empty_response(negotiation));
        };
        let file = fetched.map_err(|e| uids.fault(e))?;
        let Some(collected) = collect_body(file.stream, &cancel).await else {
            return Ok(empty_response(negotiation));
        };
        let object = collected.map_err(|e| uids.fault(e))?;
        let object_len = object.len() as u64;

        let (original_requested, token) = match &negotiation.target {
            TargetEncoding::Original { requested } => (true, requested.clone()),
            TargetEncoding::Transcode(syntax) => (false, syntax.clone()),
        };

        // The extractor validates the requested numbers itself and fails
        // FrameNotFound before anything is emitted.
        let payloads = self
            .extractor
            .extract(object, &frames, original_requested, &token)
            .await?;

        // Billed only once the recode actually happened; a failed extraction
        // performed no transcoding.
        if transcode {
            billing.record_transcode(object_len);
            metrics::counter!("retrieve.transcoded.bytes").increment(object_len);
        }

        let syntax = effective_transfer_syntax(&negotiation.target, &instance.properties);
        let items: Vec<Result<RetrievedInstance>> = payloads
            .into_iter()
            .map(|payload| {
                Ok(RetrievedInstance {
                    content_length: payload.len() as u64,
                    transfer_syntax_uid: syntax.clone(),
                    stream: bytes_stream(payload),
                })
            })
            .collect();

        Ok(RetrieveResponse {
            instances: Box::pin(futures::stream::iter(items)),
            media_type: negotiation.media_type,
            is_single_part: negotiation.is_single_part,
        })
    }

    /// Enforce the whole-object transfer ceiling from a HEAD lookup, before
    /// any byte of the object is transferred. `None` means cancelled.
    async fn ensure_within_limit(
        &self,
        version: &VersionedInstanceIdentifier,
        uids: &RequestUids,
        cancel: &CancellationToken,
    ) -> Result<Option<()>> {
        let Some(fetched) = cancellable(cancel, self.blobs.get_file_properties(version)).await
        else {
            return Ok(None);
        };
        let properties = fetched.map_err(|e| uids.fault(e))?;
        if properties.content_length > self.max_download_bytes {
            return Err(RetrieveError::NotAcceptable(format!(
                "object is {} bytes, exceeding the {} byte transfer limit",
                properties.content_length, self.max_download_bytes
            )));
        }
        Ok(Some(()))
    }
}

/// Collect a body stream into memory. `None` means cancelled mid-read.
async fn collect_body(
    mut stream: ByteStream,
    cancel: &CancellationToken,
) -> Option<std::result::Result<Bytes, BlobError>> {
    let mut buffer = BytesMut::new();
    loop {
        let chunk = cancellable(cancel, stream.next()).await?;
        match chunk {
            Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
            Some(Err(err)) => return Some(Err(err)),
            None => return Some(Ok(buffer.freeze())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobFile, FileProperties, MockBlobStore};
    use crate::catalog::MockInstanceCatalog;
    use crate::metadata_store::{MetadataError, MockMetadataStore};
    use crate::negotiate::{
        AcceptedEncoding, EXPLICIT_VR_LITTLE_ENDIAN, JPEG_2000_LOSSLESS, JPEG_BASELINE,
    };
    use crate::transcode::{MockFrameExtractor, MockTranscoder};

    type TestService = RetrieveService<
        MockInstanceCatalog,
        MockBlobStore,
        MockMetadataStore,
        MockTranscoder,
        MockFrameExtractor,
    >;

    const STUDY: &str = "1.2.840.1";
    const SERIES: &str = "1.2.840.2";
    const SOP: &str = "1.2.840.3";

    fn service(
        catalog: MockInstanceCatalog,
        blobs: MockBlobStore,
        metadata: MockMetadataStore,
        transcoder: MockTranscoder,
        extractor: MockFrameExtractor,
    ) -> TestService {
        service_with_config(
            catalog,
            blobs,
            metadata,
            transcoder,
            extractor,
            RetrieveConfig::default(),
        )
    }

    fn service_with_config(
        catalog: MockInstanceCatalog,
        blobs: MockBlobStore,
        metadata: MockMetadataStore,
        transcoder: MockTranscoder,
        extractor: MockFrameExtractor,
        config: RetrieveConfig,
    ) -> TestService {
        RetrieveService::new(
            Arc::new(catalog),
            Arc::new(blobs),
            Arc::new(metadata),
            Arc::new(transcoder),
            Arc::new(extractor),
            &config,
        )
    }

    fn instance_metadata(
        watermark: i64,
        syntax: Option<&str>,
        has_frame_metadata: bool,
    ) -> InstanceMetadata {
        InstanceMetadata {
            version_id: VersionedInstanceIdentifier::new(
                InstanceIdentifier::new(1, STUDY, SERIES, SOP),
                watermark,
            ),
            properties: InstanceProperties {
                transfer_syntax_uid: syntax.map(str::to_string),
                has_frame_metadata,
            },
        }
    }

    fn file_of(bytes: &Bytes) -> BlobFile {
        BlobFile {
            content_length: bytes.len() as u64,
            stream: bytes_stream(bytes.clone()),
        }
    }

    async fn retrieve(
        service: &TestService,
        request: RetrieveRequest,
        billing: &Arc<BillingContext>,
    ) -> Result<RetrieveResponse> {
        service
            .retrieve(request, Arc::clone(billing), CancellationToken::new())
            .await
    }

    /// Drain the response into (transfer syntax, payload) pairs.
    async fn collect_items(mut response: RetrieveResponse) -> Vec<(String, Bytes)> {
        let mut items = Vec::new();
        while let Some(item) = response.instances.next().await {
            let item = item.expect("stream item");
            let mut payload = BytesMut::new();
            let mut body = item.stream;
            while let Some(chunk) = body.next().await {
                payload.extend_from_slice(&chunk.expect("body chunk"));
            }
            assert_eq!(item.content_length, payload.len() as u64);
            items.push((item.transfer_syntax_uid, payload.freeze()));
        }
        items
    }

    #[test]
    fn test_needs_transcoding_truth_table() {
        let original = TargetEncoding::Original {
            requested: "*".to_string(),
        };
        let target = TargetEncoding::Transcode(EXPLICIT_VR_LITTLE_ENDIAN.to_string());

        let matching = InstanceProperties {
            transfer_syntax_uid: Some(EXPLICIT_VR_LITTLE_ENDIAN.to_string()),
            has_frame_metadata: false,
        };
        let differing = InstanceProperties {
            transfer_syntax_uid: Some(JPEG_BASELINE.to_string()),
            has_frame_metadata: false,
        };
        let unknown = InstanceProperties::default();

        assert!(!needs_transcoding(&target, &matching));
        assert!(needs_transcoding(&target, &differing));
        assert!(needs_transcoding(&target, &unknown));
        // Original always serves stored bytes as-is.
        assert!(!needs_transcoding(&original, &matching));
        assert!(!needs_transcoding(&original, &differing));
        assert!(!needs_transcoding(&original, &unknown));
    }

    #[test]
    fn test_effective_syntax_legacy_fallback_is_verbatim() {
        let original = TargetEncoding::Original {
            requested: "*".to_string(),
        };
        assert_eq!(
            effective_transfer_syntax(&original, &InstanceProperties::default()),
            "*"
        );
        let recorded = InstanceProperties {
            transfer_syntax_uid: Some(JPEG_BASELINE.to_string()),
            has_frame_metadata: false,
        };
        assert_eq!(effective_transfer_syntax(&original, &recorded), JPEG_BASELINE);
    }

    #[tokio::test]
    async fn test_instance_original_passthrough() {
        // End-to-end scenario A: stored explicit little endian, original
        // requested: one item, recorded syntax, no billing signal.
        let object = Bytes::from_static(b"dicom-object-bytes");
        let meta = instance_metadata(5, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);

        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .times(1)
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut blobs = MockBlobStore::new();
        let body = object.clone();
        blobs
            .expect_get_file()
            .times(1)
            .returning(move |_| Ok(file_of(&body)));

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_instance(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![AcceptedEncoding::original()],
        );

        let response = retrieve(&service, request, &billing).await.unwrap();
        assert!(response.is_single_part);
        let items = collect_items(response).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(items[0].1, object);
        assert!(!billing.transcode_requested());
        assert_eq!(billing.bytes_transcoded(), 0);
    }

    #[tokio::test]
    async fn test_instance_transcoded_sets_billing() {
        // End-to-end scenario B: different accepted syntax forces a
        // transcode and sets the billing signal.
        let object = Bytes::from_static(b"original-bytes-little-endian");
        let transcoded = Bytes::from_static(b"jpeg");
        let meta = instance_metadata(5, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);

        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut blobs = MockBlobStore::new();
        let len = object.len() as u64;
        blobs
            .expect_get_file_properties()
            .times(1)
            .returning(move |_| Ok(FileProperties { content_length: len }));
        let body = object.clone();
        blobs
            .expect_get_file()
            .times(1)
            .returning(move |_| Ok(file_of(&body)));

        let mut transcoder = MockTranscoder::new();
        let out = transcoded.clone();
        transcoder
            .expect_transcode()
            .withf(|_, syntax| syntax == JPEG_BASELINE)
            .times(1)
            .returning(move |_, _| Ok(out.clone()));

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            transcoder,
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_instance(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![AcceptedEncoding::transfer_syntax(JPEG_BASELINE)],
        );

        let response = retrieve(&service, request, &billing).await.unwrap();
        let items = collect_items(response).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, JPEG_BASELINE);
        assert_eq!(items[0].1, transcoded);
        assert!(billing.transcode_requested());
        assert_eq!(billing.bytes_transcoded(), object.len() as u64);
    }

    #[tokio::test]
    async fn test_legacy_instance_echoes_requested_token() {
        // End-to-end scenario C: stored encoding unknown, original requested,
        // the item's syntax is the caller's token verbatim.
        let object = Bytes::from_static(b"legacy-object");
        let meta = instance_metadata(2, None, false);

        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));
        let mut blobs = MockBlobStore::new();
        let body = object.clone();
        blobs
            .expect_get_file()
            .returning(move |_| Ok(file_of(&body)));

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_instance(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![AcceptedEncoding::original()],
        );

        let items = collect_items(retrieve(&service, request, &billing).await.unwrap()).await;
        assert_eq!(items[0].0, "*");
        assert!(!billing.transcode_requested());
    }

    #[tokio::test]
    async fn test_multi_instance_with_target_syntax_is_not_acceptable() {
        // Even when no instance would actually need transcoding.
        let mut catalog = MockInstanceCatalog::new();
        catalog.expect_lookup().returning(move |_, _, _, _, _| {
            let mut a = instance_metadata(1, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
            a.version_id.identifier.sop_instance_uid = "1.2.840.3.1".to_string();
            let b = instance_metadata(2, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
            Ok(vec![a, b])
        });

        let service = service(
            catalog,
            MockBlobStore::new(),
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_series(
            1,
            STUDY,
            SERIES,
            vec![AcceptedEncoding::transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)],
        );

        let result = retrieve(&service, request, &billing).await;
        assert!(matches!(result, Err(RetrieveError::NotAcceptable(_))));
    }

    #[tokio::test]
    async fn test_multi_instance_original_streams_every_instance() {
        let first = Bytes::from_static(b"first");
        let second = Bytes::from_static(b"second");

        let mut catalog = MockInstanceCatalog::new();
        catalog.expect_lookup().returning(move |_, _, _, _, _| {
            let mut a = instance_metadata(1, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
            a.version_id.identifier.sop_instance_uid = "1.2.840.3.1".to_string();
            let b = instance_metadata(2, Some(JPEG_2000_LOSSLESS), false);
            Ok(vec![a, b])
        });

        let mut blobs = MockBlobStore::new();
        let bodies = [first.clone(), second.clone()];
        blobs.expect_get_file().times(2).returning(move |version| {
            let body = &bodies[(version.watermark - 1) as usize];
            Ok(file_of(body))
        });

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request =
            RetrieveRequest::for_study(1, STUDY, vec![AcceptedEncoding::original()]);

        let response = retrieve(&service, request, &billing).await.unwrap();
        assert!(!response.is_single_part);
        let items = collect_items(response).await;
        assert_eq!(items.len(), 2);
        // Per-item syntax reflects each instance's own recorded encoding.
        assert_eq!(items[0].0, EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(items[1].0, JPEG_2000_LOSSLESS);
        assert_eq!(items[0].1, first);
        assert_eq!(items[1].1, second);
    }

    #[tokio::test]
    async fn test_not_found_propagates() {
        let mut catalog = MockInstanceCatalog::new();
        catalog
            .expect_lookup()
            .returning(|_, _, _, _, _| Err(CatalogError::NotFound));

        let service = service(
            catalog,
            MockBlobStore::new(),
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request =
            RetrieveRequest::for_study(1, STUDY, vec![AcceptedEncoding::original()]);

        let result = retrieve(&service, request, &billing).await;
        assert!(matches!(result, Err(RetrieveError::NotFound)));
    }

    #[tokio::test]
    async fn test_size_ceiling_rejected_before_any_transfer() {
        let meta = instance_metadata(5, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut blobs = MockBlobStore::new();
        blobs
            .expect_get_file_properties()
            .times(1)
            .returning(|_| Ok(FileProperties { content_length: 1_000 }));
        // The body fetch must never be issued.
        blobs.expect_get_file().times(0);

        let service = service_with_config(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
            RetrieveConfig {
                max_download_bytes: 100,
                ..RetrieveConfig::default()
            },
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_instance(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![AcceptedEncoding::transfer_syntax(JPEG_BASELINE)],
        );

        let result = retrieve(&service, request, &billing).await;
        assert!(matches!(result, Err(RetrieveError::NotAcceptable(_))));
        assert!(!billing.transcode_requested());
    }

    fn frame_index() -> BTreeMap<u32, FrameRange> {
        let mut index = BTreeMap::new();
        index.insert(1, FrameRange::new(0, 4));
        index.insert(2, FrameRange::new(4, 4));
        index.insert(3, FrameRange::new(8, 4));
        index.insert(4, FrameRange::new(12, 4));
        index
    }

    #[tokio::test]
    async fn test_missing_frames_fail_eagerly_with_no_output() {
        let meta = instance_metadata(7, Some(EXPLICIT_VR_LITTLE_ENDIAN), true);
        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_get_frames_range()
            .returning(|_| Ok(frame_index()));

        let mut blobs = MockBlobStore::new();
        // Eager validation fails before any range read is issued.
        blobs.expect_get_file_frame().times(0);

        let service = service(
            catalog,
            blobs,
            metadata,
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_frames(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![2, 5],
            vec![AcceptedEncoding::original()],
        );

        let result = retrieve(&service, request, &billing).await;
        match result {
            Err(RetrieveError::FrameNotFound(missing)) => assert_eq!(missing, vec![5]),
            other => panic!("expected FrameNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_fast_and_slow_frame_paths_are_byte_identical() {
        let object = Bytes::from_static(b"AAAABBBBCCCCDDDD");
        let frames = vec![1u32, 3];

        // Fast path: frame index present, independent range reads.
        let fast_meta = instance_metadata(7, Some(EXPLICIT_VR_LITTLE_ENDIAN), true);
        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = fast_meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_get_frames_range()
            .returning(|_| Ok(frame_index()));
        let mut blobs = MockBlobStore::new();
        let ranged = object.clone();
        blobs
            .expect_get_file_frame()
            .times(2)
            .returning(move |_, range| {
                let start = range.offset as usize;
                let end = start + range.length as usize;
                Ok(bytes_stream(ranged.slice(start..end)))
            });
        let fast_service = service(
            catalog,
            blobs,
            metadata,
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );

        // Slow path: no frame index, whole-object parse.
        let slow_meta = instance_metadata(7, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = slow_meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));
        let mut blobs = MockBlobStore::new();
        let len = object.len() as u64;
        blobs
            .expect_get_file_properties()
            .returning(move |_| Ok(FileProperties { content_length: len }));
        let body = object.clone();
        blobs
            .expect_get_file()
            .returning(move |_| Ok(file_of(&body)));
        let mut extractor = MockFrameExtractor::new();
        let parsed = object.clone();
        extractor
            .expect_extract()
            .withf(|_, frames, original, _| *original && *frames == [1, 3])
            .returning(move |_, frames, _, _| {
                let index = frame_index();
                Ok(frames
                    .iter()
                    .map(|number| {
                        let range = index[number];
                        parsed.slice(range.offset as usize..(range.offset + range.length) as usize)
                    })
                    .collect())
            });
        let slow_service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            extractor,
        );

        let billing = Arc::new(BillingContext::default());
        let fast_request = RetrieveRequest::for_frames(
            1,
            STUDY,
            SERIES,
            SOP,
            frames.clone(),
            vec![AcceptedEncoding::original()],
        );
        let slow_request = RetrieveRequest::for_frames(
            1,
            STUDY,
            SERIES,
            SOP,
            frames,
            vec![AcceptedEncoding::original()],
        );

        let fast_items =
            collect_items(retrieve(&fast_service, fast_request, &billing).await.unwrap()).await;
        let slow_items =
            collect_items(retrieve(&slow_service, slow_request, &billing).await.unwrap()).await;

        assert_eq!(fast_items.len(), 2);
        let fast_payloads: Vec<&Bytes> = fast_items.iter().map(|(_, p)| p).collect();
        let slow_payloads: Vec<&Bytes> = slow_items.iter().map(|(_, p)| p).collect();
        assert_eq!(fast_payloads, slow_payloads);
        assert_eq!(*fast_payloads[0], Bytes::from_static(b"AAAA"));
        assert_eq!(*fast_payloads[1], Bytes::from_static(b"CCCC"));
    }

    #[tokio::test]
    async fn test_transcoding_forces_slow_frame_path() {
        // A frame index exists, but a differing target syntax bypasses it.
        let object = Bytes::from_static(b"AAAABBBB");
        let meta = instance_metadata(3, Some(EXPLICIT_VR_LITTLE_ENDIAN), true);

        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut blobs = MockBlobStore::new();
        let len = object.len() as u64;
        blobs
            .expect_get_file_properties()
            .returning(move |_| Ok(FileProperties { content_length: len }));
        let body = object.clone();
        blobs
            .expect_get_file()
            .returning(move |_| Ok(file_of(&body)));
        blobs.expect_get_file_frame().times(0);

        let mut extractor = MockFrameExtractor::new();
        extractor
            .expect_extract()
            .withf(|_, frames, original, syntax| {
                !*original && *frames == [1] && syntax == JPEG_BASELINE
            })
            .returning(|_, _, _, _| Ok(vec![Bytes::from_static(b"recoded")]));

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            extractor,
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_frames(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![1],
            vec![AcceptedEncoding::transfer_syntax(JPEG_BASELINE)],
        );

        let items = collect_items(retrieve(&service, request, &billing).await.unwrap()).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, JPEG_BASELINE);
        assert!(billing.transcode_requested());
        assert_eq!(billing.bytes_transcoded(), object.len() as u64);
    }

    #[tokio::test]
    async fn test_failed_extraction_leaves_billing_unset() {
        // Extraction failed, so no transcoding was performed and nothing
        // may be billed.
        let object = Bytes::from_static(b"AAAABBBB");
        let meta = instance_metadata(3, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);

        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut blobs = MockBlobStore::new();
        let len = object.len() as u64;
        blobs
            .expect_get_file_properties()
            .returning(move |_| Ok(FileProperties { content_length: len }));
        let body = object.clone();
        blobs
            .expect_get_file()
            .returning(move |_| Ok(file_of(&body)));

        let mut extractor = MockFrameExtractor::new();
        extractor
            .expect_extract()
            .returning(|_, _, _, _| Err(RetrieveError::FrameNotFound(vec![9])));

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            extractor,
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_frames(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![9],
            vec![AcceptedEncoding::transfer_syntax(JPEG_BASELINE)],
        );

        let result = retrieve(&service, request, &billing).await;
        assert!(matches!(result, Err(RetrieveError::FrameNotFound(_))));
        assert!(!billing.transcode_requested());
        assert_eq!(billing.bytes_transcoded(), 0);
    }

    #[tokio::test]
    async fn test_instance_metadata_and_frame_index_are_cached() {
        let meta = instance_metadata(7, Some(EXPLICIT_VR_LITTLE_ENDIAN), true);
        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .times(1)
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_get_frames_range()
            .times(1)
            .returning(|_| Ok(frame_index()));

        let mut blobs = MockBlobStore::new();
        blobs
            .expect_get_file_frame()
            .times(2)
            .returning(|_, _| Ok(bytes_stream(Bytes::from_static(b"payl"))));

        let service = service(
            catalog,
            blobs,
            metadata,
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());

        for _ in 0..2 {
            let request = RetrieveRequest::for_frames(
                1,
                STUDY,
                SERIES,
                SOP,
                vec![2],
                vec![AcceptedEncoding::original()],
            );
            let items = collect_items(retrieve(&service, request, &billing).await.unwrap()).await;
            assert_eq!(items.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_frame_index_store_fault_surfaces_as_data_store() {
        let meta = instance_metadata(7, Some(EXPLICIT_VR_LITTLE_ENDIAN), true);
        let mut catalog = MockInstanceCatalog::new();
        let lookup_result = meta.clone();
        catalog
            .expect_lookup()
            .returning(move |_, _, _, _, _| Ok(vec![lookup_result.clone()]));

        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_get_frames_range()
            .returning(|version| Err(MetadataError::IndexNotFound(version.watermark)));

        let service = service(
            catalog,
            MockBlobStore::new(),
            metadata,
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let request = RetrieveRequest::for_frames(
            1,
            STUDY,
            SERIES,
            SOP,
            vec![1],
            vec![AcceptedEncoding::original()],
        );

        let result = retrieve(&service, request, &billing).await;
        assert!(matches!(result, Err(RetrieveError::DataStore(_))));
    }

    #[tokio::test]
    async fn test_cancellation_stops_production() {
        let mut catalog = MockInstanceCatalog::new();
        catalog.expect_lookup().returning(move |_, _, _, _, _| {
            let mut a = instance_metadata(1, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
            a.version_id.identifier.sop_instance_uid = "1.2.840.3.1".to_string();
            let b = instance_metadata(2, Some(EXPLICIT_VR_LITTLE_ENDIAN), false);
            Ok(vec![a, b])
        });

        let mut blobs = MockBlobStore::new();
        blobs
            .expect_get_file()
            .times(1)
            .returning(|_| Ok(file_of(&Bytes::from_static(b"first"))));

        let service = service(
            catalog,
            blobs,
            MockMetadataStore::new(),
            MockTranscoder::new(),
            MockFrameExtractor::new(),
        );
        let billing = Arc::new(BillingContext::default());
        let cancel = CancellationToken::new();
        let request = RetrieveRequest::for_study(1, STUDY, vec![AcceptedEncoding::original()]);

        let mut response = service
            .retrieve(request, Arc::clone(&billing), cancel.clone())
            .await
            .unwrap();

        let first = response.instances.next().await;
        assert!(first.is_some());
        cancel.cancel();
        // Production stops; no second fetch is issued.
        assert!(response.instances.next().await.is_none());
    }
}
