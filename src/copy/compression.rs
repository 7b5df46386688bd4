//! Compression stages of the blob pipeline and the cache records they allow.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use imgcopy_oci::compression::toc_digest;
use imgcopy_oci::manifest::{
    DOCKER_V2_SCHEMA2_LAYER, DOCKER_V2_SCHEMA2_LAYER_ZSTD, OCI_LAYER_GZIP, OCI_LAYER_ZSTD,
};
use imgcopy_oci::{Algorithm, BlobInfo, LayerCompression};

use crate::blobinfocache::{BlobInfoCache, DigestCompressorData, UNCOMPRESSED, UNKNOWN_COMPRESSION};
use crate::compression::{compressor, decompressor, detect_compression, SharedAnnotations};
use crate::encryption::is_encrypted_media_type;
use crate::error::{Error, Result, ResultExt};
use crate::types::BlobReader;

use super::single::ImageCopier;

/// Used when the destination wants compressed layers and nobody said how.
pub(super) const DEFAULT_COMPRESSION_FORMAT: Algorithm = Algorithm::Gzip;

/// The algorithm a layer MIME type says its blob is compressed with.
fn expected_base_compression(media_type: &str) -> Option<Algorithm> {
    match media_type {
        OCI_LAYER_GZIP | DOCKER_V2_SCHEMA2_LAYER => Some(Algorithm::Gzip),
        OCI_LAYER_ZSTD | DOCKER_V2_SCHEMA2_LAYER_ZSTD => Some(Algorithm::Zstd),
        _ => None,
    }
}

/// What the pipeline found out about the incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DetectedCompression {
    /// `None` if uncompressed.
    pub algorithm: Option<Algorithm>,
    /// Compressor name to record for the source blob.
    pub src_compressor_base_variant_name: String,
}

/// Identify the compression of `reader`. zstd with a TOC annotation is
/// reported as zstd:chunked. `src_info` is used for messages and the TOC.
pub(super) async fn detect_compression_step(
    reader: BlobReader,
    stream_info: &BlobInfo,
    src_info: &BlobInfo,
) -> Result<(BlobReader, DetectedCompression)> {
    let (mut algorithm, reader) = detect_compression(reader)
        .await
        .with_context(|| format!("reading blob {}", src_info.digest_label()))?;
    if algorithm == Some(Algorithm::Zstd) && toc_digest(&src_info.annotations)?.is_some() {
        algorithm = Some(Algorithm::ZstdChunked);
    }
    let src_compressor_base_variant_name = match algorithm {
        Some(a) => a.base_variant_name().to_string(),
        None => UNCOMPRESSED.to_string(),
    };
    if let (Some(expected), Some(found)) = (expected_base_compression(&stream_info.media_type), algorithm) {
        if expected.name() != found.base_variant_name() {
            debug!(
                digest = %src_info.digest_label(),
                media_type = %src_info.media_type,
                expected = expected.name(),
                found = found.name(),
                "blob compression does not match its MIME type"
            );
        }
    }
    Ok((
        reader,
        DetectedCompression {
            algorithm,
            src_compressor_base_variant_name,
        },
    ))
}

/// The transformation applied to one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressionStepOp {
    /// Compression is not applicable, e.g. the blob is encrypted.
    PreserveOpaque,
    PreserveCompressed,
    PreserveUncompressed,
    CompressUncompressed,
    RecompressCompressed,
    DecompressCompressed,
}

/// Choose the step for a blob, first match wins.
pub(crate) fn choose_compression_step(
    can_modify_blob: bool,
    change_supported: bool,
    encrypted: bool,
    desired: LayerCompression,
    detected: Option<Algorithm>,
    requested: Option<Algorithm>,
) -> CompressionStepOp {
    if can_modify_blob && change_supported {
        if encrypted {
            return CompressionStepOp::PreserveOpaque;
        }
        match (desired, detected) {
            (LayerCompression::Compress, None) => return CompressionStepOp::CompressUncompressed,
            (LayerCompression::Compress, Some(found)) => {
                if let Some(wanted) = requested {
                    if wanted.name() != found.name() && wanted.name() != found.base_variant_name() {
                        return CompressionStepOp::RecompressCompressed;
                    }
                }
            }
            (LayerCompression::Decompress, Some(_)) => return CompressionStepOp::DecompressCompressed,
            _ => {}
        }
    }
    if !change_supported {
        CompressionStepOp::PreserveOpaque
    } else if detected.is_some() {
        CompressionStepOp::PreserveCompressed
    } else {
        CompressionStepOp::PreserveUncompressed
    }
}

/// The outcome of the compression stage, applied to the uploaded blob's
/// metadata once the upload is done.
pub(super) struct CompressionStep {
    pub operation: CompressionStepOp,
    uploaded_operation: LayerCompression,
    uploaded_algorithm: Option<Algorithm>,
    /// Filled by the compressor; only complete once the stream was drained.
    uploaded_annotations: Option<SharedAnnotations>,
    src_compressor_base_variant_name: String,
    uploaded_compressor_base_variant_name: String,
    uploaded_compressor_specific_variant_name: String,
}

fn specific_variant_name(algorithm: Algorithm) -> String {
    if algorithm.name() == algorithm.base_variant_name() {
        UNKNOWN_COMPRESSION.to_string()
    } else {
        algorithm.name().to_string()
    }
}

impl ImageCopier<'_, '_> {
    /// Insert the compression stage into the pipeline. A transformed stream
    /// gets a fresh `stream_info`: digest, size and annotations no longer apply.
    pub(super) fn compression_step(
        &self,
        reader: BlobReader,
        stream_info: &mut BlobInfo,
        can_modify_blob: bool,
        src_info: &BlobInfo,
        detected: &DetectedCompression,
    ) -> Result<(BlobReader, CompressionStep)> {
        let change_supported = self.src.can_change_layer_compression(&stream_info.media_type);
        if !change_supported {
            debug!(
                digest = %src_info.digest_label(),
                media_type = %stream_info.media_type,
                "compression change for blob not supported"
            );
        }
        let op = choose_compression_step(
            can_modify_blob,
            change_supported,
            is_encrypted_media_type(&stream_info.media_type),
            self.c.dest.desired_layer_compression(),
            detected.algorithm,
            self.compression_format,
        );
        let src_name = detected.src_compressor_base_variant_name.clone();

        let compress_to = |algorithm: Algorithm, input: BlobReader, stream_info: &mut BlobInfo| {
            let annotations: SharedAnnotations = Arc::new(Mutex::new(BTreeMap::new()));
            let reader = compressor(algorithm, self.compression_level, input, annotations.clone())?;
            *stream_info = BlobInfo::default();
            Ok::<_, Error>((reader, annotations))
        };

        Ok(match op {
            CompressionStepOp::PreserveOpaque if change_supported => {
                debug!("Using original blob without modification for encrypted blob");
                (
                    reader,
                    CompressionStep {
                        operation: op,
                        uploaded_operation: LayerCompression::PreserveOriginal,
                        uploaded_algorithm: None,
                        uploaded_annotations: None,
                        src_compressor_base_variant_name: UNKNOWN_COMPRESSION.to_string(),
                        uploaded_compressor_base_variant_name: UNKNOWN_COMPRESSION.to_string(),
                        uploaded_compressor_specific_variant_name: UNKNOWN_COMPRESSION.to_string(),
                    },
                )
            }
            CompressionStepOp::CompressUncompressed => {
                debug!("Compressing blob on the fly");
                let algorithm = self.compression_format.unwrap_or(DEFAULT_COMPRESSION_FORMAT);
                let (reader, annotations) = compress_to(algorithm, reader, stream_info)?;
                (
                    reader,
                    CompressionStep {
                        operation: op,
                        uploaded_operation: LayerCompression::Compress,
                        uploaded_algorithm: Some(algorithm),
                        uploaded_annotations: Some(annotations),
                        src_compressor_base_variant_name: src_name,
                        uploaded_compressor_base_variant_name: algorithm.base_variant_name().to_string(),
                        uploaded_compressor_specific_variant_name: specific_variant_name(algorithm),
                    },
                )
            }
            CompressionStepOp::RecompressCompressed => {
                debug!("Blob will be converted");
                let (Some(found), Some(algorithm)) = (detected.algorithm, self.compression_format) else {
                    return Err(Error::Internal("recompressing without a known compression".into()));
                };
                let decompressed = decompressor(found, reader);
                let (reader, annotations) = compress_to(algorithm, decompressed, stream_info)?;
                (
                    reader,
                    CompressionStep {
                        operation: op,
                        uploaded_operation: LayerCompression::PreserveOriginal,
                        uploaded_algorithm: Some(algorithm),
                        uploaded_annotations: Some(annotations),
                        src_compressor_base_variant_name: src_name,
                        uploaded_compressor_base_variant_name: algorithm.base_variant_name().to_string(),
                        uploaded_compressor_specific_variant_name: specific_variant_name(algorithm),
                    },
                )
            }
            CompressionStepOp::DecompressCompressed => {
                debug!("Blob will be decompressed");
                let Some(found) = detected.algorithm else {
                    return Err(Error::Internal("decompressing an uncompressed blob".into()));
                };
                let reader = decompressor(found, reader);
                *stream_info = BlobInfo::default();
                (
                    reader,
                    CompressionStep {
                        operation: op,
                        uploaded_operation: LayerCompression::Decompress,
                        uploaded_algorithm: None,
                        uploaded_annotations: None,
                        src_compressor_base_variant_name: src_name,
                        uploaded_compressor_base_variant_name: UNCOMPRESSED.to_string(),
                        uploaded_compressor_specific_variant_name: UNKNOWN_COMPRESSION.to_string(),
                    },
                )
            }
            CompressionStepOp::PreserveOpaque
            | CompressionStepOp::PreserveCompressed
            | CompressionStepOp::PreserveUncompressed => {
                debug!("Using original blob without modification");
                let (uploaded_operation, uploaded_algorithm) = match op {
                    CompressionStepOp::PreserveCompressed => {
                        (LayerCompression::PreserveOriginal, detected.algorithm)
                    }
                    CompressionStepOp::PreserveUncompressed => (LayerCompression::Decompress, None),
                    _ => (LayerCompression::PreserveOriginal, None),
                };
                // Only the base variant is recorded: the TOC was not checked
                // against the blob digest.
                (
                    reader,
                    CompressionStep {
                        operation: op,
                        uploaded_operation,
                        uploaded_algorithm,
                        uploaded_annotations: None,
                        uploaded_compressor_base_variant_name: src_name.clone(),
                        src_compressor_base_variant_name: src_name,
                        uploaded_compressor_specific_variant_name: UNKNOWN_COMPRESSION.to_string(),
                    },
                )
            }
        })
    }
}

impl CompressionStep {
    fn annotations(&self) -> BTreeMap<String, String> {
        match &self.uploaded_annotations {
            Some(a) => a.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            None => BTreeMap::new(),
        }
    }

    /// Set the compression edit of the uploaded blob.
    pub fn update_compression_edits(&self, info: &mut BlobInfo) {
        info.compression_operation = self.uploaded_operation;
        info.compression_algorithm = self.uploaded_algorithm;
        info.annotations.extend(self.annotations());
    }

    /// Record what this copy proved about `uploaded` and `src` in the cache.
    /// Only call this when the source digest was verified by our own reading.
    pub fn record_validated_digest_data(
        &self,
        cache: &dyn BlobInfoCache,
        uploaded: &BlobInfo,
        src: &BlobInfo,
        encrypting: bool,
        decrypting: bool,
    ) -> Result<()> {
        let (Some(uploaded_digest), Some(src_digest)) = (&uploaded.digest, &src.digest) else {
            return Err(Error::Internal(
                "recording cache data for a blob with unknown digest".into(),
            ));
        };
        let annotations = self.annotations();
        // Nothing involving encrypted data is recorded.
        if !encrypting && !decrypting {
            match self.operation {
                CompressionStepOp::PreserveOpaque => {}
                CompressionStepOp::CompressUncompressed => {
                    cache.record_digest_uncompressed_pair(uploaded_digest, src_digest);
                    let toc = toc_digest(&annotations)
                        .context("parsing just-created compression annotations")?;
                    if let Some(toc) = toc {
                        cache.record_toc_uncompressed_pair(&toc, src_digest);
                    }
                }
                CompressionStepOp::DecompressCompressed => {
                    cache.record_digest_uncompressed_pair(src_digest, uploaded_digest);
                }
                // The uncompressed digest of either blob is unknown.
                CompressionStepOp::RecompressCompressed | CompressionStepOp::PreserveCompressed => {}
                CompressionStepOp::PreserveUncompressed => {
                    cache.record_digest_uncompressed_pair(src_digest, src_digest);
                }
            }
        }
        if self.src_compressor_base_variant_name.is_empty()
            || self.uploaded_compressor_base_variant_name.is_empty()
            || self.uploaded_compressor_specific_variant_name.is_empty()
        {
            return Err(Error::Internal(format!(
                "missing compressor names (src base: {:?}, uploaded base: {:?}, uploaded specific: {:?})",
                self.src_compressor_base_variant_name,
                self.uploaded_compressor_base_variant_name,
                self.uploaded_compressor_specific_variant_name
            )));
        }
        if self.uploaded_compressor_base_variant_name != UNKNOWN_COMPRESSION {
            cache.record_digest_compressor_data(
                uploaded_digest,
                DigestCompressorData {
                    base_variant_compressor: self.uploaded_compressor_base_variant_name.clone(),
                    specific_variant_compressor: self.uploaded_compressor_specific_variant_name.clone(),
                    specific_variant_annotations: annotations,
                },
            );
        }
        if src_digest != uploaded_digest && self.src_compressor_base_variant_name != UNKNOWN_COMPRESSION {
            // A TOC in the source was never verified; record the base variant only.
            cache.record_digest_compressor_data(
                src_digest,
                DigestCompressorData {
                    base_variant_compressor: self.src_compressor_base_variant_name.clone(),
                    specific_variant_compressor: UNKNOWN_COMPRESSION.to_string(),
                    specific_variant_annotations: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }
}

/// The compression edit implied by a layer's MIME type, for source layers
/// that do not say.
pub(super) fn compression_edits_from_blob_info(
    info: &BlobInfo,
) -> Result<(LayerCompression, Option<Algorithm>)> {
    use imgcopy_oci::manifest::{DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED, OCI_LAYER};
    Ok(match info.media_type.as_str() {
        DOCKER_V2_SCHEMA2_LAYER | OCI_LAYER_GZIP => {
            (LayerCompression::PreserveOriginal, Some(Algorithm::Gzip))
        }
        OCI_LAYER_ZSTD => match toc_digest(&info.annotations)? {
            Some(_) => (LayerCompression::PreserveOriginal, Some(Algorithm::ZstdChunked)),
            None => (LayerCompression::PreserveOriginal, Some(Algorithm::Zstd)),
        },
        DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED | OCI_LAYER => (LayerCompression::Decompress, None),
        _ => (LayerCompression::PreserveOriginal, None),
    })
}
