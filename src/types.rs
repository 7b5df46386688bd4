//! Capability interfaces of image sources, destinations and references.
//!
//! The copy engine only talks to these traits; `transport` holds the
//! concrete backends.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use imgcopy_oci::manifest::ReuseConditions;
use imgcopy_oci::{Algorithm, BlobInfo, Credentials, Digest, ImageRef, LayerCompression};

use crate::blobinfocache::BlobInfoCache;
use crate::error::{Error, Result};
use crate::signature::Signature;

/// An owned, readable blob body.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Settings shared by transports and the engine.
#[derive(Debug, Clone, Default)]
pub struct SystemContext {
    /// Override the host architecture when choosing list instances.
    pub architecture_choice: Option<String>,
    pub os_choice: Option<String>,
    pub variant_choice: Option<String>,

    pub registry_credentials: Option<Credentials>,
    /// Talk plain HTTP to every registry.
    pub registry_insecure: bool,
    pub user_agent: Option<String>,

    /// `dir:` destinations compress layers.
    pub dir_force_compress: bool,
    /// `dir:` destinations decompress layers.
    pub dir_force_decompress: bool,

    /// Compression used when layers are (re)compressed for the destination.
    pub compression_format: Option<Algorithm>,
    pub compression_level: Option<i32>,
}

/// A transport-specific image name.
#[async_trait]
pub trait ImageReference: Send + Sync + fmt::Debug {
    fn transport_name(&self) -> &'static str;

    fn string_within_transport(&self) -> String;

    /// The registry reference this image is known as, if any.
    fn docker_reference(&self) -> Option<ImageRef> {
        None
    }

    /// The most specific policy scope for this image.
    fn policy_configuration_identity(&self) -> String;

    /// Broader policy scopes, most specific first.
    fn policy_configuration_namespaces(&self) -> Vec<String>;

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>>;

    async fn new_image_destination(&self, ctx: &SystemContext)
        -> Result<Box<dyn ImageDestination>>;
}

impl fmt::Display for dyn ImageReference + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_name(), self.string_within_transport())
    }
}

/// A contiguous byte range within a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSourceChunk {
    pub offset: u64,
    /// `None` reads to the end of the blob.
    pub length: Option<u64>,
}

/// Ranged reads of source blobs.
#[async_trait]
pub trait BlobChunkAccessor: Send + Sync {
    /// One reader per requested chunk, in order.
    async fn get_blob_at(
        &self,
        info: &BlobInfo,
        chunks: &[ImageSourceChunk],
    ) -> Result<Vec<BlobReader>>;
}

#[async_trait]
pub trait ImageSource: BlobChunkAccessor {
    /// For messages.
    fn reference_name(&self) -> String;

    /// The manifest and its MIME type; `instance` selects a list entry.
    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)>;

    /// Open a blob. The size is `None` when the source cannot tell.
    async fn get_blob(
        &self,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<(BlobReader, Option<u64>)>;

    fn has_thread_safe_get_blob(&self) -> bool;

    fn supports_get_blob_at(&self) -> bool {
        false
    }

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Signature>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Extra inputs for [`ImageDestination::put_blob`].
#[derive(Clone, Copy)]
pub struct PutBlobOptions<'a> {
    pub cache: &'a dyn BlobInfoCache,
    pub is_config: bool,
    pub empty_layer: bool,
    /// Position in the manifest's layer list, `None` for configs.
    pub layer_index: Option<usize>,
}

/// Extra inputs for [`ImageDestination::try_reusing_blob`].
#[derive(Clone)]
pub struct TryReusingBlobOptions<'a> {
    pub cache: &'a dyn BlobInfoCache,
    /// Blobs with different digests but the same content may be used.
    pub can_substitute: bool,
    pub empty_layer: bool,
    pub layer_index: Option<usize>,
    pub src_ref: Option<ImageRef>,
    pub toc_digest: Option<Digest>,
    pub conditions: ReuseConditions,
    /// Compression of the blob as found in the source; `None` when it is
    /// uncompressed or unknown.
    pub original_compression: Option<Algorithm>,
}

impl TryReusingBlobOptions<'_> {
    /// Whether the blob exactly as requested satisfies the reuse conditions.
    pub fn original_candidate_matches(&self) -> bool {
        imgcopy_oci::manifest::candidate_compression_matches_reuse_conditions(
            &self.conditions,
            self.original_compression,
        )
    }
}

/// Extra inputs for [`ImageDestination::put_blob_partial`].
#[derive(Clone, Copy)]
pub struct PutBlobPartialOptions<'a> {
    pub cache: &'a dyn BlobInfoCache,
    pub empty_layer: bool,
    pub layer_index: usize,
}

/// A blob as written by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub digest: Digest,
    pub size: u64,
}

/// A blob the destination already had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReusedBlob {
    pub digest: Digest,
    pub size: Option<u64>,
    pub compression_operation: LayerCompression,
    pub compression_algorithm: Option<Algorithm>,
    /// Annotations describing the reused blob's compression (e.g. a TOC).
    pub compression_annotations: BTreeMap<String, String>,
    /// The blob was found through its TOC digest, not its full digest.
    pub matched_by_toc_digest: bool,
}

impl ReusedBlob {
    pub fn exact(digest: Digest, size: Option<u64>) -> Self {
        Self {
            digest,
            size,
            compression_operation: LayerCompression::PreserveOriginal,
            compression_algorithm: None,
            compression_annotations: BTreeMap::new(),
            matched_by_toc_digest: false,
        }
    }
}

/// Outcome of a partial pull attempt.
#[derive(Debug)]
pub enum PartialPull {
    Pulled(UploadedBlob),
    /// The destination cannot do it for this blob; copy the full stream.
    FallbackRequested,
}

#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// For messages.
    fn reference_name(&self) -> String;

    /// Manifest MIME types the destination accepts, preferred first. Empty
    /// means any.
    fn supported_manifest_mime_types(&self) -> Vec<String>;

    /// `Err` with the reason when signatures cannot be stored.
    fn supports_signatures(&self) -> Result<()>;

    fn desired_layer_compression(&self) -> LayerCompression;

    fn accepts_foreign_layer_urls(&self) -> bool;

    /// The destination will only run images for the host OS.
    fn must_match_runtime_os(&self) -> bool {
        false
    }

    fn ignores_embedded_docker_reference(&self) -> bool;

    fn has_thread_safe_put_blob(&self) -> bool;

    fn supports_put_blob_partial(&self) -> bool {
        false
    }

    /// Write a blob. `info.digest`/`info.size` are used for verification
    /// when set; the returned values are what was actually written.
    async fn put_blob(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        info: &BlobInfo,
        options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob>;

    async fn put_blob_partial(
        &self,
        _chunks: &dyn BlobChunkAccessor,
        _info: &BlobInfo,
        _options: PutBlobPartialOptions<'_>,
    ) -> Result<PartialPull> {
        Ok(PartialPull::FallbackRequested)
    }

    /// `Some` if a usable copy of the blob is already present.
    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions<'_>,
    ) -> Result<Option<ReusedBlob>>;

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<()>;

    async fn put_signatures(&self, signatures: &[Signature], instance: Option<&Digest>)
        -> Result<()>;

    /// Make everything written so far visible. Not transactional.
    async fn commit(&self) -> Result<()>;
}

/// Whether `dest` can store multi-image manifests.
pub fn supports_multiple_images(dest: &dyn ImageDestination) -> bool {
    let types = dest.supported_manifest_mime_types();
    types.is_empty()
        || types
            .iter()
            .any(|t| imgcopy_oci::manifest::is_multi_image(t))
}

pub(crate) fn unsupported_blob_at(source: &str) -> Error {
    Error::Unsupported(format!("{} does not support ranged blob reads", source))
}
