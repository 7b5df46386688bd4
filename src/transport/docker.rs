//! The `docker://` transport for images in a container registry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use imgcopy_oci::manifest::{
    DOCKER_V2_LIST, DOCKER_V2_SCHEMA1, DOCKER_V2_SCHEMA1_SIGNED, DOCKER_V2_SCHEMA2, OCI_INDEX,
    OCI_MANIFEST,
};
use imgcopy_oci::{BlobInfo, Digest, ImageRef, LayerCompression, RegistryClient, RegistryOptions};

use crate::blobinfocache::{BlobInfoCache, CandidateLocationsOptions, LocationScope};
use crate::error::{Error, Result, ResultExt};
use crate::signature::Signature;
use crate::types::{
    BlobChunkAccessor, BlobReader, ImageDestination, ImageReference, ImageSource,
    ImageSourceChunk, PutBlobOptions, ReusedBlob, SystemContext, TryReusingBlobOptions,
    UploadedBlob,
};

pub const TRANSPORT_NAME: &str = "docker";

/// Manifest types requested from registries, most preferred first.
const ACCEPTED_MANIFEST_TYPES: [&str; 6] = [
    OCI_MANIFEST,
    DOCKER_V2_SCHEMA2,
    DOCKER_V2_SCHEMA1_SIGNED,
    DOCKER_V2_SCHEMA1,
    DOCKER_V2_LIST,
    OCI_INDEX,
];

#[derive(Debug, Clone)]
pub struct DockerReference {
    r: ImageRef,
}

impl DockerReference {
    /// Parse `//NAME[:TAG][@DIGEST]`.
    pub fn parse(reference: &str) -> Result<Self> {
        let Some(name) = reference.strip_prefix("//") else {
            return Err(Error::Config(format!(
                "docker: image reference {:?} does not start with \"//\"",
                reference
            )));
        };
        Ok(Self {
            r: ImageRef::parse(name)?,
        })
    }

    pub fn image_ref(&self) -> &ImageRef {
        &self.r
    }

    fn client(&self, ctx: &SystemContext) -> Result<RegistryClient> {
        Ok(RegistryClient::new(RegistryOptions {
            credentials: ctx.registry_credentials.clone(),
            insecure: ctx.registry_insecure,
            user_agent: ctx.user_agent.clone(),
        })?)
    }
}

/// Cache scope for blobs of `r`'s repository.
fn location_scope(r: &ImageRef) -> LocationScope {
    LocationScope {
        transport: TRANSPORT_NAME.to_string(),
        scope: r.name(),
    }
}

#[async_trait]
impl ImageReference for DockerReference {
    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn string_within_transport(&self) -> String {
        format!("//{}", self.r)
    }

    fn docker_reference(&self) -> Option<ImageRef> {
        Some(self.r.clone())
    }

    fn policy_configuration_identity(&self) -> String {
        self.r.to_string()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        self.r.policy_namespaces()
    }

    async fn new_image_source(&self, ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(DockerSource {
            r: self.r.clone(),
            client: self.client(ctx)?,
        }))
    }

    async fn new_image_destination(
        &self,
        ctx: &SystemContext,
    ) -> Result<Box<dyn ImageDestination>> {
        Ok(Box::new(DockerDestination {
            r: Arc::new(self.r.clone()),
            client: self.client(ctx)?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub struct DockerSource {
    r: ImageRef,
    client: RegistryClient,
}

#[async_trait]
impl BlobChunkAccessor for DockerSource {
    async fn get_blob_at(
        &self,
        info: &BlobInfo,
        chunks: &[ImageSourceChunk],
    ) -> Result<Vec<BlobReader>> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Internal("reading a blob with unknown digest".into()))?;
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let stream = self
                .client
                .get_blob_range(&self.r, digest, chunk.offset, chunk.length)
                .await?;
            out.push(stream);
        }
        Ok(out)
    }
}

#[async_trait]
impl ImageSource for DockerSource {
    fn reference_name(&self) -> String {
        format!("{}://{}", TRANSPORT_NAME, self.r)
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let reference = match instance {
            Some(d) => d.to_string(),
            None => self.r.reference(),
        };
        Ok(self
            .client
            .get_manifest(&self.r, &reference, &ACCEPTED_MANIFEST_TYPES)
            .await
            .with_context(|| format!("reading manifest {} in {}", reference, self.r.name()))?)
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        cache: &dyn BlobInfoCache,
    ) -> Result<(BlobReader, Option<u64>)> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Internal("reading a blob with unknown digest".into()))?;
        let (stream, size) = self.client.get_blob(&self.r, digest).await?;
        cache.record_known_location(&location_scope(&self.r), digest, &self.r.name());
        Ok((stream, size))
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }

    fn supports_get_blob_at(&self) -> bool {
        true
    }

    async fn get_signatures(&self, _instance: Option<&Digest>) -> Result<Vec<Signature>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

pub struct DockerDestination {
    r: Arc<ImageRef>,
    client: RegistryClient,
}

impl DockerDestination {
    async fn blob_exists(&self, digest: &Digest) -> Result<Option<u64>> {
        Ok(self
            .client
            .blob_exists(&self.r, digest)
            .await
            .with_context(|| format!("checking whether blob {} exists in {}", digest, self.r.name()))?)
    }

    /// The first cached candidate for `primary` still present in this
    /// repository. `digest` is the blob originally asked for.
    async fn reuse_candidate(
        &self,
        scope: &LocationScope,
        digest: &Digest,
        primary: &Digest,
        options: &TryReusingBlobOptions<'_>,
        matched_by_toc_digest: bool,
    ) -> Result<Option<ReusedBlob>> {
        let candidates = options.cache.candidate_locations(
            scope,
            primary,
            &CandidateLocationsOptions {
                can_substitute: options.can_substitute,
                conditions: options.conditions.clone(),
                include_unknown_locations: false,
            },
        );
        for candidate in candidates {
            if candidate.digest == *digest && (matched_by_toc_digest || !options.original_candidate_matches()) {
                continue;
            }
            // Mounting from other repositories is not attempted.
            if candidate.location.as_deref() != Some(self.r.name().as_str()) {
                continue;
            }
            let Some(size) = self.blob_exists(&candidate.digest).await? else {
                debug!(digest = %candidate.digest, "cached location no longer has the blob");
                continue;
            };
            debug!(digest = %candidate.digest, original = %digest, matched_by_toc_digest, "reusing blob");
            return Ok(Some(ReusedBlob {
                digest: candidate.digest,
                size: Some(size),
                compression_operation: candidate.compression_operation,
                compression_algorithm: candidate.compression_algorithm,
                compression_annotations: candidate.compression_annotations,
                matched_by_toc_digest,
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl ImageDestination for DockerDestination {
    fn reference_name(&self) -> String {
        format!("{}://{}", TRANSPORT_NAME, self.r)
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        ACCEPTED_MANIFEST_TYPES.iter().map(|s| s.to_string()).collect()
    }

    fn supports_signatures(&self) -> Result<()> {
        Err(Error::Unsupported(
            "Storing signatures in a container registry is not supported".into(),
        ))
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::Compress
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        true
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        false
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        true
    }

    async fn put_blob(
        &self,
        stream: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &BlobInfo,
        options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob> {
        let (digest, size) = self.client.upload_blob(&self.r, stream).await?;
        if let Some(expected) = info.size {
            if expected != size {
                return Err(Error::Transport(format!(
                    "Size mismatch when copying {}, expected {}, got {}",
                    info.digest_label(),
                    expected,
                    size
                )));
            }
        }
        options
            .cache
            .record_known_location(&location_scope(&self.r), &digest, &self.r.name());
        Ok(UploadedBlob { digest, size })
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions<'_>,
    ) -> Result<Option<ReusedBlob>> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Internal("Can not check for a blob with unknown digest".into()))?;
        let scope = location_scope(&self.r);

        if options.original_candidate_matches() {
            if let Some(size) = self.blob_exists(digest).await? {
                options
                    .cache
                    .record_known_location(&scope, digest, &self.r.name());
                return Ok(Some(ReusedBlob::exact(digest.clone(), Some(size))));
            }
        }

        if let Some(reused) = self.reuse_candidate(&scope, digest, digest, options, false).await? {
            return Ok(Some(reused));
        }
        // Blobs with the same TOC have the same uncompressed content, so any
        // known compressed form of that content will do.
        if options.can_substitute {
            if let Some(toc) = &options.toc_digest {
                if let Some(uncompressed) = options.cache.uncompressed_digest_for_toc(toc) {
                    debug!(%toc, %uncompressed, "looking for blobs with the same TOC");
                    return self
                        .reuse_candidate(&scope, digest, &uncompressed, options, true)
                        .await;
                }
            }
        }
        Ok(None)
    }

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<()> {
        let reference = match instance {
            Some(d) => d.to_string(),
            None => self.r.reference(),
        };
        let mime_type = imgcopy_oci::manifest::guess_mime_type(manifest);
        self.client
            .put_manifest(&self.r, &reference, manifest, &mime_type)
            .await?;
        Ok(())
    }

    async fn put_signatures(
        &self,
        signatures: &[Signature],
        _instance: Option<&Digest>,
    ) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        self.supports_signatures()
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_double_slash() {
        assert!(DockerReference::parse("busybox").is_err());
        let r = DockerReference::parse("//quay.io/a/b:1").unwrap();
        assert_eq!(r.string_within_transport(), "//quay.io/a/b:1");
        assert_eq!(r.policy_configuration_identity(), "quay.io/a/b:1");
        assert_eq!(
            r.policy_configuration_namespaces(),
            vec!["quay.io/a/b", "quay.io/a", "quay.io"]
        );
    }

    #[tokio::test]
    async fn same_toc_finds_other_compressions_of_the_layer() {
        use crate::blobinfocache::{DigestCompressorData, MemoryCache, UNKNOWN_COMPRESSION};
        use httpmock::prelude::*;
        use httpmock::Method::HEAD;

        let server = MockServer::start_async().await;
        let requested = Digest::from_bytes(b"zstd:chunked layer");
        let gzipped = Digest::from_bytes(b"gzip layer");
        let uncompressed = Digest::from_bytes(b"layer");
        let toc = Digest::from_bytes(b"toc");
        let missing = server
            .mock_async(|when, then| {
                when.method(HEAD)
                    .path(format!("/v2/lib/app/blobs/{}", requested));
                then.status(404);
            })
            .await;
        let present = server
            .mock_async(|when, then| {
                when.method(HEAD).path(format!("/v2/lib/app/blobs/{}", gzipped));
                then.status(200).header("content-length", "42");
            })
            .await;

        let r = DockerReference::parse(&format!("//127.0.0.1:{}/lib/app:1.0", server.port())).unwrap();
        let dest = r.new_image_destination(&SystemContext::default()).await.unwrap();
        let cache = MemoryCache::new();
        cache.record_toc_uncompressed_pair(&toc, &uncompressed);
        cache.record_digest_uncompressed_pair(&gzipped, &uncompressed);
        cache.record_digest_compressor_data(
            &gzipped,
            DigestCompressorData {
                base_variant_compressor: "gzip".into(),
                specific_variant_compressor: UNKNOWN_COMPRESSION.into(),
                specific_variant_annotations: Default::default(),
            },
        );
        cache.record_known_location(&location_scope(&r.r), &gzipped, &r.r.name());

        let info = BlobInfo::new(requested.clone(), Some(100), imgcopy_oci::manifest::OCI_LAYER_ZSTD);
        let mut options = TryReusingBlobOptions {
            cache: &cache,
            can_substitute: true,
            empty_layer: false,
            layer_index: Some(0),
            src_ref: None,
            toc_digest: Some(toc),
            conditions: Default::default(),
            original_compression: Some(imgcopy_oci::Algorithm::ZstdChunked),
        };
        let reused = dest.try_reusing_blob(&info, &options).await.unwrap().unwrap();
        assert_eq!(reused.digest, gzipped);
        assert!(reused.matched_by_toc_digest);
        assert_eq!(reused.compression_algorithm, Some(imgcopy_oci::Algorithm::Gzip));
        missing.assert_async().await;
        present.assert_async().await;

        options.can_substitute = false;
        assert!(dest.try_reusing_blob(&info, &options).await.unwrap().is_none());
    }

    #[test]
    fn scope_is_repository() {
        let r = ImageRef::parse("localhost:5000/x/y:1").unwrap();
        assert_eq!(location_scope(&r).scope, "localhost:5000/x/y");
    }
}
