//! In-memory transport and image builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};

use imgcopy::blobinfocache::BlobInfoCache;
use imgcopy::compression::{compressor, SharedAnnotations};
use imgcopy::error::{Error, Result};
use imgcopy::signature::Signature;
use imgcopy::types::{
    BlobChunkAccessor, BlobReader, ImageDestination, ImageReference, ImageSource, ImageSourceChunk,
    PartialPull, PutBlobOptions, PutBlobPartialOptions, ReusedBlob, SystemContext,
    TryReusingBlobOptions, UploadedBlob,
};
use imgcopy_oci::compression::toc_digest;
use imgcopy_oci::manifest::{
    guess_mime_type, DOCKER_V2_SCHEMA1, OCI_CONFIG, OCI_INDEX, OCI_LAYER_GZIP, OCI_MANIFEST,
};
use imgcopy_oci::{Algorithm, BlobInfo, Digest, LayerCompression};

pub const TRANSPORT_NAME: &str = "memory";

/// How a destination answers partial pulls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartialPullMode {
    #[default]
    Unsupported,
    /// Fetch the blob in two ranges and assemble it.
    Assemble,
    /// Claim support, then ask for the full stream.
    Fallback,
}

/// What an in-memory endpoint claims to support.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Empty means any.
    pub manifest_mime_types: Vec<String>,
    pub desired_layer_compression: LayerCompression,
    pub signatures: bool,
    pub thread_safe: bool,
    /// Time each `put_blob` spends after reading its input, so concurrent
    /// uploads overlap.
    pub put_delay: Duration,
    pub partial_pull: PartialPullMode,
    /// Manifest types refused at upload time even though they are listed
    /// as supported.
    pub rejected_manifest_types: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            manifest_mime_types: Vec::new(),
            desired_layer_compression: LayerCompression::PreserveOriginal,
            signatures: true,
            thread_safe: true,
            put_delay: Duration::ZERO,
            partial_pull: PartialPullMode::Unsupported,
            rejected_manifest_types: Vec::new(),
        }
    }
}

/// Counts of operations performed against a store.
#[derive(Debug, Default)]
pub struct Counters {
    pub get_blob: AtomicUsize,
    pub bytes_served: AtomicUsize,
    pub put_blob: AtomicUsize,
    pub put_manifest: AtomicUsize,
    pub reuse_hits: AtomicUsize,
    pub toc_hits: AtomicUsize,
    pub chunk_reads: AtomicUsize,
    pub partial_pulls: AtomicUsize,
    pub partial_fallbacks: AtomicUsize,
    pub rejected_manifests: AtomicUsize,
    pub commits: AtomicUsize,
    pub uploads: InFlight,
}

/// Tracks how many operations run at once and the highest count seen.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Contents {
    blobs: HashMap<Digest, Vec<u8>>,
    /// TOC digest → digest of a stored layer with that TOC.
    tocs: HashMap<Digest, Digest>,
    /// Keyed by instance digest; `None` is the top-level manifest.
    manifests: HashMap<Option<Digest>, (Vec<u8>, String)>,
    signatures: HashMap<Option<Digest>, Vec<Signature>>,
}

/// One image repository held in memory.
#[derive(Default)]
pub struct Store {
    contents: Mutex<Contents>,
    pub counters: Counters,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_blob(&self, data: Vec<u8>) -> Digest {
        let digest = Digest::from_bytes(&data);
        self.lock().blobs.insert(digest.clone(), data);
        digest
    }

    /// Store a layer and remember it by its TOC digest.
    pub fn add_toc_layer(&self, toc: &Digest, data: Vec<u8>) -> Digest {
        let digest = self.add_blob(data);
        self.lock().tocs.insert(toc.clone(), digest.clone());
        digest
    }

    pub fn layer_by_toc(&self, toc: &Digest) -> Option<Digest> {
        self.lock().tocs.get(toc).cloned()
    }

    /// Flip the last byte of a stored blob, keeping it under its old digest.
    pub fn corrupt_blob(&self, digest: &Digest) {
        let mut contents = self.lock();
        let blob = contents.blobs.get_mut(digest).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
    }

    pub fn set_manifest(&self, instance: Option<Digest>, manifest: Vec<u8>, mime_type: &str) {
        self.lock()
            .manifests
            .insert(instance, (manifest, mime_type.to_string()));
    }

    pub fn set_signatures(&self, instance: Option<Digest>, sigs: Vec<Signature>) {
        self.lock().signatures.insert(instance, sigs);
    }

    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.lock().blobs.get(digest).cloned()
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.lock().blobs.contains_key(digest)
    }

    pub fn manifest(&self, instance: Option<&Digest>) -> Option<(Vec<u8>, String)> {
        self.lock().manifests.get(&instance.cloned()).cloned()
    }

    pub fn signatures(&self, instance: Option<&Digest>) -> Vec<Signature> {
        self.lock()
            .signatures
            .get(&instance.cloned())
            .cloned()
            .unwrap_or_default()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Contents> {
        self.contents.lock().unwrap()
    }
}

pub fn count(c: &AtomicUsize) -> usize {
    c.load(Ordering::SeqCst)
}

/// `memory:NAME` backed by a [`Store`].
#[derive(Clone)]
pub struct MemoryReference {
    pub name: String,
    pub store: Arc<Store>,
    pub caps: Capabilities,
}

impl std::fmt::Debug for MemoryReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReference")
            .field("name", &self.name)
            .finish()
    }
}

impl MemoryReference {
    pub fn new(name: &str, store: Arc<Store>) -> Self {
        Self {
            name: name.to_string(),
            store,
            caps: Capabilities::default(),
        }
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }
}

#[async_trait]
impl ImageReference for MemoryReference {
    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn string_within_transport(&self) -> String {
        self.name.clone()
    }

    fn policy_configuration_identity(&self) -> String {
        self.name.clone()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    async fn new_image_source(&self, _ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(MemorySource {
            name: self.name.clone(),
            store: self.store.clone(),
            thread_safe: self.caps.thread_safe,
        }))
    }

    async fn new_image_destination(
        &self,
        _ctx: &SystemContext,
    ) -> Result<Box<dyn ImageDestination>> {
        Ok(Box::new(MemoryDestination {
            name: self.name.clone(),
            store: self.store.clone(),
            caps: self.caps.clone(),
        }))
    }
}

pub struct MemorySource {
    name: String,
    store: Arc<Store>,
    thread_safe: bool,
}

#[async_trait]
impl BlobChunkAccessor for MemorySource {
    async fn get_blob_at(
        &self,
        info: &BlobInfo,
        chunks: &[ImageSourceChunk],
    ) -> Result<Vec<BlobReader>> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Transport("blob without a digest".into()))?;
        let data = self
            .store
            .blob(digest)
            .ok_or_else(|| Error::Transport(format!("{}: blob {} unknown", self.name, digest)))?;
        chunks
            .iter()
            .map(|chunk| {
                let start = chunk.offset as usize;
                let end = match chunk.length {
                    Some(len) => start + len as usize,
                    None => data.len(),
                };
                if start > end || end > data.len() {
                    return Err(Error::Transport(format!(
                        "range {}..{} outside blob {}",
                        start, end, digest
                    )));
                }
                self.store.counters.chunk_reads.fetch_add(1, Ordering::SeqCst);
                Ok(Box::pin(io::Cursor::new(data[start..end].to_vec())) as BlobReader)
            })
            .collect()
    }
}

#[async_trait]
impl ImageSource for MemorySource {
    fn reference_name(&self) -> String {
        format!("{}:{}", TRANSPORT_NAME, self.name)
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        self.store
            .manifest(instance)
            .ok_or_else(|| Error::Transport(format!("{}: manifest unknown", self.name)))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        _cache: &dyn BlobInfoCache,
    ) -> Result<(BlobReader, Option<u64>)> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Transport("blob without a digest".into()))?;
        let data = self
            .store
            .blob(digest)
            .ok_or_else(|| Error::Transport(format!("{}: blob {} unknown", self.name, digest)))?;
        self.store.counters.get_blob.fetch_add(1, Ordering::SeqCst);
        self.store
            .counters
            .bytes_served
            .fetch_add(data.len(), Ordering::SeqCst);
        let size = data.len() as u64;
        Ok((Box::pin(io::Cursor::new(data)), Some(size)))
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        self.thread_safe
    }

    fn supports_get_blob_at(&self) -> bool {
        true
    }

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Signature>> {
        Ok(self.store.signatures(instance))
    }
}

pub struct MemoryDestination {
    name: String,
    store: Arc<Store>,
    caps: Capabilities,
}

#[async_trait]
impl ImageDestination for MemoryDestination {
    fn reference_name(&self) -> String {
        format!("{}:{}", TRANSPORT_NAME, self.name)
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        self.caps.manifest_mime_types.clone()
    }

    fn supports_signatures(&self) -> Result<()> {
        if self.caps.signatures {
            Ok(())
        } else {
            Err(Error::Unsupported(
                "memory destination does not support signatures".into(),
            ))
        }
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        self.caps.desired_layer_compression
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        false
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        true
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        self.caps.thread_safe
    }

    fn supports_put_blob_partial(&self) -> bool {
        self.caps.partial_pull != PartialPullMode::Unsupported
    }

    async fn put_blob(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        info: &BlobInfo,
        _options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob> {
        let counters = &self.store.counters;
        let _guard = counters.uploads.enter();
        counters.put_blob.fetch_add(1, Ordering::SeqCst);

        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        if !self.caps.put_delay.is_zero() {
            tokio::time::sleep(self.caps.put_delay).await;
        }
        if let Some(expected) = info.size {
            if expected != data.len() as u64 {
                return Err(Error::Transport(format!(
                    "size mismatch for {}: expected {}, got {}",
                    info.digest_label(),
                    expected,
                    data.len()
                )));
            }
        }
        let size = data.len() as u64;
        let digest = self.store.add_blob(data);
        Ok(UploadedBlob { digest, size })
    }

    async fn put_blob_partial(
        &self,
        chunks: &dyn BlobChunkAccessor,
        info: &BlobInfo,
        options: PutBlobPartialOptions<'_>,
    ) -> Result<PartialPull> {
        let counters = &self.store.counters;
        let (PartialPullMode::Assemble, Some(digest), Some(size)) =
            (self.caps.partial_pull, &info.digest, info.size)
        else {
            counters.partial_fallbacks.fetch_add(1, Ordering::SeqCst);
            return Ok(PartialPull::FallbackRequested);
        };
        let half = size / 2;
        let ranges = [
            ImageSourceChunk {
                offset: 0,
                length: Some(half),
            },
            ImageSourceChunk {
                offset: half,
                length: None,
            },
        ];
        let mut data = Vec::new();
        for mut reader in chunks.get_blob_at(info, &ranges).await? {
            reader.read_to_end(&mut data).await?;
        }
        let actual = Digest::from_bytes(&data);
        if actual != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        counters.partial_pulls.fetch_add(1, Ordering::SeqCst);
        let size = data.len() as u64;
        let digest = match toc_digest(&info.annotations)? {
            Some(toc) => {
                if let Some(uncompressed) = options.cache.uncompressed_digest(digest) {
                    options.cache.record_toc_uncompressed_pair(&toc, &uncompressed);
                }
                self.store.add_toc_layer(&toc, data)
            }
            None => self.store.add_blob(data),
        };
        Ok(PartialPull::Pulled(UploadedBlob { digest, size }))
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        options: &TryReusingBlobOptions<'_>,
    ) -> Result<Option<ReusedBlob>> {
        if !options.original_candidate_matches() {
            return Ok(None);
        }
        let Some(digest) = &info.digest else {
            return Ok(None);
        };
        if let Some(data) = self.store.blob(digest) {
            self.store.counters.reuse_hits.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(ReusedBlob::exact(
                digest.clone(),
                Some(data.len() as u64),
            )));
        }
        // A layer with the same TOC has the same content; the manifest keeps
        // referring to the requested blob.
        let (Some(toc), Some(_), Some(size)) = (&options.toc_digest, options.layer_index, info.size)
        else {
            return Ok(None);
        };
        let by_uncompressed = options
            .cache
            .uncompressed_digest_for_toc(toc)
            .filter(|u| self.store.has_blob(u));
        if by_uncompressed.is_none() && self.store.layer_by_toc(toc).is_none() {
            return Ok(None);
        }
        self.store.counters.toc_hits.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ReusedBlob {
            matched_by_toc_digest: true,
            ..ReusedBlob::exact(digest.clone(), Some(size))
        }))
    }

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<()> {
        self.store.counters.put_manifest.fetch_add(1, Ordering::SeqCst);
        let mime_type = guess_mime_type(manifest);
        if self.caps.rejected_manifest_types.contains(&mime_type) {
            self.store
                .counters
                .rejected_manifests
                .fetch_add(1, Ordering::SeqCst);
            return Err(Error::ManifestTypeRejected {
                media_type: mime_type,
                reason: format!("{} does not store this type", self.name),
            });
        }
        self.store
            .set_manifest(instance.cloned(), manifest.to_vec(), &mime_type);
        Ok(())
    }

    async fn put_signatures(
        &self,
        signatures: &[Signature],
        instance: Option<&Digest>,
    ) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        self.supports_signatures()?;
        self.store
            .set_signatures(instance.cloned(), signatures.to_vec());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.store.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Report capture
// ---------------------------------------------------------------------------

/// A report writer whose output can be read back.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Image builders
// ---------------------------------------------------------------------------

pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let annotations: SharedAnnotations = Arc::new(Mutex::new(BTreeMap::new()));
    let mut reader = compressor(
        Algorithm::Gzip,
        None,
        Box::pin(io::Cursor::new(data.to_vec())),
        annotations,
    )
    .unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

/// Deterministic layer content.
pub fn layer_content(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}

pub fn config_blob(arch: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "architecture": arch,
        "os": "linux",
        "rootfs": {"type": "layers", "diff_ids": []},
    }))
    .unwrap()
}

/// A layer as written into a test manifest.
pub struct TestLayer {
    pub digest: Digest,
    pub size: usize,
    pub media_type: String,
}

/// Store gzip layers and a config, and return the OCI manifest bytes
/// describing them, plus the layers.
pub async fn oci_image(store: &Store, arch: &str, seeds: &[u8]) -> (Vec<u8>, Vec<TestLayer>) {
    let mut layers = Vec::new();
    for &seed in seeds {
        let data = gzip(&layer_content(seed, 4096 + seed as usize)).await;
        let size = data.len();
        let digest = store.add_blob(data);
        layers.push(TestLayer {
            digest,
            size,
            media_type: OCI_LAYER_GZIP.to_string(),
        });
    }
    let config = config_blob(arch);
    let config_size = config.len();
    let config_digest = store.add_blob(config);

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": OCI_CONFIG,
            "digest": config_digest.to_string(),
            "size": config_size,
        },
        "layers": layers.iter().map(|l| json!({
            "mediaType": l.media_type,
            "digest": l.digest.to_string(),
            "size": l.size,
        })).collect::<Vec<_>>(),
    });
    (serde_json::to_vec_pretty(&manifest).unwrap(), layers)
}

/// An OCI index over per-architecture images stored in `store`. Each entry
/// in `annotations` is attached to the instance of the same position.
pub async fn oci_index(
    store: &Store,
    arches: &[&str],
    annotations: &[BTreeMap<String, String>],
) -> (Vec<u8>, Vec<Digest>) {
    let mut entries = Vec::new();
    let mut digests = Vec::new();
    for (i, arch) in arches.iter().enumerate() {
        let (manifest, _) = oci_image(store, arch, &[i as u8 * 10 + 1, i as u8 * 10 + 2]).await;
        let digest = Digest::from_bytes(&manifest);
        let size = manifest.len();
        store.set_manifest(Some(digest.clone()), manifest, OCI_MANIFEST);
        let mut entry = json!({
            "mediaType": OCI_MANIFEST,
            "digest": digest.to_string(),
            "size": size,
            "platform": {"architecture": arch, "os": "linux"},
        });
        if let Some(a) = annotations.get(i).filter(|a| !a.is_empty()) {
            entry["annotations"] = json!(a);
        }
        entries.push(entry);
        digests.push(digest);
    }
    let index = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": entries,
    });
    (serde_json::to_vec_pretty(&index).unwrap(), digests)
}

/// Compress `data` as zstd:chunked, returning the blob and its annotations.
pub async fn zstd_chunked(data: &[u8]) -> (Vec<u8>, BTreeMap<String, String>) {
    let annotations: SharedAnnotations = Arc::new(Mutex::new(BTreeMap::new()));
    let mut reader = compressor(
        Algorithm::ZstdChunked,
        None,
        Box::pin(io::Cursor::new(data.to_vec())),
        annotations.clone(),
    )
    .unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let annotations = annotations.lock().unwrap().clone();
    (out, annotations)
}

/// An OCI manifest over layers already in the store, with a fresh config.
pub fn oci_manifest_for(
    store: &Store,
    arch: &str,
    layers: &[(Digest, usize, &str, BTreeMap<String, String>)],
) -> Vec<u8> {
    let config = config_blob(arch);
    let config_size = config.len();
    let config_digest = store.add_blob(config);
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": OCI_CONFIG,
            "digest": config_digest.to_string(),
            "size": config_size,
        },
        "layers": layers.iter().map(|(digest, size, media_type, annotations)| {
            let mut l = json!({
                "mediaType": media_type,
                "digest": digest.to_string(),
                "size": size,
            });
            if !annotations.is_empty() {
                l["annotations"] = json!(annotations);
            }
            l
        }).collect::<Vec<_>>(),
    });
    serde_json::to_vec_pretty(&manifest).unwrap()
}

/// A one-layer schema1 manifest for `layer`, stored as the top-level
/// manifest. Only the manifest names the architecture.
pub fn schema1_image(store: &Store, arch: &str, layer: &Digest) -> Vec<u8> {
    let v1 = json!({
        "id": "a".repeat(64),
        "os": "linux",
        "created": "2024-01-01T00:00:00Z",
        "container_config": {"Cmd": ["/bin/sh"]},
    });
    let manifest = json!({
        "schemaVersion": 1,
        "name": "lib/app",
        "tag": "1.0",
        "architecture": arch,
        "fsLayers": [{"blobSum": layer.to_string()}],
        "history": [{"v1Compatibility": v1.to_string()}],
    });
    let blob = serde_json::to_vec_pretty(&manifest).unwrap();
    store.set_manifest(None, blob.clone(), DOCKER_V2_SCHEMA1);
    blob
}
