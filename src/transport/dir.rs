//! The `dir:` transport for images stored as loose files in a directory.
//!
//! Layout: `version`, `manifest.json` (or `<hex>.manifest.json` for list
//! instances), one file per blob named by digest, and `signature-N` (or
//! `<hex>.signature-N`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use imgcopy_oci::manifest::guess_mime_type;
use imgcopy_oci::{BlobInfo, Digest, LayerCompression};

use super::{blob_file_name, path_namespaces, persist_blob, resolve_path, write_temp_blob};
use crate::blobinfocache::BlobInfoCache;
use crate::error::{Error, Result, ResultExt};
use crate::signature::Signature;
use crate::types::{
    unsupported_blob_at, BlobChunkAccessor, BlobReader, ImageDestination, ImageReference,
    ImageSource, ImageSourceChunk, PutBlobOptions, ReusedBlob, SystemContext,
    TryReusingBlobOptions, UploadedBlob,
};

pub const TRANSPORT_NAME: &str = "dir";
const VERSION: &str = "Directory Transport Version: 1.1\n";

#[derive(Debug, Clone)]
pub struct DirReference {
    path: PathBuf,
}

impl DirReference {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            path: resolve_path(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn manifest_path(&self, instance: Option<&Digest>) -> PathBuf {
        match instance {
            Some(d) => self.path.join(format!("{}.manifest.json", d.encoded())),
            None => self.path.join("manifest.json"),
        }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.path.join(blob_file_name(digest))
    }

    /// `index` counts from 0; files count from 1.
    fn signature_path(&self, index: usize, instance: Option<&Digest>) -> PathBuf {
        match instance {
            Some(d) => self.path.join(format!("{}.signature-{}", d.encoded(), index + 1)),
            None => self.path.join(format!("signature-{}", index + 1)),
        }
    }

    fn version_path(&self) -> PathBuf {
        self.path.join("version")
    }
}

#[async_trait]
impl ImageReference for DirReference {
    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn string_within_transport(&self) -> String {
        self.path.display().to_string()
    }

    fn policy_configuration_identity(&self) -> String {
        self.path.display().to_string()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        path_namespaces(&self.path)
    }

    async fn new_image_source(&self, _ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(DirSource { r: self.clone() }))
    }

    async fn new_image_destination(
        &self,
        ctx: &SystemContext,
    ) -> Result<Box<dyn ImageDestination>> {
        let compression = match (ctx.dir_force_compress, ctx.dir_force_decompress) {
            (true, true) => {
                return Err(Error::Config(
                    "Cannot both compress and decompress in a dir: destination".into(),
                ))
            }
            (true, false) => LayerCompression::Compress,
            (false, true) => LayerCompression::Decompress,
            (false, false) => LayerCompression::PreserveOriginal,
        };
        prepare_destination(self).await?;
        Ok(Box::new(DirDestination {
            r: self.clone(),
            compression,
        }))
    }
}

/// Create the directory, or empty an existing image directory. Directories
/// holding anything else are refused.
async fn prepare_destination(r: &DirReference) -> Result<()> {
    match fs::read_dir(&r.path).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                let version = fs::read_to_string(r.version_path()).await.ok();
                if version.as_deref() != Some(VERSION) {
                    return Err(Error::Transport(format!(
                        "non-empty directory {:?} is not an image destination",
                        r.path.display().to_string()
                    )));
                }
                let mut entries = fs::read_dir(&r.path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        fs::remove_dir_all(entry.path()).await?;
                    } else {
                        fs::remove_file(entry.path()).await?;
                    }
                }
                debug!(path = %r.path.display(), "emptied existing dir: image");
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(&r.path).await?;
        }
        Err(e) => return Err(e.into()),
    }
    fs::write(r.version_path(), VERSION).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub struct DirSource {
    r: DirReference,
}

#[async_trait]
impl BlobChunkAccessor for DirSource {
    async fn get_blob_at(
        &self,
        _info: &BlobInfo,
        _chunks: &[ImageSourceChunk],
    ) -> Result<Vec<BlobReader>> {
        Err(unsupported_blob_at(&self.reference_name()))
    }
}

#[async_trait]
impl ImageSource for DirSource {
    fn reference_name(&self) -> String {
        format!("{}:{}", TRANSPORT_NAME, self.r.path.display())
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let path = self.r.manifest_path(instance);
        let blob = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mime_type = guess_mime_type(&blob);
        Ok((blob, mime_type))
    }

    async fn get_blob(
        &self,
        info: &BlobInfo,
        _cache: &dyn BlobInfoCache,
    ) -> Result<(BlobReader, Option<u64>)> {
        let digest = info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Internal("reading a blob with unknown digest".into()))?;
        let path = self.r.blob_path(digest);
        let file = fs::File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let size = file.metadata().await?.len();
        Ok((Box::pin(file), Some(size)))
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }

    async fn get_signatures(&self, instance: Option<&Digest>) -> Result<Vec<Signature>> {
        let mut out = Vec::new();
        loop {
            let path = self.r.signature_path(out.len(), instance);
            match fs::read(&path).await {
                Ok(data) => out.push(
                    Signature::from_bytes(&data)
                        .with_context(|| format!("parsing {}", path.display()))?,
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

pub struct DirDestination {
    r: DirReference,
    compression: LayerCompression,
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn reference_name(&self) -> String {
        format!("{}:{}", TRANSPORT_NAME, self.r.path.display())
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        Vec::new()
    }

    fn supports_signatures(&self) -> Result<()> {
        Ok(())
    }

    fn desired_layer_compression(&self) -> LayerCompression {
        self.compression
    }

    fn accepts_foreign_layer_urls(&self) -> bool {
        false
    }

    fn ignores_embedded_docker_reference(&self) -> bool {
        // There is no docker reference to embed.
        false
    }

    fn has_thread_safe_put_blob(&self) -> bool {
        true
    }

    async fn put_blob(
        &self,
        stream: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &BlobInfo,
        _options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob> {
        let (uploaded, tmp) = write_temp_blob(&self.r.path, stream, info).await?;
        persist_blob(tmp, &self.r.blob_path(&uploaded.digest))?;
        debug!(digest = %uploaded.digest, size = uploaded.size, "stored blob");
        Ok(uploaded)
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
        if !options.original_candidate_matches() {
            return Ok(None);
        }
        match fs::metadata(self.r.blob_path(digest)).await {
            Ok(m) => Ok(Some(ReusedBlob::exact(digest.clone(), Some(m.len())))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_manifest(&self, manifest: &[u8], instance: Option<&Digest>) -> Result<()> {
        fs::write(self.r.manifest_path(instance), manifest).await?;
        Ok(())
    }

    async fn put_signatures(
        &self,
        signatures: &[Signature],
        instance: Option<&Digest>,
    ) -> Result<()> {
        for (i, sig) in signatures.iter().enumerate() {
            fs::write(self.r.signature_path(i, instance), sig.to_bytes()?).await?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}
