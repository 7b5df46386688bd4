//! The `oci:` transport for an OCI image layout directory.
//!
//! `oci-layout`, `index.json` and content-addressed blobs under
//! `blobs/<algorithm>/<hex>`. Tagged images are found through the
//! `org.opencontainers.image.ref.name` annotation of `index.json` entries.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use imgcopy_oci::manifest::{guess_mime_type, OciDescriptor, OciIndex, OCI_INDEX, OCI_MANIFEST};
use imgcopy_oci::{BlobInfo, Digest, LayerCompression};

use super::{path_namespaces, persist_blob, resolve_path, write_temp_blob};
use crate::blobinfocache::BlobInfoCache;
use crate::error::{Error, Result, ResultExt};
use crate::signature::Signature;
use crate::types::{
    unsupported_blob_at, BlobChunkAccessor, BlobReader, ImageDestination, ImageReference,
    ImageSource, ImageSourceChunk, PutBlobOptions, ReusedBlob, SystemContext,
    TryReusingBlobOptions, UploadedBlob,
};

pub const TRANSPORT_NAME: &str = "oci";
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone)]
pub struct LayoutReference {
    dir: PathBuf,
    /// The `ref.name` of the image within the layout.
    tag: Option<String>,
}

impl LayoutReference {
    /// Parse `PATH[:TAG]`.
    pub fn parse(reference: &str) -> Result<Self> {
        let (dir, tag) = match reference.split_once(':') {
            Some((dir, tag)) => (dir, Some(tag)),
            None => (reference, None),
        };
        if let Some(tag) = tag {
            if tag.is_empty() || tag.contains(|c: char| c.is_whitespace() || c.is_control()) {
                return Err(Error::Config(format!("invalid image name {:?}", tag)));
            }
        }
        Ok(Self {
            dir: resolve_path(dir)?,
            tag: tag.map(str::to_string),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir
            .join("blobs")
            .join(digest.algorithm_name())
            .join(digest.encoded())
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

#[async_trait]
impl ImageReference for LayoutReference {
    fn transport_name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn string_within_transport(&self) -> String {
        match &self.tag {
            Some(t) => format!("{}:{}", self.dir.display(), t),
            None => self.dir.display().to_string(),
        }
    }

    fn policy_configuration_identity(&self) -> String {
        self.string_within_transport()
    }

    fn policy_configuration_namespaces(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.tag.is_some() {
            out.push(self.dir.display().to_string());
        }
        out.extend(path_namespaces(&self.dir));
        out
    }

    async fn new_image_source(&self, _ctx: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let index = read_index(&self.index_path()).await?;
        let descriptor = select_descriptor(&index, self.tag.as_deref())?.clone();
        Ok(Box::new(LayoutSource {
            r: self.clone(),
            descriptor,
        }))
    }

    async fn new_image_destination(
        &self,
        _ctx: &SystemContext,
    ) -> Result<Box<dyn ImageDestination>> {
        fs::create_dir_all(self.dir.join("blobs")).await?;
        let index = if fs::try_exists(self.index_path()).await? {
            read_index(&self.index_path()).await?
        } else {
            OciIndex::from_components(Vec::new())
        };
        fs::write(self.dir.join(LAYOUT_FILE), LAYOUT_VERSION).await?;
        Ok(Box::new(LayoutDestination {
            r: self.clone(),
            index: Mutex::new(index),
        }))
    }
}

async fn read_index(path: &Path) -> Result<OciIndex> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
}

fn select_descriptor<'a>(index: &'a OciIndex, tag: Option<&str>) -> Result<&'a OciDescriptor> {
    match tag {
        Some(tag) => index
            .manifests
            .iter()
            .find(|d| d.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) == Some(tag))
            .ok_or_else(|| Error::Transport(format!("no descriptor found for reference {:?}", tag))),
        None => match index.manifests.as_slice() {
            [only] => Ok(only),
            [] => Err(Error::Transport("no images in the OCI layout".into())),
            _ => Err(Error::Transport(
                "more than one image in the OCI layout, choose an image".into(),
            )),
        },
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub struct LayoutSource {
    r: LayoutReference,
    descriptor: OciDescriptor,
}

#[async_trait]
impl BlobChunkAccessor for LayoutSource {
    async fn get_blob_at(
        &self,
        _info: &BlobInfo,
        _chunks: &[ImageSourceChunk],
    ) -> Result<Vec<BlobReader>> {
        Err(unsupported_blob_at(&self.reference_name()))
    }
}

#[async_trait]
impl ImageSource for LayoutSource {
    fn reference_name(&self) -> String {
        format!("{}:{}", TRANSPORT_NAME, self.r.string_within_transport())
    }

    async fn get_manifest(&self, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let (digest, mime_type) = match instance {
            Some(d) => (d, None),
            None => (&self.descriptor.digest, Some(self.descriptor.media_type.clone())),
        };
        let path = self.r.blob_path(digest);
        let blob = fs::read(&path)
            .await
            .with_context(|| format!("reading manifest {}", digest))?;
        let mime_type = mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| guess_mime_type(&blob));
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
        let file = fs::File::open(self.r.blob_path(digest))
            .await
            .with_context(|| format!("opening blob {}", digest))?;
        let size = file.metadata().await?.len();
        Ok((Box::pin(file), Some(size)))
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }

    async fn get_signatures(&self, _instance: Option<&Digest>) -> Result<Vec<Signature>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

pub struct LayoutDestination {
    r: LayoutReference,
    /// Written out on commit.
    index: Mutex<OciIndex>,
}

impl LayoutDestination {
    fn add_manifest(&self, descriptor: OciDescriptor) -> Result<()> {
        let mut index = self
            .index
            .lock()
            .map_err(|_| Error::Internal("OCI index lock poisoned".into()))?;
        let name = descriptor.annotations.get(REF_NAME_ANNOTATION).cloned();
        index.manifests.retain(|d| match &name {
            Some(n) => d.annotations.get(REF_NAME_ANNOTATION) != Some(n),
            None => d.digest != descriptor.digest || d.annotations.contains_key(REF_NAME_ANNOTATION),
        });
        index.manifests.push(descriptor);
        Ok(())
    }
}

#[async_trait]
impl ImageDestination for LayoutDestination {
    fn reference_name(&self) -> String {
        format!("{}:{}", TRANSPORT_NAME, self.r.string_within_transport())
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        vec![OCI_MANIFEST.to_string(), OCI_INDEX.to_string()]
    }

    fn supports_signatures(&self) -> Result<()> {
        Err(Error::Unsupported(
            "Pushing signatures for OCI images is not supported".into(),
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
        _options: PutBlobOptions<'_>,
    ) -> Result<UploadedBlob> {
        let blobs = self.r.dir.join("blobs");
        let (uploaded, tmp) = write_temp_blob(&blobs, stream, info).await?;
        let path = self.r.blob_path(&uploaded.digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        persist_blob(tmp, &path)?;
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
        let digest = Digest::from_bytes(manifest);
        let path = self.r.blob_path(&digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, manifest).await?;
        if instance.is_some() {
            // List instances are referenced from the list, not from index.json.
            return Ok(());
        }
        let mut descriptor =
            OciDescriptor::new(&guess_mime_type(manifest), digest, manifest.len() as i64);
        if let Some(tag) = &self.r.tag {
            descriptor
                .annotations
                .insert(REF_NAME_ANNOTATION.to_string(), tag.clone());
        }
        self.add_manifest(descriptor)
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
        let data = {
            let index = self
                .index
                .lock()
                .map_err(|_| Error::Internal("OCI index lock poisoned".into()))?;
            serde_json::to_vec(&*index)?
        };
        let tmp = tempfile::Builder::new()
            .prefix(".index-")
            .tempfile_in(&self.r.dir)?;
        fs::write(tmp.path(), &data).await?;
        persist_blob(tmp, &self.r.index_path())?;
        debug!(path = %self.r.dir.display(), "wrote OCI index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &[u8] = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2},"layers":[]}"#;

    #[test]
    fn parse_path_and_tag() {
        let r = LayoutReference::parse("/tmp/layout:v1").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.policy_configuration_namespaces()[0], r.dir.display().to_string());
        assert!(LayoutReference::parse("/tmp/layout:").is_err());
    }

    #[tokio::test]
    async fn tagged_manifest_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let name = format!("{}:v1", tmp.path().join("layout").display());
        let r = LayoutReference::parse(&name).unwrap();
        let dest = r
            .new_image_destination(&SystemContext::default())
            .await
            .unwrap();
        dest.put_manifest(MANIFEST, None).await.unwrap();
        dest.commit().await.unwrap();

        let index: OciIndex =
            serde_json::from_slice(&std::fs::read(r.index_path()).unwrap()).unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(
            index.manifests[0].annotations.get(REF_NAME_ANNOTATION).map(String::as_str),
            Some("v1")
        );

        let src = r.new_image_source(&SystemContext::default()).await.unwrap();
        let (blob, mime) = src.get_manifest(None).await.unwrap();
        assert_eq!(blob, MANIFEST);
        assert_eq!(mime, OCI_MANIFEST);
    }

    #[tokio::test]
    async fn retagging_replaces_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let name = format!("{}:v1", tmp.path().join("layout").display());
        let r = LayoutReference::parse(&name).unwrap();
        for body in [MANIFEST.to_vec(), MANIFEST.iter().chain(b" ").copied().collect()] {
            let dest = r
                .new_image_destination(&SystemContext::default())
                .await
                .unwrap();
            dest.put_manifest(&body, None).await.unwrap();
            dest.commit().await.unwrap();
        }
        let index: OciIndex =
            serde_json::from_slice(&std::fs::read(r.index_path()).unwrap()).unwrap();
        assert_eq!(index.manifests.len(), 1);
    }

    #[tokio::test]
    async fn signatures_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let r = LayoutReference::parse(tmp.path().join("l").to_str().unwrap()).unwrap();
        let dest = r
            .new_image_destination(&SystemContext::default())
            .await
            .unwrap();
        assert!(dest.supports_signatures().is_err());
        assert!(dest.put_signatures(&[], None).await.is_ok());
        let sig = Signature {
            payload: String::new(),
            signature: String::new(),
            key_id: String::new(),
        };
        assert!(dest.put_signatures(&[sig], None).await.is_err());
    }

    #[test]
    fn ambiguous_untagged_source() {
        let d = |b: &[u8]| OciDescriptor::new(OCI_MANIFEST, Digest::from_bytes(b), 1);
        let index = OciIndex::from_components(vec![d(b"a"), d(b"b")]);
        assert!(select_descriptor(&index, None).is_err());
        let index = OciIndex::from_components(vec![d(b"a")]);
        assert!(select_descriptor(&index, None).is_ok());
    }
}
