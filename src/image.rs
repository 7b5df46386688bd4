//! Image views over a source: the raw manifest as fetched, and the parsed
//! single-image form that can be edited into a manifest for the destination.

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tracing::debug;

use imgcopy_oci::manifest::{
    self, LayerInfo, Manifest, Platform, DOCKER_V2_SCHEMA1, DOCKER_V2_SCHEMA1_SIGNED,
    DOCKER_V2_SCHEMA2, OCI_MANIFEST,
};
use imgcopy_oci::{BlobInfo, Digest, ImageRef};

use crate::blobinfocache::BlobInfoCache;
use crate::error::{Error, Result, ResultExt};
use crate::signature::Signature;
use crate::types::{ImageReference, ImageSource};

/// Largest config blob we are willing to buffer.
const MAX_CONFIG_SIZE: u64 = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// UnparsedImage
// ---------------------------------------------------------------------------

/// One image (or list) within a source, fetched lazily and verified against
/// the digest it was requested by.
pub struct UnparsedImage<'a> {
    src: &'a dyn ImageSource,
    reference: &'a dyn ImageReference,
    instance: Option<Digest>,
    manifest: OnceCell<(Vec<u8>, String)>,
    signatures: OnceCell<Vec<Signature>>,
}

impl<'a> UnparsedImage<'a> {
    /// `instance` selects an entry of a list; `None` is the top-level manifest.
    pub fn new(
        src: &'a dyn ImageSource,
        reference: &'a dyn ImageReference,
        instance: Option<Digest>,
    ) -> Self {
        Self {
            src,
            reference,
            instance,
            manifest: OnceCell::new(),
            signatures: OnceCell::new(),
        }
    }

    pub fn reference(&self) -> &dyn ImageReference {
        self.reference
    }

    pub fn instance(&self) -> Option<&Digest> {
        self.instance.as_ref()
    }

    pub fn source(&self) -> &'a dyn ImageSource {
        self.src
    }

    /// The manifest blob and its MIME type.
    pub async fn manifest(&self) -> Result<(&[u8], &str)> {
        let (blob, mime) = self
            .manifest
            .get_or_try_init(|| async {
                let (blob, mime) = self.src.get_manifest(self.instance.as_ref()).await?;
                let expected = match &self.instance {
                    Some(d) => Some((d.clone(), "Manifest does not match provided manifest digest")),
                    None => self
                        .reference
                        .docker_reference()
                        .and_then(|r| r.digest)
                        .map(|d| (d, "Manifest does not match expected digest")),
                };
                if let Some((digest, message)) = expected {
                    if !manifest::matches_digest(&blob, &digest)? {
                        return Err(Error::Manifest(format!("{} {}", message, digest)));
                    }
                }
                Ok::<_, Error>((blob, mime))
            })
            .await?;
        Ok((blob.as_slice(), mime.as_str()))
    }

    pub async fn signatures(&self) -> Result<&[Signature]> {
        let sigs = self
            .signatures
            .get_or_try_init(|| self.src.get_signatures(self.instance.as_ref()))
            .await?;
        Ok(sigs.as_slice())
    }
}

// ---------------------------------------------------------------------------
// SourcedImage
// ---------------------------------------------------------------------------

/// Edits to apply when producing the destination manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestUpdates {
    pub layer_infos: Option<Vec<BlobInfo>>,
    pub embedded_docker_reference: Option<ImageRef>,
    /// Convert to this manifest type.
    pub manifest_mime_type: Option<String>,
}

impl ManifestUpdates {
    pub fn is_empty(&self) -> bool {
        self.layer_infos.is_none()
            && self.embedded_docker_reference.is_none()
            && self.manifest_mime_type.is_none()
    }
}

/// Data gathered during the copy that conversions may need.
#[derive(Debug, Clone, Default)]
pub struct UpdateInformation {
    /// The layers as written to the destination, in manifest order.
    pub layer_infos: Vec<BlobInfo>,
    /// Uncompressed digests, in manifest order; `None` where unknown.
    pub layer_diff_ids: Vec<Option<Digest>>,
}

/// A manifest ready to be written, with the config blob it refers to.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub manifest: Vec<u8>,
    pub mime_type: String,
    /// `None` for schema1, which has no separate config.
    pub config: Option<(BlobInfo, Vec<u8>)>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPlatform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    variant: String,
}

/// A single-image manifest from a source, parsed.
pub struct SourcedImage {
    pub manifest_blob: Vec<u8>,
    pub manifest_mime_type: String,
    manifest: Manifest,
    config_blob: OnceCell<Vec<u8>>,
}

impl std::fmt::Debug for SourcedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcedImage")
            .field("manifest_mime_type", &self.manifest_mime_type)
            .finish_non_exhaustive()
    }
}

impl SourcedImage {
    /// Parse the manifest of `unparsed`. Lists are rejected; choose an
    /// instance first.
    pub async fn from_unparsed(unparsed: &UnparsedImage<'_>) -> Result<Self> {
        let (blob, mime) = unparsed.manifest().await?;
        let mime_type = if mime.is_empty() {
            manifest::guess_mime_type(blob)
        } else {
            mime.to_string()
        };
        if manifest::is_multi_image(&mime_type) {
            return Err(Error::Manifest(format!(
                "{} is a manifest list, not a single image",
                unparsed.reference()
            )));
        }
        let parsed = Manifest::from_blob(blob, &mime_type)?;
        Ok(Self {
            manifest_blob: blob.to_vec(),
            manifest_mime_type: mime_type,
            manifest: parsed,
            config_blob: OnceCell::new(),
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn config_info(&self) -> Option<BlobInfo> {
        self.manifest.config_info()
    }

    pub fn layer_infos(&self) -> Vec<LayerInfo> {
        self.manifest.layer_infos()
    }

    pub fn can_change_layer_compression(&self, mime_type: &str) -> bool {
        self.manifest.can_change_layer_compression(mime_type)
    }

    /// Whether any layer is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.layer_infos()
            .iter()
            .any(|l| crate::encryption::is_encrypted_media_type(&l.info.media_type))
    }

    /// Whether writing this image as `dest_ref` would change its embedded
    /// name (schema1 only).
    pub fn embedded_docker_reference_conflicts(&self, dest_ref: &ImageRef) -> bool {
        match &self.manifest {
            Manifest::Schema1(m) => {
                m.embedded_reference_conflicts(&dest_ref.repository, dest_ref.tag.as_deref())
            }
            _ => false,
        }
    }

    /// Whether [`SourcedImage::updated_image`] needs the uncompressed digest
    /// of every layer for these updates.
    pub fn updated_image_needs_layer_diff_ids(&self, updates: &ManifestUpdates) -> bool {
        let Manifest::Schema1(_) = self.manifest else {
            return false;
        };
        matches!(
            updates.manifest_mime_type.as_deref().map(manifest::normalized_mime_type),
            Some(DOCKER_V2_SCHEMA2) | Some(OCI_MANIFEST)
        )
    }

    /// The config blob, fetched from `src` once and verified.
    pub async fn config_blob(
        &self,
        src: &dyn ImageSource,
        cache: &dyn BlobInfoCache,
    ) -> Result<Option<&[u8]>> {
        let Some(info) = self.config_info() else {
            return Ok(None);
        };
        let blob = self
            .config_blob
            .get_or_try_init(|| fetch_config(src, cache, info))
            .await?;
        Ok(Some(blob.as_slice()))
    }

    /// The platform the image was built for.
    pub async fn platform(
        &self,
        src: &dyn ImageSource,
        cache: &dyn BlobInfoCache,
    ) -> Result<Platform> {
        let config: ConfigPlatform = match &self.manifest {
            Manifest::Schema1(m) => {
                let mut c: ConfigPlatform = m
                    .history
                    .first()
                    .and_then(|h| serde_json::from_str(&h.v1_compatibility).ok())
                    .unwrap_or_default();
                if c.architecture.is_empty() {
                    c.architecture = m.architecture.clone();
                }
                c
            }
            _ => match self.config_blob(src, cache).await? {
                Some(blob) => serde_json::from_slice(blob)
                    .map_err(|e| Error::Manifest(format!("parsing image configuration: {}", e)))?,
                None => ConfigPlatform::default(),
            },
        };
        Ok(Platform {
            architecture: config.architecture,
            os: config.os,
            variant: config.variant,
            ..Default::default()
        })
    }

    /// This image with no edits, ready to be written as-is.
    pub async fn unmodified(
        &self,
        src: &dyn ImageSource,
        cache: &dyn BlobInfoCache,
    ) -> Result<PendingImage> {
        let config = match self.config_info() {
            Some(info) => {
                let blob = self.config_blob(src, cache).await?.unwrap_or_default();
                Some((info, blob.to_vec()))
            }
            None => None,
        };
        Ok(PendingImage {
            manifest: self.manifest_blob.clone(),
            mime_type: self.manifest_mime_type.clone(),
            config,
        })
    }

    /// Apply `updates`, converting the manifest type first when asked to.
    pub async fn updated_image(
        &self,
        src: &dyn ImageSource,
        cache: &dyn BlobInfoCache,
        updates: &ManifestUpdates,
        info: &UpdateInformation,
    ) -> Result<PendingImage> {
        let mut edits = updates.layer_infos.clone();
        let target = updates
            .manifest_mime_type
            .as_deref()
            .map(manifest::normalized_mime_type)
            .filter(|t| *t != manifest::normalized_mime_type(self.manifest.mime_type()));

        let (mut converted, new_config) = match (&self.manifest, target) {
            (m, None) => (m.clone(), None),
            (_, Some(DOCKER_V2_SCHEMA1 | DOCKER_V2_SCHEMA1_SIGNED)) => {
                return Err(Error::Manifest(format!(
                    "Conversion to {} is not supported",
                    DOCKER_V2_SCHEMA1
                )));
            }
            (Manifest::Schema1(m), Some(DOCKER_V2_SCHEMA2)) => {
                let uploaded = (!info.layer_infos.is_empty()).then_some(info.layer_infos.as_slice());
                let (s2, config) = m.to_schema2(uploaded, &info.layer_diff_ids, edits.as_mut())?;
                (Manifest::Schema2(s2), Some(config))
            }
            (Manifest::Schema1(m), Some(OCI_MANIFEST)) => {
                let uploaded = (!info.layer_infos.is_empty()).then_some(info.layer_infos.as_slice());
                let (oci, config) = m.to_oci(uploaded, &info.layer_diff_ids, edits.as_mut())?;
                (Manifest::Oci(oci), Some(config))
            }
            (Manifest::Schema2(m), Some(OCI_MANIFEST)) => {
                let config = self
                    .config_blob(src, cache)
                    .await?
                    .ok_or_else(|| Error::Internal("schema2 image without a config".into()))?;
                let (oci, config) = m.to_oci(config)?;
                (Manifest::Oci(oci), Some(config))
            }
            (Manifest::Oci(m), Some(DOCKER_V2_SCHEMA2)) => {
                (Manifest::Schema2(m.to_schema2(edits.as_mut())?), None)
            }
            (_, Some(other)) => {
                return Err(Error::Manifest(format!(
                    "Unsupported conversion type: {}",
                    other
                )));
            }
        };
        if let Some(t) = target {
            debug!(from = %self.manifest.mime_type(), to = %t, "converted manifest");
        }

        if let Some(edits) = &edits {
            converted.update_layer_infos(edits)?;
        }
        if let Some(r) = &updates.embedded_docker_reference {
            if let Manifest::Schema1(m) = &mut converted {
                m.set_embedded_reference(&r.repository, r.tag.as_deref());
            }
        }

        let config = match (converted.config_info(), new_config) {
            (None, _) => None,
            (Some(mut ci), Some(blob)) => {
                ci.digest = Some(Digest::from_bytes(&blob));
                ci.size = Some(blob.len() as u64);
                Some((ci, blob))
            }
            (Some(ci), None) => {
                let blob = self
                    .config_blob(src, cache)
                    .await?
                    .ok_or_else(|| Error::Internal("converted image lost its config".into()))?;
                Some((ci, blob.to_vec()))
            }
        };
        Ok(PendingImage {
            manifest: converted.serialize()?,
            mime_type: converted.mime_type().to_string(),
            config,
        })
    }
}

async fn fetch_config(
    src: &dyn ImageSource,
    cache: &dyn BlobInfoCache,
    info: BlobInfo,
) -> Result<Vec<u8>> {
    let label = info.digest_label();
    let (reader, _) = src
        .get_blob(&info, cache)
        .await
        .with_context(|| format!("fetching config blob {}", label))?;
    let mut blob = Vec::new();
    reader
        .take(MAX_CONFIG_SIZE + 1)
        .read_to_end(&mut blob)
        .await
        .with_context(|| format!("reading config blob {}", label))?;
    if blob.len() as u64 > MAX_CONFIG_SIZE {
        return Err(Error::Manifest(format!(
            "config blob {} is larger than {} bytes",
            label, MAX_CONFIG_SIZE
        )));
    }
    if let Some(digest) = &info.digest {
        if !digest.matches(&blob)? {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: Digest::from_bytes(&blob).to_string(),
            });
        }
    }
    Ok(blob)
}
