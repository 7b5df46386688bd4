use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::schema2::with_layer_context;
use super::{
    updated_mime_type, LayerInfo, Platform, Schema2, Schema2Descriptor,
    DOCKER_V2_SCHEMA2_CONFIG, DOCKER_V2_SCHEMA2_FOREIGN_LAYER,
    DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP, DOCKER_V2_SCHEMA2_LAYER,
    DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED, ENCRYPTED_SUFFIX, OCI_CONFIG, OCI_LAYER,
    OCI_LAYER_GZIP, OCI_LAYER_NONDISTRIBUTABLE, OCI_LAYER_NONDISTRIBUTABLE_GZIP,
    OCI_LAYER_NONDISTRIBUTABLE_ZSTD, OCI_LAYER_ZSTD, OCI_MANIFEST, OCI_VARIANTS,
};
use crate::blob::{BlobInfo, CryptoOperation, LayerCompression};
use crate::digest::Digest;
use crate::error::{OciError, Result};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// An OCI content descriptor, used by manifests and indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl OciDescriptor {
    pub fn new(media_type: &str, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
            artifact_type: None,
        }
    }

    pub fn blob_info(&self) -> BlobInfo {
        BlobInfo {
            digest: Some(self.digest.clone()),
            size: u64::try_from(self.size).ok(),
            urls: self.urls.clone(),
            annotations: self.annotations.clone(),
            media_type: self.media_type.clone(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    pub config: OciDescriptor,

    pub layers: Vec<OciDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<OciDescriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciManifest {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(blob)?;
        if raw.get("manifests").is_some() {
            return Err(OciError::Manifest(format!(
                "{} manifest contains a \"manifests\" field",
                OCI_MANIFEST
            )));
        }
        if let Some(mt) = raw.get("mediaType").and_then(|v| v.as_str()) {
            if mt != OCI_MANIFEST {
                return Err(OciError::Manifest(format!(
                    "manifest has mediaType {:?}, expected {:?}",
                    mt, OCI_MANIFEST
                )));
            }
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub fn from_components(config: OciDescriptor, layers: Vec<OciDescriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_MANIFEST.to_string(),
            artifact_type: None,
            config,
            layers,
            subject: None,
            annotations: BTreeMap::new(),
        }
    }

    pub fn layer_infos(&self) -> Vec<LayerInfo> {
        self.layers
            .iter()
            .map(|l| LayerInfo {
                info: l.blob_info(),
                empty_layer: false,
            })
            .collect()
    }

    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<()> {
        if self.layers.len() != infos.len() {
            return Err(OciError::Manifest(format!(
                "Error preparing updated manifest: layer count changed from {} to {}",
                self.layers.len(),
                infos.len()
            )));
        }
        for (layer, info) in self.layers.iter_mut().zip(infos) {
            let digest = info.digest.clone().ok_or_else(|| {
                OciError::Manifest("preparing updated manifest: layer digest is unknown".into())
            })?;
            let mut mime_type = layer.media_type.clone();
            if info.crypto_operation == CryptoOperation::Decrypt {
                mime_type = decrypted_media_type(&mime_type).map_err(|_| {
                    OciError::Manifest(format!(
                        "error preparing updated manifest: decryption specified but original mediatype is not encrypted: {:?}",
                        mime_type
                    ))
                })?;
            }
            let mut mime_type = updated_mime_type(OCI_VARIANTS, &mime_type, info)
                .map_err(|e| with_layer_context(&digest, e))?;
            if info.crypto_operation == CryptoOperation::Encrypt {
                mime_type = encrypted_media_type(&mime_type).map_err(|_| {
                    OciError::Manifest(format!(
                        "error preparing updated manifest: encryption specified but no counterpart for mediatype: {:?}",
                        mime_type
                    ))
                })?;
            }
            layer.media_type = mime_type;
            layer.digest = digest;
            layer.size = info.size.map(|s| s as i64).unwrap_or(-1);
            layer.annotations = info.annotations.clone();
            layer.urls = info.urls.clone();
        }
        Ok(())
    }

    /// Convert to Docker schema2. Decryption and zstd edits cannot be
    /// expressed in schema2, so they are applied to this manifest first and
    /// removed from `edits`.
    pub fn to_schema2(&self, edits: Option<&mut Vec<BlobInfo>>) -> Result<Schema2> {
        if self.config.media_type != OCI_CONFIG {
            return Err(OciError::Manifest(format!(
                "Manifest with config type {:?} is not an image",
                self.config.media_type
            )));
        }
        let mut source = std::borrow::Cow::Borrowed(self);
        if let Some(edits) = edits {
            if let Some(oci_only) = self.oci_only_edits(edits)? {
                let mut patched = self.clone();
                patched.update_layer_infos(&oci_only)?;
                source = std::borrow::Cow::Owned(patched);
            }
        }

        // Docker does not know the OCI config type; the contents are compatible.
        let config = Schema2Descriptor {
            media_type: DOCKER_V2_SCHEMA2_CONFIG.to_string(),
            size: source.config.size,
            digest: source.config.digest.clone(),
            urls: source.config.urls.clone(),
        };
        let layers = source
            .layers
            .iter()
            .map(|l| {
                let media_type = match l.media_type.as_str() {
                    OCI_LAYER_NONDISTRIBUTABLE => DOCKER_V2_SCHEMA2_FOREIGN_LAYER,
                    OCI_LAYER_NONDISTRIBUTABLE_GZIP => DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP,
                    OCI_LAYER => DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED,
                    OCI_LAYER_GZIP => DOCKER_V2_SCHEMA2_LAYER,
                    OCI_LAYER_NONDISTRIBUTABLE_ZSTD | OCI_LAYER_ZSTD => {
                        return Err(OciError::CompressionIncompatible(format!(
                            "Error during manifest conversion: {:?}: zstd compression is not supported for docker images",
                            l.media_type
                        )))
                    }
                    other if other.ends_with(ENCRYPTED_SUFFIX) => {
                        return Err(OciError::Manifest(format!(
                            "during manifest conversion: encrypted layers ({:?}) are not supported in docker images",
                            other
                        )))
                    }
                    other => {
                        return Err(OciError::Manifest(format!(
                            "Unknown media type during manifest conversion: {:?}",
                            other
                        )))
                    }
                };
                Ok(Schema2Descriptor {
                    media_type: media_type.to_string(),
                    size: l.size,
                    digest: l.digest.clone(),
                    urls: l.urls.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema2::from_components(config, layers))
    }

    /// Split `edits` into the part that must be applied while still in OCI
    /// form (returned) and the part applied after conversion (left in `edits`).
    fn oci_only_edits(&self, edits: &mut [BlobInfo]) -> Result<Option<Vec<BlobInfo>>> {
        if edits.len() != self.layers.len() {
            return Err(OciError::Manifest(format!(
                "preparing to decrypt before conversion: {} layers vs. {} layer edits",
                self.layers.len(),
                edits.len()
            )));
        }
        let mut oci_only: Vec<BlobInfo> = self.layers.iter().map(|l| l.blob_info()).collect();
        let mut needed = false;
        for (i, edit) in edits.iter_mut().enumerate() {
            oci_only[i].compression_operation = LayerCompression::PreserveOriginal;
            oci_only[i].compression_algorithm = None;
            if edit.crypto_operation == CryptoOperation::Decrypt {
                needed = true;
                oci_only[i].crypto_operation = CryptoOperation::Decrypt;
                edit.crypto_operation = CryptoOperation::PreserveOriginal;
            }
            let mt = self.layers[i].media_type.as_str();
            if mt == OCI_LAYER_ZSTD || mt == OCI_LAYER_NONDISTRIBUTABLE_ZSTD {
                needed = true;
                oci_only[i].compression_operation = edit.compression_operation;
                oci_only[i].compression_algorithm = edit.compression_algorithm;
                edit.compression_operation = LayerCompression::PreserveOriginal;
                edit.compression_algorithm = None;
            }
        }
        Ok(needed.then_some(oci_only))
    }
}

/// `mt` with the encryption suffix appended.
pub fn encrypted_media_type(mt: &str) -> Result<String> {
    let mut parts = mt.split('+');
    let base = parts.next().unwrap_or_default();
    if parts.any(|p| p == "encrypted") {
        return Err(OciError::UnsupportedMediaType(format!(
            "{:?} already encrypted",
            mt
        )));
    }
    match base {
        DOCKER_V2_SCHEMA2_LAYER | OCI_LAYER | OCI_LAYER_NONDISTRIBUTABLE => {
            Ok(format!("{}{}", mt, ENCRYPTED_SUFFIX))
        }
        _ => Err(OciError::UnsupportedMediaType(format!(
            "unsupported mediaType to encrypt: {:?}",
            mt
        ))),
    }
}

/// `mt` with the encryption suffix removed.
pub fn decrypted_media_type(mt: &str) -> Result<String> {
    mt.strip_suffix(ENCRYPTED_SUFFIX)
        .map(str::to_string)
        .ok_or_else(|| {
            OciError::UnsupportedMediaType(format!("unsupported mediaType to decrypt: {:?}", mt))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Algorithm;

    fn sample(layer_type: &str) -> OciManifest {
        OciManifest::from_components(
            OciDescriptor::new(OCI_CONFIG, Digest::from_bytes(b"{}"), 2),
            vec![OciDescriptor::new(layer_type, Digest::from_bytes(b"abc"), 3)],
        )
    }

    #[test]
    fn encrypt_appends_suffix() {
        let mut m = sample(OCI_LAYER);
        let mut info = m.layers[0].blob_info();
        info.compression_operation = LayerCompression::Compress;
        info.compression_algorithm = Some(Algorithm::Gzip);
        info.crypto_operation = CryptoOperation::Encrypt;
        m.update_layer_infos(&[info]).unwrap();
        assert_eq!(m.layers[0].media_type, "application/vnd.oci.image.layer.v1.tar+gzip+encrypted");
    }

    #[test]
    fn decrypt_strips_suffix() {
        let mut m = sample("application/vnd.oci.image.layer.v1.tar+gzip+encrypted");
        let mut info = m.layers[0].blob_info();
        info.crypto_operation = CryptoOperation::Decrypt;
        m.update_layer_infos(&[info]).unwrap();
        assert_eq!(m.layers[0].media_type, OCI_LAYER_GZIP);
    }

    #[test]
    fn media_type_helpers() {
        assert!(encrypted_media_type("application/vnd.oci.image.layer.v1.tar+gzip+encrypted").is_err());
        assert!(encrypted_media_type("text/plain").is_err());
        assert!(decrypted_media_type(OCI_LAYER).is_err());
    }

    #[test]
    fn zstd_layers_are_recompressed_before_docker_conversion() {
        let m = sample(OCI_LAYER_ZSTD);
        assert!(m.to_schema2(None).is_err());

        let mut edit = m.layers[0].blob_info();
        edit.digest = Some(Digest::from_bytes(b"gz"));
        edit.compression_operation = LayerCompression::Compress;
        edit.compression_algorithm = Some(Algorithm::Gzip);
        let mut edits = vec![edit];
        let s2 = m.to_schema2(Some(&mut edits)).unwrap();
        assert_eq!(s2.layers[0].media_type, DOCKER_V2_SCHEMA2_LAYER);
        assert_eq!(edits[0].compression_operation, LayerCompression::PreserveOriginal);
        assert_eq!(s2.config.media_type, DOCKER_V2_SCHEMA2_CONFIG);
    }

    #[test]
    fn serialization_omits_empty_fields() {
        let m = sample(OCI_LAYER_GZIP);
        let s = String::from_utf8(serde_json::to_vec(&m).unwrap()).unwrap();
        assert!(!s.contains("annotations"));
        assert!(!s.contains("urls"));
        assert!(s.starts_with(r#"{"schemaVersion":2,"mediaType":"#));
    }
}
