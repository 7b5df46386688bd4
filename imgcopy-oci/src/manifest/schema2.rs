use serde::{Deserialize, Serialize};

use super::{
    updated_mime_type, LayerInfo, OciDescriptor, OciManifest, DOCKER_V2_LIST,
    DOCKER_V2_PLUGIN_CONFIG, DOCKER_V2_SCHEMA1, DOCKER_V2_SCHEMA1_SIGNED, DOCKER_V2_SCHEMA2,
    DOCKER_V2_SCHEMA2_CONFIG, DOCKER_V2_SCHEMA2_FOREIGN_LAYER,
    DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP, DOCKER_V2_SCHEMA2_LAYER,
    DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED, DOCKER_V2_SCHEMA2_LAYER_ZSTD, OCI_CONFIG, OCI_LAYER,
    OCI_LAYER_GZIP, OCI_LAYER_NONDISTRIBUTABLE, OCI_LAYER_NONDISTRIBUTABLE_GZIP, OCI_LAYER_ZSTD,
    SCHEMA2_VARIANTS,
};
use crate::blob::{BlobInfo, CryptoOperation};
use crate::digest::Digest;
use crate::error::{OciError, Result};

/// A Docker schema2 descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema2Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: i64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Schema2Descriptor {
    pub fn blob_info(&self) -> BlobInfo {
        BlobInfo {
            digest: Some(self.digest.clone()),
            size: u64::try_from(self.size).ok(),
            urls: self.urls.clone(),
            media_type: self.media_type.clone(),
            ..Default::default()
        }
    }
}

/// A Docker schema2 image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema2 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Schema2Descriptor,
    pub layers: Vec<Schema2Descriptor>,
}

fn check_schema2_media_type(mt: &str) -> Result<()> {
    match mt {
        DOCKER_V2_SCHEMA1
        | DOCKER_V2_SCHEMA1_SIGNED
        | DOCKER_V2_SCHEMA2_CONFIG
        | DOCKER_V2_SCHEMA2_FOREIGN_LAYER
        | DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP
        | DOCKER_V2_LIST
        | DOCKER_V2_SCHEMA2
        | DOCKER_V2_SCHEMA2_LAYER
        | DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED
        | DOCKER_V2_SCHEMA2_LAYER_ZSTD
        | DOCKER_V2_PLUGIN_CONFIG => Ok(()),
        other => Err(OciError::UnsupportedMediaType(format!(
            "unsupported docker v2s2 media type: {:?}",
            other
        ))),
    }
}

impl Schema2 {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(blob)?;
        if raw.get("manifests").is_some() {
            return Err(OciError::Manifest(format!(
                "{} manifest contains a \"manifests\" field",
                DOCKER_V2_SCHEMA2
            )));
        }
        let m: Schema2 = serde_json::from_value(raw)?;
        check_schema2_media_type(&m.media_type)?;
        for layer in &m.layers {
            check_schema2_media_type(&layer.media_type)?;
        }
        Ok(m)
    }

    pub fn from_components(config: Schema2Descriptor, layers: Vec<Schema2Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: DOCKER_V2_SCHEMA2.to_string(),
            config,
            layers,
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
            check_schema2_media_type(&layer.media_type).map_err(|_| {
                OciError::Manifest(format!(
                    "Error preparing updated manifest: unknown media type of original layer {:?}: {:?}",
                    digest.as_str(),
                    layer.media_type
                ))
            })?;
            if info.crypto_operation != CryptoOperation::PreserveOriginal {
                return Err(OciError::Manifest(format!(
                    "encryption change (for layer {:?}) is not supported in schema2 manifests",
                    digest.as_str()
                )));
            }
            layer.media_type = updated_mime_type(SCHEMA2_VARIANTS, &layer.media_type, info)
                .map_err(|e| with_layer_context(&digest, e))?;
            layer.digest = digest;
            layer.size = info.size.map(|s| s as i64).unwrap_or(-1);
            layer.urls = info.urls.clone();
        }
        Ok(())
    }

    /// Convert to an OCI manifest. `config` is the current config blob; the
    /// converted config blob is returned alongside the manifest.
    pub fn to_oci(&self, config: &[u8]) -> Result<(OciManifest, Vec<u8>)> {
        let oci_config = oci_config_from_docker(config)?;
        let config_desc = OciDescriptor::new(
            OCI_CONFIG,
            Digest::from_bytes(&oci_config),
            oci_config.len() as i64,
        );
        let layers = self
            .layers
            .iter()
            .map(|l| {
                let media_type = match l.media_type.as_str() {
                    DOCKER_V2_SCHEMA2_FOREIGN_LAYER => OCI_LAYER_NONDISTRIBUTABLE,
                    DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP => OCI_LAYER_NONDISTRIBUTABLE_GZIP,
                    DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED => OCI_LAYER,
                    DOCKER_V2_SCHEMA2_LAYER => OCI_LAYER_GZIP,
                    DOCKER_V2_SCHEMA2_LAYER_ZSTD => OCI_LAYER_ZSTD,
                    other => {
                        return Err(OciError::Manifest(format!(
                            "Unknown media type during manifest conversion: {:?}",
                            other
                        )))
                    }
                };
                let mut d = OciDescriptor::new(media_type, l.digest.clone(), l.size);
                d.urls = l.urls.clone();
                Ok(d)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((OciManifest::from_components(config_desc, layers), oci_config))
    }
}

pub(super) fn with_layer_context(digest: &Digest, e: OciError) -> OciError {
    match e {
        OciError::CompressionIncompatible(msg) => OciError::CompressionIncompatible(format!(
            "preparing updated manifest, layer {:?}: {}",
            digest.as_str(),
            msg
        )),
        other => OciError::Manifest(format!(
            "preparing updated manifest, layer {:?}: {}",
            digest.as_str(),
            other
        )),
    }
}

const OCI_CONFIG_FIELDS: [&str; 10] = [
    "created",
    "author",
    "architecture",
    "variant",
    "os",
    "os.version",
    "os.features",
    "config",
    "rootfs",
    "history",
];

const OCI_RUNTIME_CONFIG_FIELDS: [&str; 10] = [
    "User",
    "ExposedPorts",
    "Env",
    "Entrypoint",
    "Cmd",
    "Volumes",
    "WorkingDir",
    "Labels",
    "StopSignal",
    "ArgsEscaped",
];

/// Drop the Docker-only parts of an image config.
fn oci_config_from_docker(config: &[u8]) -> Result<Vec<u8>> {
    let serde_json::Value::Object(mut fields) = serde_json::from_slice(config)? else {
        return Err(OciError::Manifest("image config is not a JSON object".into()));
    };
    fields.retain(|k, _| OCI_CONFIG_FIELDS.contains(&k.as_str()));
    if let Some(serde_json::Value::Object(runtime)) = fields.get_mut("config") {
        runtime.retain(|k, v| OCI_RUNTIME_CONFIG_FIELDS.contains(&k.as_str()) && !v.is_null());
    }
    Ok(serde_json::to_vec(&fields)?)
}
