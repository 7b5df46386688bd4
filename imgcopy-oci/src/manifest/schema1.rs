use std::collections::HashSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{
    updated_mime_type, LayerInfo, OciManifest, Schema2, Schema2Descriptor,
    DOCKER_V2_SCHEMA2, DOCKER_V2_SCHEMA2_CONFIG, DOCKER_V2_SCHEMA2_LAYER,
    SCHEMA1_FAKE_LAYER_TYPE, SCHEMA1_VARIANTS,
};
use super::schema2::with_layer_context;
use crate::blob::{BlobInfo, CryptoOperation};
use crate::digest::Digest;
use crate::error::{OciError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema1FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    id: String,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    container_config: ContainerConfig,
    #[serde(default)]
    author: String,
    #[serde(default)]
    throwaway: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

/// A Docker schema1 manifest. Layers are stored newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema1 {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<Schema1FsLayer>,
    pub history: Vec<Schema1History>,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(skip)]
    extracted: Vec<V1Compatibility>,
    /// Whether the parsed blob carried JWS signatures. Edited manifests are
    /// always written unsigned.
    #[serde(skip)]
    pub(crate) signed: bool,
}

impl Schema1 {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(blob)?;
        for field in ["config", "layers", "manifests"] {
            if raw.get(field).is_some() {
                return Err(OciError::Manifest(format!(
                    "schema1 manifest contains a {:?} field",
                    field
                )));
            }
        }
        let signed = raw.get("signatures").is_some();
        let mut m: Schema1 = serde_json::from_value(raw)?;
        if m.schema_version != 1 {
            return Err(OciError::Manifest(format!(
                "unsupported schema version {}",
                m.schema_version
            )));
        }
        m.signed = signed;
        m.initialize()?;
        m.fix_manifest_layers()?;
        Ok(m)
    }

    fn initialize(&mut self) -> Result<()> {
        if self.fs_layers.len() != self.history.len() {
            return Err(OciError::Manifest(
                "length of history not equal to number of layers".into(),
            ));
        }
        if self.fs_layers.is_empty() {
            return Err(OciError::Manifest("no FSLayers in manifest".into()));
        }
        self.extracted = self
            .history
            .iter()
            .enumerate()
            .map(|(i, h)| {
                serde_json::from_str(&h.v1_compatibility).map_err(|e| {
                    OciError::Manifest(format!("parsing v2s1 history entry {}: {}", i, e))
                })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Validate the parent chain and drop consecutive duplicate entries.
    fn fix_manifest_layers(&mut self) -> Result<()> {
        for compat in &self.extracted {
            let valid = compat.id.len() == 64
                && compat
                    .id
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
            if !valid {
                return Err(OciError::Manifest(format!("image ID {:?} is invalid", compat.id)));
            }
        }
        if self.extracted.last().is_some_and(|c| !c.parent.is_empty()) {
            return Err(OciError::Manifest(
                "Invalid parent ID in the base layer of the image".into(),
            ));
        }
        let mut seen = HashSet::new();
        let mut last_id = "";
        for compat in &self.extracted {
            if compat.id != last_id && seen.contains(compat.id.as_str()) {
                return Err(OciError::Manifest(format!(
                    "ID {} appears multiple times in manifest",
                    compat.id
                )));
            }
            last_id = &compat.id;
            seen.insert(compat.id.as_str());
        }
        for i in (0..self.extracted.len().saturating_sub(1)).rev() {
            if self.extracted[i].id == self.extracted[i + 1].id {
                self.fs_layers.remove(i);
                self.history.remove(i);
                self.extracted.remove(i);
            } else if self.extracted[i].parent != self.extracted[i + 1].id {
                return Err(OciError::Manifest(format!(
                    "Invalid parent ID. Expected {}, got {:?}",
                    self.extracted[i + 1].id, self.extracted[i].parent
                )));
            }
        }
        Ok(())
    }

    pub fn layer_infos(&self) -> Vec<LayerInfo> {
        self.fs_layers
            .iter()
            .zip(&self.extracted)
            .rev()
            .map(|(layer, compat)| LayerInfo {
                info: BlobInfo {
                    digest: Some(layer.blob_sum.clone()),
                    ..Default::default()
                },
                empty_layer: compat.throwaway,
            })
            .collect()
    }

    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<()> {
        if self.fs_layers.len() != infos.len() {
            return Err(OciError::Manifest(format!(
                "Error preparing updated manifest: layer count changed from {} to {}",
                self.fs_layers.len(),
                infos.len()
            )));
        }
        let n = infos.len();
        for (i, info) in infos.iter().enumerate() {
            let digest = info.digest.clone().ok_or_else(|| {
                OciError::Manifest("preparing updated manifest: layer digest is unknown".into())
            })?;
            updated_mime_type(SCHEMA1_VARIANTS, SCHEMA1_FAKE_LAYER_TYPE, info)
                .map_err(|e| with_layer_context(&digest, e))?;
            if info.crypto_operation != CryptoOperation::PreserveOriginal {
                return Err(OciError::Manifest(format!(
                    "encryption change (for layer {:?}) is not supported in schema1 manifests",
                    digest.as_str()
                )));
            }
            self.fs_layers[n - 1 - i].blob_sum = digest;
        }
        self.signed = false;
        Ok(())
    }

    /// Whether the embedded name/tag differ from `path`/`tag`.
    pub fn embedded_reference_conflicts(&self, path: &str, tag: Option<&str>) -> bool {
        self.name != path || self.tag != tag.unwrap_or_default()
    }

    pub fn set_embedded_reference(&mut self, path: &str, tag: Option<&str>) {
        self.name = path.to_string();
        self.tag = tag.unwrap_or_default().to_string();
        self.signed = false;
    }

    /// The unsigned JSON form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Build a schema2 manifest and config.
    ///
    /// `uploaded` and `diff_ids` are indexed like [`Schema1::layer_infos`];
    /// `edits`, when given, is rewritten to drop throwaway layers.
    pub fn to_schema2(
        &self,
        uploaded: Option<&[BlobInfo]>,
        diff_ids: &[Option<Digest>],
        edits: Option<&mut Vec<BlobInfo>>,
    ) -> Result<(Schema2, Vec<u8>)> {
        let n = self.fs_layers.len();
        if self.extracted.len() != n {
            return Err(OciError::Manifest(format!(
                "Inconsistent schema 1 manifest: {} history entries, {} fsLayers entries",
                self.extracted.len(),
                n
            )));
        }
        if uploaded.is_some_and(|u| u.len() != n) {
            return Err(OciError::Manifest(format!(
                "Internal error: uploaded {} blobs, but schema1 manifest has {} fsLayers",
                uploaded.map(<[_]>::len).unwrap_or_default(),
                n
            )));
        }
        if diff_ids.len() != n {
            return Err(OciError::Manifest(format!(
                "Internal error: collected {} DiffID values, but schema1 manifest has {} fsLayers",
                diff_ids.len(),
                n
            )));
        }
        if let Some(edits) = edits.as_ref() {
            if edits.len() != n {
                return Err(OciError::Manifest(format!(
                    "Error converting image: layer edits for {} layers vs {} existing layers",
                    edits.len(),
                    n
                )));
            }
        }

        let mut layers = Vec::new();
        let mut kept_diff_ids = Vec::new();
        let mut kept_edits = Vec::new();
        for v1_index in (0..n).rev() {
            let v2_index = n - 1 - v1_index;
            if self.extracted[v1_index].throwaway {
                continue;
            }
            let size = uploaded
                .and_then(|u| u[v2_index].size)
                .map(|s| s as i64)
                .unwrap_or(-1);
            layers.push(Schema2Descriptor {
                media_type: DOCKER_V2_SCHEMA2_LAYER.to_string(),
                size,
                digest: self.fs_layers[v1_index].blob_sum.clone(),
                urls: Vec::new(),
            });
            let diff_id = diff_ids[v2_index].clone().ok_or_else(|| {
                OciError::Manifest(format!(
                    "Cannot convert to {} without the DiffID of layer {}",
                    DOCKER_V2_SCHEMA2, v2_index
                ))
            })?;
            kept_diff_ids.push(diff_id);
            if let Some(edits) = edits.as_ref() {
                kept_edits.push(edits[v2_index].clone());
            }
        }
        let config = self.to_schema2_config(&kept_diff_ids)?;
        let config_desc = Schema2Descriptor {
            media_type: DOCKER_V2_SCHEMA2_CONFIG.to_string(),
            size: config.len() as i64,
            digest: Digest::from_bytes(&config),
            urls: Vec::new(),
        };
        if let Some(edits) = edits {
            *edits = kept_edits;
        }
        Ok((Schema2::from_components(config_desc, layers), config))
    }

    /// Build an OCI manifest and config, via schema2.
    pub fn to_oci(
        &self,
        uploaded: Option<&[BlobInfo]>,
        diff_ids: &[Option<Digest>],
        edits: Option<&mut Vec<BlobInfo>>,
    ) -> Result<(OciManifest, Vec<u8>)> {
        let (s2, config) = self.to_schema2(uploaded, diff_ids, edits)?;
        s2.to_oci(&config)
    }

    fn to_schema2_config(&self, diff_ids: &[Digest]) -> Result<Vec<u8>> {
        let first = self
            .history
            .first()
            .ok_or_else(|| OciError::Manifest("image has no layers".into()))?;
        let serde_json::Value::Object(mut raw) = serde_json::from_str(&first.v1_compatibility)
            .map_err(|e| OciError::Manifest(format!("decoding configuration: {}", e)))?
        else {
            return Err(OciError::Manifest("decoding configuration: not an object".into()));
        };
        for key in ["id", "parent", "parent_id", "layer_id", "throwaway", "Size"] {
            raw.remove(key);
        }
        let history: Vec<serde_json::Value> = self
            .extracted
            .iter()
            .rev()
            .map(|compat| {
                let mut h = serde_json::Map::new();
                h.insert(
                    "created".into(),
                    serde_json::Value::String(
                        compat
                            .created
                            .clone()
                            .unwrap_or_else(|| "0001-01-01T00:00:00Z".to_string()),
                    ),
                );
                let created_by = compat
                    .container_config
                    .cmd
                    .as_deref()
                    .unwrap_or_default()
                    .join(" ");
                for (k, v) in [
                    ("author", compat.author.as_str()),
                    ("created_by", created_by.as_str()),
                    ("comment", compat.comment.as_str()),
                ] {
                    if !v.is_empty() {
                        h.insert(k.into(), serde_json::Value::String(v.to_string()));
                    }
                }
                if compat.throwaway {
                    h.insert("empty_layer".into(), serde_json::Value::Bool(true));
                }
                serde_json::Value::Object(h)
            })
            .collect();
        raw.insert(
            "rootfs".into(),
            serde_json::json!({ "type": "layers", "diff_ids": diff_ids }),
        );
        raw.insert("history".into(), serde_json::Value::Array(history));
        Ok(serde_json::to_vec(&raw)?)
    }
}

#[derive(Deserialize)]
struct JwsSignature {
    protected: String,
}

#[derive(Deserialize)]
struct JwsProtected {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

fn decode_b64url(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| OciError::Manifest(format!("invalid base64url in JWS header: {}", e)))
}

/// The signed payload of a "pretty JWS" schema1 manifest.
pub(crate) fn jws_payload(blob: &[u8]) -> Result<Vec<u8>> {
    #[derive(Deserialize)]
    struct Signed {
        #[serde(default)]
        signatures: Vec<JwsSignature>,
    }
    let signed: Signed = serde_json::from_slice(blob)?;
    let mut payload: Option<Vec<u8>> = None;
    for sig in &signed.signatures {
        let protected: JwsProtected = serde_json::from_slice(&decode_b64url(&sig.protected)?)?;
        if protected.format_length > blob.len() {
            return Err(OciError::Manifest("JWS formatLength exceeds manifest size".into()));
        }
        let mut p = blob[..protected.format_length].to_vec();
        p.extend_from_slice(&decode_b64url(&protected.format_tail)?);
        match &payload {
            Some(existing) if existing != &p => {
                return Err(OciError::Manifest("JWS signatures disagree on payload".into()));
            }
            Some(_) => {}
            None => payload = Some(p),
        }
    }
    payload.ok_or_else(|| OciError::Manifest("missing signatures in signed schema1 manifest".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_BASE: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const ID_TOP: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    fn sample_json() -> String {
        let top = serde_json::json!({
            "id": ID_TOP, "parent": ID_BASE, "created": "2020-01-01T00:00:00Z",
            "architecture": "amd64", "os": "linux",
            "container_config": {"Cmd": ["/bin/sh", "-c", "echo hi"]}
        });
        let base = serde_json::json!({
            "id": ID_BASE, "created": "2019-01-01T00:00:00Z", "throwaway": true
        });
        serde_json::json!({
            "schemaVersion": 1,
            "name": "library/busybox",
            "tag": "latest",
            "architecture": "amd64",
            "fsLayers": [
                {"blobSum": Digest::from_bytes(b"top").to_string()},
                {"blobSum": Digest::from_bytes(b"base").to_string()}
            ],
            "history": [
                {"v1Compatibility": top.to_string()},
                {"v1Compatibility": base.to_string()}
            ]
        })
        .to_string()
    }

    #[test]
    fn layer_infos_are_oldest_first() {
        let m = Schema1::parse(sample_json().as_bytes()).unwrap();
        let layers = m.layer_infos();
        assert_eq!(layers[0].info.digest, Some(Digest::from_bytes(b"base")));
        assert!(layers[0].empty_layer);
        assert!(!layers[1].empty_layer);
    }

    #[test]
    fn rejects_broken_parent_chain() {
        let s = sample_json().replace(&format!("\\\"parent\\\":\\\"{}\\\"", ID_BASE), "\\\"parent\\\":\\\"\\\"");
        assert!(Schema1::parse(s.as_bytes()).is_err());
    }

    #[test]
    fn converts_to_schema2_skipping_throwaway_layers() {
        let m = Schema1::parse(sample_json().as_bytes()).unwrap();
        let diff_ids = vec![Some(Digest::from_bytes(b"d0")), Some(Digest::from_bytes(b"d1"))];
        let (s2, config) = m.to_schema2(None, &diff_ids, None).unwrap();
        assert_eq!(s2.layers.len(), 1);
        assert_eq!(s2.layers[0].digest, Digest::from_bytes(b"top"));
        let v: serde_json::Value = serde_json::from_slice(&config).unwrap();
        assert_eq!(v["rootfs"]["diff_ids"][0], Digest::from_bytes(b"d1").to_string());
        assert!(v.get("id").is_none());
        assert_eq!(v["history"][1]["created_by"], "/bin/sh -c echo hi");
        assert_eq!(v["history"][0]["empty_layer"], true);
    }

    #[test]
    fn jws_payload_reassembles_tail() {
        let body = br#"{"schemaVersion":1}"#;
        let format_length = body.len() - 1;
        let tail = URL_SAFE_NO_PAD.encode(b"}");
        let protected = URL_SAFE_NO_PAD.encode(
            serde_json::json!({"formatLength": format_length, "formatTail": tail}).to_string(),
        );
        let mut signed = body[..format_length].to_vec();
        signed.extend_from_slice(
            format!(r#","signatures":[{{"protected":"{}"}}]}}"#, protected).as_bytes(),
        );
        assert_eq!(jws_payload(&signed).unwrap(), body.to_vec());
    }
}
