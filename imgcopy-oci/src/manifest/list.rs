use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    normalized_mime_type, OciDescriptor, Platform, DOCKER_V2_LIST, DOCKER_V2_SCHEMA1,
    DOCKER_V2_SCHEMA1_SIGNED, DOCKER_V2_SCHEMA2, OCI_INDEX, OCI_MANIFEST,
};
use crate::compression::Algorithm;
use crate::digest::Digest;
use crate::error::{OciError, Result};

/// Marks an OCI index entry whose layers are zstd-compressed.
pub const OCI_INSTANCE_ANNOTATION_ZSTD: &str = "io.github.containers.compression.zstd";
const OCI_INSTANCE_ANNOTATION_ZSTD_VALUE: &str = "true";

// ---------------------------------------------------------------------------
// Docker manifest list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema2PlatformSpec {
    #[serde(flatten)]
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema2ListDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: i64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    pub platform: Schema2PlatformSpec,
}

/// application/vnd.docker.distribution.manifest.list.v2+json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema2List {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<Schema2ListDescriptor>,
}

// ---------------------------------------------------------------------------
// OCI image index
// ---------------------------------------------------------------------------

/// application/vnd.oci.image.index.v1+json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub manifests: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<OciDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciIndex {
    pub fn from_components(manifests: Vec<OciDescriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_INDEX.to_string(),
            artifact_type: None,
            manifests,
            subject: None,
            annotations: BTreeMap::new(),
        }
    }
}

fn instance_is_zstd(d: &OciDescriptor) -> bool {
    d.annotations.get(OCI_INSTANCE_ANNOTATION_ZSTD).map(String::as_str)
        == Some(OCI_INSTANCE_ANNOTATION_ZSTD_VALUE)
}

fn add_compression_annotations(algorithms: &[Algorithm], annotations: &mut BTreeMap<String, String>) {
    for alg in algorithms {
        if alg.base_variant() == Algorithm::Zstd {
            annotations.insert(
                OCI_INSTANCE_ANNOTATION_ZSTD.to_string(),
                OCI_INSTANCE_ANNOTATION_ZSTD_VALUE.to_string(),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Generic list operations
// ---------------------------------------------------------------------------

/// Metadata of one list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListInstance {
    pub digest: Digest,
    pub size: i64,
    pub media_type: String,
    pub platform: Option<Platform>,
    pub annotations: BTreeMap<String, String>,
    /// Compression algorithms the entry is known to use.
    pub compression_algorithm_names: Vec<String>,
    pub artifact_type: Option<String>,
}

/// A change to a list's entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEdit {
    Update {
        old_digest: Digest,
        digest: Digest,
        size: i64,
        media_type: String,
        /// Replace annotations instead of merging them.
        affect_annotations: bool,
        annotations: Option<BTreeMap<String, String>>,
        compression_algorithms: Vec<Algorithm>,
    },
    Add {
        digest: Digest,
        size: i64,
        media_type: String,
        artifact_type: Option<String>,
        platform: Option<Platform>,
        annotations: BTreeMap<String, String>,
        compression_algorithms: Vec<Algorithm>,
    },
}

/// A parsed multi-image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestList {
    Schema2(Schema2List),
    Oci(OciIndex),
}

impl ManifestList {
    pub fn from_blob(blob: &[u8], mime_type: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(blob)?;
        for field in ["config", "layers", "fsLayers", "history"] {
            if raw.get(field).is_some() {
                return Err(OciError::Manifest(format!(
                    "manifest list contains a {:?} field",
                    field
                )));
            }
        }
        match normalized_mime_type(mime_type) {
            DOCKER_V2_LIST => Ok(Self::Schema2(serde_json::from_value(raw)?)),
            OCI_INDEX => Ok(Self::Oci(serde_json::from_value(raw)?)),
            other => Err(OciError::UnsupportedMediaType(format!(
                "{} is not a manifest list type",
                other
            ))),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Schema2(_) => DOCKER_V2_LIST,
            Self::Oci(_) => OCI_INDEX,
        }
    }

    pub fn instances(&self) -> Vec<Digest> {
        match self {
            Self::Schema2(l) => l.manifests.iter().map(|m| m.digest.clone()).collect(),
            Self::Oci(l) => l.manifests.iter().map(|m| m.digest.clone()).collect(),
        }
    }

    pub fn instance(&self, digest: &Digest) -> Result<ListInstance> {
        match self {
            Self::Schema2(l) => l
                .manifests
                .iter()
                .find(|m| &m.digest == digest)
                .map(|m| ListInstance {
                    digest: m.digest.clone(),
                    size: m.size,
                    media_type: m.media_type.clone(),
                    platform: Some(m.platform.platform.clone()),
                    annotations: BTreeMap::new(),
                    // Docker lists cannot describe anything else.
                    compression_algorithm_names: vec![Algorithm::Gzip.name().to_string()],
                    artifact_type: None,
                })
                .ok_or_else(|| {
                    OciError::Manifest(format!(
                        "unable to find instance {} passed to Schema2List.Instances",
                        digest
                    ))
                }),
            Self::Oci(l) => l
                .manifests
                .iter()
                .find(|m| &m.digest == digest)
                .map(|m| ListInstance {
                    digest: m.digest.clone(),
                    size: m.size,
                    media_type: m.media_type.clone(),
                    platform: m.platform.clone(),
                    annotations: m.annotations.clone(),
                    compression_algorithm_names: if instance_is_zstd(m) {
                        vec![Algorithm::Zstd.name().to_string()]
                    } else {
                        vec![Algorithm::Gzip.name().to_string()]
                    },
                    artifact_type: m.artifact_type.clone(),
                })
                .ok_or_else(|| {
                    OciError::Manifest(format!("unable to find instance {} in OCI1Index", digest))
                }),
        }
    }

    pub fn edit_instances(&mut self, edits: &[ListEdit]) -> Result<()> {
        match self {
            Self::Schema2(l) => edit_schema2_list(l, edits),
            Self::Oci(l) => edit_oci_index(l, edits),
        }
    }

    /// Pick the instance best matching `wanted` (most preferred first).
    pub fn choose_instance(&self, wanted: &[Platform], prefer_gzip: bool) -> Result<Digest> {
        let first = wanted.first().cloned().unwrap_or_default();
        match self {
            Self::Schema2(l) => {
                for w in wanted {
                    if let Some(d) = l.manifests.iter().find(|d| matches_platform(&d.platform.platform, w)) {
                        return Ok(d.digest.clone());
                    }
                }
                Err(OciError::Manifest(format!(
                    "no image found in manifest list for architecture {:?}, variant {:?}, OS {:?}",
                    first.architecture, first.variant, first.os
                )))
            }
            Self::Oci(l) => {
                // (platform rank, zstd rank, position)
                let mut best: Option<((usize, bool, usize), &Digest)> = None;
                for (position, d) in l.manifests.iter().enumerate() {
                    let platform_rank = match &d.platform {
                        Some(p) => match wanted.iter().position(|w| matches_platform(p, w)) {
                            Some(i) => i,
                            None => continue,
                        },
                        None => usize::MAX,
                    };
                    // false sorts first
                    let zstd_rank = instance_is_zstd(d) == prefer_gzip;
                    let key = (platform_rank, zstd_rank, position);
                    if best.as_ref().is_none_or(|(k, _)| key < *k) {
                        best = Some((key, &d.digest));
                    }
                }
                best.map(|(_, d)| d.clone()).ok_or_else(|| {
                    OciError::Manifest(format!(
                        "no image found in image index for architecture {:?}, variant {:?}, OS {:?}",
                        first.architecture, first.variant, first.os
                    ))
                })
            }
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Schema2(l) => serde_json::to_vec(l)?,
            Self::Oci(l) => serde_json::to_vec(l)?,
        })
    }

    pub fn convert_to(&self, mime_type: &str) -> Result<ManifestList> {
        match normalized_mime_type(mime_type) {
            DOCKER_V2_LIST => Ok(Self::Schema2(self.to_schema2_list())),
            OCI_INDEX => Ok(Self::Oci(self.to_oci_index())),
            DOCKER_V2_SCHEMA1 | DOCKER_V2_SCHEMA1_SIGNED | OCI_MANIFEST | DOCKER_V2_SCHEMA2 => {
                Err(OciError::Manifest(format!(
                    "Can not convert manifest list to MIME type {:?}, which is not a list type",
                    mime_type
                )))
            }
            _ => Err(OciError::Manifest(format!(
                "Unimplemented manifest MIME type {}",
                mime_type
            ))),
        }
    }

    fn to_schema2_list(&self) -> Schema2List {
        match self {
            Self::Schema2(l) => l.clone(),
            Self::Oci(l) => Schema2List {
                schema_version: 2,
                media_type: DOCKER_V2_LIST.to_string(),
                manifests: l
                    .manifests
                    .iter()
                    .map(|m| Schema2ListDescriptor {
                        media_type: m.media_type.clone(),
                        size: m.size,
                        digest: m.digest.clone(),
                        urls: m.urls.clone(),
                        platform: Schema2PlatformSpec {
                            platform: m.platform.clone().unwrap_or_else(Platform::host),
                            features: Vec::new(),
                        },
                    })
                    .collect(),
            },
        }
    }

    fn to_oci_index(&self) -> OciIndex {
        match self {
            Self::Oci(l) => l.clone(),
            Self::Schema2(l) => OciIndex::from_components(
                l.manifests
                    .iter()
                    .map(|m| {
                        let mut d = OciDescriptor::new(&m.media_type, m.digest.clone(), m.size);
                        d.urls = m.urls.clone();
                        d.platform = Some(m.platform.platform.clone());
                        d
                    })
                    .collect(),
            ),
        }
    }
}

/// Whether an image built for `image` satisfies `wanted`.
pub fn matches_platform(image: &Platform, wanted: &Platform) -> bool {
    image.architecture == wanted.architecture
        && image.os == wanted.os
        && image.variant == wanted.variant
}

fn check_update(i: usize, total: usize, size: i64, media_type: &str) -> Result<()> {
    if size < 0 {
        return Err(OciError::Manifest(format!(
            "update {} of {} passed to EditInstances had an invalid size ({})",
            i + 1,
            total,
            size
        )));
    }
    if media_type.is_empty() {
        return Err(OciError::Manifest(format!(
            "update {} of {} passed to EditInstances had no media type",
            i + 1,
            total
        )));
    }
    Ok(())
}

fn edit_schema2_list(list: &mut Schema2List, edits: &[ListEdit]) -> Result<()> {
    let mut added = Vec::new();
    for (i, edit) in edits.iter().enumerate() {
        match edit {
            ListEdit::Update {
                old_digest,
                digest,
                size,
                media_type,
                ..
            } => {
                let target = list
                    .manifests
                    .iter_mut()
                    .find(|m| &m.digest == old_digest)
                    .ok_or_else(|| {
                        OciError::Manifest(format!(
                            "Schema2List.EditInstances: digest {} not found",
                            old_digest
                        ))
                    })?;
                check_update(i, edits.len(), *size, media_type)?;
                target.digest = digest.clone();
                target.size = *size;
                target.media_type = media_type.clone();
            }
            ListEdit::Add {
                digest,
                size,
                media_type,
                platform,
                ..
            } => {
                let platform = platform.clone().ok_or_else(|| {
                    OciError::Manifest(
                        "adding a schema2 list instance with no platform specified is not supported"
                            .into(),
                    )
                })?;
                added.push(Schema2ListDescriptor {
                    media_type: media_type.clone(),
                    size: *size,
                    digest: digest.clone(),
                    urls: Vec::new(),
                    platform: Schema2PlatformSpec {
                        platform,
                        features: Vec::new(),
                    },
                });
            }
        }
    }
    list.manifests.extend(added);
    Ok(())
}

fn edit_oci_index(index: &mut OciIndex, edits: &[ListEdit]) -> Result<()> {
    let mut added = Vec::new();
    let mut updated_annotations = false;
    for (i, edit) in edits.iter().enumerate() {
        match edit {
            ListEdit::Update {
                old_digest,
                digest,
                size,
                media_type,
                affect_annotations,
                annotations,
                compression_algorithms,
            } => {
                let target = index
                    .manifests
                    .iter_mut()
                    .find(|m| &m.digest == old_digest)
                    .ok_or_else(|| {
                        OciError::Manifest(format!(
                            "OCI1Index.EditInstances: digest {} not found",
                            old_digest
                        ))
                    })?;
                check_update(i, edits.len(), *size, media_type)?;
                target.digest = digest.clone();
                target.size = *size;
                target.media_type = media_type.clone();
                if let Some(annotations) = annotations {
                    updated_annotations = true;
                    if *affect_annotations {
                        target.annotations = annotations.clone();
                    } else {
                        target
                            .annotations
                            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                add_compression_annotations(compression_algorithms, &mut target.annotations);
            }
            ListEdit::Add {
                digest,
                size,
                media_type,
                artifact_type,
                platform,
                annotations,
                compression_algorithms,
            } => {
                let mut annotations = annotations.clone();
                add_compression_annotations(compression_algorithms, &mut annotations);
                let mut d = OciDescriptor::new(media_type, digest.clone(), *size);
                d.artifact_type = artifact_type.clone();
                d.platform = platform.clone();
                d.annotations = annotations;
                added.push(d);
            }
        }
    }
    if !added.is_empty() || updated_annotations {
        index.manifests.extend(added);
        // Stable: gzip instances stay ahead of zstd ones for older clients.
        index.manifests.sort_by_key(instance_is_zstd);
    }
    Ok(())
}

/// Platforms acceptable for `arch`/`os`/`variant`, most preferred first.
pub fn wanted_platforms(arch: Option<&str>, os: Option<&str>, variant: Option<&str>) -> Vec<Platform> {
    let host = Platform::host();
    let wanted_arch = arch.unwrap_or(&host.architecture).to_string();
    let wanted_os = os.unwrap_or(&host.os).to_string();
    let compatibility: &[&str] = match wanted_arch.as_str() {
        "arm" => &["v8", "v7", "v6", "v5"],
        "arm64" => &["v8"],
        _ => &[],
    };
    let mut variants: Vec<String> = match variant.filter(|v| !v.is_empty()) {
        Some(v) => {
            let mut vs: Vec<String> = match compatibility.iter().position(|c| *c == v) {
                Some(i) => compatibility[i..].iter().map(|s| s.to_string()).collect(),
                None => vec![v.to_string()],
            };
            vs.push(String::new());
            vs
        }
        None => {
            let mut vs = vec![String::new()];
            vs.extend(compatibility.iter().map(|s| s.to_string()));
            vs
        }
    };
    variants.dedup();
    variants
        .into_iter()
        .map(|v| Platform {
            architecture: wanted_arch.clone(),
            os: wanted_os.clone(),
            variant: v,
            ..Default::default()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(arch: &str) -> Platform {
        Platform {
            architecture: arch.into(),
            os: "linux".into(),
            ..Default::default()
        }
    }

    fn index() -> ManifestList {
        let mut zstd = OciDescriptor::new(OCI_MANIFEST, Digest::from_bytes(b"amd64-zstd"), 10);
        zstd.platform = Some(platform("amd64"));
        zstd.annotations
            .insert(OCI_INSTANCE_ANNOTATION_ZSTD.into(), "true".into());
        let mut gzip = OciDescriptor::new(OCI_MANIFEST, Digest::from_bytes(b"amd64"), 10);
        gzip.platform = Some(platform("amd64"));
        let mut arm = OciDescriptor::new(OCI_MANIFEST, Digest::from_bytes(b"arm64"), 10);
        arm.platform = Some(platform("arm64"));
        ManifestList::Oci(OciIndex::from_components(vec![gzip, zstd, arm]))
    }

    #[test]
    fn compression_names() {
        let list = index();
        let zstd = list.instance(&Digest::from_bytes(b"amd64-zstd")).unwrap();
        assert_eq!(zstd.compression_algorithm_names, vec!["zstd"]);
        let gzip = list.instance(&Digest::from_bytes(b"amd64")).unwrap();
        assert_eq!(gzip.compression_algorithm_names, vec!["gzip"]);
        assert!(list.instance(&Digest::from_bytes(b"missing")).is_err());
    }

    #[test]
    fn choose_prefers_zstd_unless_gzip_requested() {
        let list = index();
        let wanted = vec![platform("amd64")];
        assert_eq!(
            list.choose_instance(&wanted, false).unwrap(),
            Digest::from_bytes(b"amd64-zstd")
        );
        assert_eq!(
            list.choose_instance(&wanted, true).unwrap(),
            Digest::from_bytes(b"amd64")
        );
        assert!(list.choose_instance(&[platform("s390x")], false).is_err());
    }

    #[test]
    fn add_sorts_zstd_last() {
        let mut list = index();
        list.edit_instances(&[ListEdit::Add {
            digest: Digest::from_bytes(b"arm64-zstd"),
            size: 5,
            media_type: OCI_MANIFEST.into(),
            artifact_type: None,
            platform: Some(platform("arm64")),
            annotations: BTreeMap::new(),
            compression_algorithms: vec![Algorithm::ZstdChunked],
        }])
        .unwrap();
        let ManifestList::Oci(idx) = &list else { unreachable!() };
        let zstd: Vec<bool> = idx.manifests.iter().map(instance_is_zstd).collect();
        assert_eq!(zstd, vec![false, false, true, true]);
        assert_eq!(idx.manifests.last().unwrap().digest, Digest::from_bytes(b"arm64-zstd"));
    }

    #[test]
    fn schema2_add_requires_platform() {
        let mut list = index().convert_to(DOCKER_V2_LIST).unwrap();
        let err = list
            .edit_instances(&[ListEdit::Add {
                digest: Digest::from_bytes(b"x"),
                size: 1,
                media_type: DOCKER_V2_SCHEMA2.into(),
                artifact_type: None,
                platform: None,
                annotations: BTreeMap::new(),
                compression_algorithms: vec![],
            }])
            .unwrap_err();
        assert!(err.to_string().contains("no platform"));
    }

    #[test]
    fn update_rejects_unknown_digest() {
        let mut list = index();
        let err = list
            .edit_instances(&[ListEdit::Update {
                old_digest: Digest::from_bytes(b"nope"),
                digest: Digest::from_bytes(b"new"),
                size: 1,
                media_type: OCI_MANIFEST.into(),
                affect_annotations: false,
                annotations: None,
                compression_algorithms: vec![],
            }])
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn wanted_arm_variants() {
        let w = wanted_platforms(Some("arm"), Some("linux"), Some("v7"));
        let variants: Vec<&str> = w.iter().map(|p| p.variant.as_str()).collect();
        assert_eq!(variants, vec!["v7", "v6", "v5", ""]);
    }

    #[test]
    fn conversion_round_trip_keeps_entries() {
        let list = index();
        let s2 = list.convert_to(DOCKER_V2_LIST).unwrap();
        assert_eq!(s2.instances(), list.instances());
        assert!(list.convert_to(OCI_MANIFEST).is_err());
    }
}
