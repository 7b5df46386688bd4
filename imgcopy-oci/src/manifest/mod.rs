//! Manifest formats: Docker schema1/schema2, OCI image manifests, and the
//! multi-image list formats.

mod list;
mod oci;
mod schema1;
mod schema2;

pub use list::{
    matches_platform, wanted_platforms, ListEdit, ListInstance, ManifestList, OciIndex, Schema2List,
    Schema2ListDescriptor, Schema2PlatformSpec, OCI_INSTANCE_ANNOTATION_ZSTD,
};
pub use oci::{decrypted_media_type, encrypted_media_type, OciDescriptor, OciManifest};
pub use schema1::{Schema1, Schema1FsLayer, Schema1History};
pub use schema2::{Schema2, Schema2Descriptor};

use serde::{Deserialize, Serialize};

use crate::blob::{BlobInfo, LayerCompression};
use crate::compression::Algorithm;
use crate::digest::Digest;
use crate::error::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const DOCKER_V2_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_V2_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_V2_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_V2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_V2_SCHEMA2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_V2_PLUGIN_CONFIG: &str = "application/vnd.docker.plugin.v1+json";
pub const DOCKER_V2_SCHEMA2_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED: &str =
    "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_V2_SCHEMA2_LAYER_ZSTD: &str =
    "application/vnd.docker.image.rootfs.diff.tar.zstd";
pub const DOCKER_V2_SCHEMA2_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar";
pub const DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const OCI_LAYER_NONDISTRIBUTABLE: &str = "application/vnd.oci.image.layer.nondistributable.v1.tar";
pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const OCI_LAYER_NONDISTRIBUTABLE_ZSTD: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

/// Suffix marking an encrypted layer media type.
pub const ENCRYPTED_SUFFIX: &str = "+encrypted";

/// Multi-image formats this crate can read and write, in preference order.
pub const SUPPORTED_LIST_MIME_TYPES: [&str; 2] = [DOCKER_V2_LIST, OCI_INDEX];

// ---------------------------------------------------------------------------
// Type detection and digests
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Sniffed {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(rename = "schemaVersion", default)]
    schema_version: u32,
    #[serde(default)]
    signatures: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<SniffedConfig>,
    #[serde(default)]
    manifests: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct SniffedConfig {
    #[serde(rename = "mediaType", default)]
    media_type: String,
}

/// Guess the MIME type of a manifest from its contents. Returns an empty
/// string when the contents are not recognizable.
pub fn guess_mime_type(manifest: &[u8]) -> String {
    let Ok(sniffed) = serde_json::from_slice::<Sniffed>(manifest) else {
        return String::new();
    };
    match sniffed.media_type.as_str() {
        DOCKER_V2_SCHEMA2 | DOCKER_V2_LIST | OCI_MANIFEST | OCI_INDEX => {
            return sniffed.media_type;
        }
        _ => {}
    }
    match sniffed.schema_version {
        1 => {
            if sniffed.signatures.is_some() {
                DOCKER_V2_SCHEMA1_SIGNED.to_string()
            } else {
                DOCKER_V2_SCHEMA1.to_string()
            }
        }
        2 => {
            let config_type = sniffed.config.map(|c| c.media_type).unwrap_or_default();
            match config_type.as_str() {
                OCI_CONFIG => return OCI_MANIFEST.to_string(),
                DOCKER_V2_SCHEMA2_CONFIG => return DOCKER_V2_SCHEMA2.to_string(),
                _ => {}
            }
            if sniffed.manifests.is_some_and(|m| !m.is_empty()) {
                if config_type.is_empty() {
                    return OCI_INDEX.to_string();
                }
                return config_type;
            }
            OCI_MANIFEST.to_string()
        }
        _ => String::new(),
    }
}

/// Collapse MIME types that need identical handling.
pub fn normalized_mime_type(input: &str) -> &str {
    match input {
        DOCKER_V2_SCHEMA1 | DOCKER_V2_SCHEMA1_SIGNED | OCI_MANIFEST | OCI_INDEX
        | DOCKER_V2_SCHEMA2 | DOCKER_V2_LIST => input,
        // Registries serving schema1 often use application/json, and anything
        // else unknown is treated the same way.
        _ => DOCKER_V2_SCHEMA1_SIGNED,
    }
}

pub fn is_multi_image(mime_type: &str) -> bool {
    matches!(mime_type, DOCKER_V2_LIST | OCI_INDEX)
}

/// The digest identifying a manifest. For signed schema1 manifests this is
/// the digest of the JWS payload rather than of the full blob.
pub fn manifest_digest(manifest: &[u8]) -> Result<Digest> {
    if guess_mime_type(manifest) == DOCKER_V2_SCHEMA1_SIGNED {
        let payload = schema1::jws_payload(manifest)?;
        return Ok(Digest::from_bytes(&payload));
    }
    Ok(Digest::from_bytes(manifest))
}

pub fn matches_digest(manifest: &[u8], expected: &Digest) -> Result<bool> {
    let algorithm = expected.algorithm()?;
    if algorithm == crate::digest::DigestAlgorithm::CANONICAL {
        return Ok(&manifest_digest(manifest)? == expected);
    }
    expected.matches(manifest)
}

/// Gzip is the only algorithm every manifest format can describe.
pub fn compression_universally_supported(algorithm: Algorithm) -> bool {
    algorithm == Algorithm::Gzip
}

pub fn mime_type_supports_compression(mime_type: &str, algorithm: Algorithm) -> bool {
    if compression_universally_supported(algorithm) {
        return true;
    }
    match algorithm {
        Algorithm::Zstd | Algorithm::ZstdChunked => mime_type == OCI_MANIFEST,
        Algorithm::Gzip | Algorithm::Bzip2 | Algorithm::Xz => false,
    }
}

pub fn mime_type_supports_encryption(mime_type: &str) -> bool {
    mime_type == OCI_MANIFEST
}

/// Constraints on a blob that may be reused in place of a fresh upload.
#[derive(Debug, Clone, Default)]
pub struct ReuseConditions {
    /// At least one of these formats must be able to describe the blob.
    pub possible_manifest_formats: Option<Vec<String>>,
    /// Only blobs compressed with this algorithm (or its variants) qualify.
    pub required_compression: Option<Algorithm>,
}

pub fn candidate_compression_matches_reuse_conditions(
    conditions: &ReuseConditions,
    candidate: Option<Algorithm>,
) -> bool {
    if let Some(required) = conditions.required_compression {
        match candidate {
            Some(c) if required.name() == c.name() || required.name() == c.base_variant_name() => {}
            _ => return false,
        }
    }
    if let (Some(formats), Some(c)) = (&conditions.possible_manifest_formats, candidate) {
        if !formats.iter().any(|mt| mime_type_supports_compression(mt, c)) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Layer compression variants
// ---------------------------------------------------------------------------

/// One family of layer MIME types that differ only by compression. The key is
/// the base algorithm name (`None` for uncompressed); a `None` value means the
/// variant is recognized but cannot be represented.
type VariantSet = &'static [(Option<&'static str>, Option<&'static str>)];

pub(crate) const SCHEMA2_VARIANTS: &[VariantSet] = &[
    &[
        (None, Some(DOCKER_V2_SCHEMA2_FOREIGN_LAYER)),
        (Some("gzip"), Some(DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP)),
        (Some("zstd"), None),
    ],
    &[
        (None, Some(DOCKER_V2_SCHEMA2_LAYER_UNCOMPRESSED)),
        (Some("gzip"), Some(DOCKER_V2_SCHEMA2_LAYER)),
        (Some("zstd"), None),
    ],
];

pub(crate) const OCI_VARIANTS: &[VariantSet] = &[
    &[
        (None, Some(OCI_LAYER_NONDISTRIBUTABLE)),
        (Some("gzip"), Some(OCI_LAYER_NONDISTRIBUTABLE_GZIP)),
        (Some("zstd"), Some(OCI_LAYER_NONDISTRIBUTABLE_ZSTD)),
    ],
    &[
        (None, Some(OCI_LAYER)),
        (Some("gzip"), Some(OCI_LAYER_GZIP)),
        (Some("zstd"), Some(OCI_LAYER_ZSTD)),
    ],
];

/// Schema1 has no layer MIME types; this stands in for all of them.
pub(crate) const SCHEMA1_FAKE_LAYER_TYPE: &str = DOCKER_V2_SCHEMA2_LAYER;
pub(crate) const SCHEMA1_VARIANTS: &[VariantSet] = &[&[
    (None, Some(SCHEMA1_FAKE_LAYER_TYPE)),
    (Some("gzip"), Some(SCHEMA1_FAKE_LAYER_TYPE)),
    (Some("zstd"), None),
]];

fn find_variant_set(table: &[VariantSet], mime_type: &str) -> Option<VariantSet> {
    table
        .iter()
        .copied()
        .find(|set| set.iter().any(|(_, mt)| *mt == Some(mime_type)))
}

pub(crate) fn variants_recognize(table: &[VariantSet], mime_type: &str) -> bool {
    find_variant_set(table, mime_type).is_some()
}

fn compression_variant_mime_type(
    table: &[VariantSet],
    mime_type: &str,
    algorithm: Option<Algorithm>,
) -> Result<String> {
    let name = algorithm.map(Algorithm::base_variant_name);
    let Some(set) = find_variant_set(table, mime_type) else {
        return Err(OciError::Manifest(match algorithm {
            Some(_) => format!("unsupported MIME type for compression: {:?}", mime_type),
            None => format!("unsupported MIME type for decompression: {:?}", mime_type),
        }));
    };
    match set.iter().find(|(key, _)| *key == name) {
        Some((_, Some(variant))) => Ok(variant.to_string()),
        Some((_, None)) | None => Err(OciError::CompressionIncompatible(match name {
            Some(name) if set.iter().any(|(key, _)| *key == Some(name)) => {
                format!("{} compression is not supported for type {:?}", name, mime_type)
            }
            Some(name) => format!(
                "unknown compressed with algorithm {} variant for type {:?}",
                name, mime_type
            ),
            None => format!("uncompressed variant is not supported for type {:?}", mime_type),
        })),
    }
}

/// The layer MIME type after applying the compression edit in `updated`.
pub(crate) fn updated_mime_type(
    table: &[VariantSet],
    mime_type: &str,
    updated: &BlobInfo,
) -> Result<String> {
    match updated.compression_operation {
        LayerCompression::PreserveOriginal => match updated.compression_algorithm {
            Some(alg) => compression_variant_mime_type(table, mime_type, Some(alg)),
            None => Ok(mime_type.to_string()),
        },
        LayerCompression::Decompress => compression_variant_mime_type(table, mime_type, None),
        LayerCompression::Compress => match updated.compression_algorithm {
            Some(alg) => compression_variant_mime_type(table, mime_type, Some(alg)),
            None => {
                tracing::debug!(
                    digest = %updated.digest_label(),
                    "compressed layer does not name its algorithm, keeping the original MIME type"
                );
                Ok(mime_type.to_string())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Single-image manifests
// ---------------------------------------------------------------------------

/// A layer as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub info: BlobInfo,
    /// Schema1 "throwaway" layers carry no filesystem content.
    pub empty_layer: bool,
}

/// Platform description used by lists and image configs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            ..Default::default()
        }
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// A parsed single-image manifest.
#[derive(Debug, Clone)]
pub enum Manifest {
    Schema1(Schema1),
    Schema2(Schema2),
    Oci(OciManifest),
}

impl Manifest {
    /// Parse `blob` as the given MIME type. Lists are rejected.
    pub fn from_blob(blob: &[u8], mime_type: &str) -> Result<Self> {
        match normalized_mime_type(mime_type) {
            DOCKER_V2_SCHEMA1 | DOCKER_V2_SCHEMA1_SIGNED => Ok(Self::Schema1(Schema1::parse(blob)?)),
            DOCKER_V2_SCHEMA2 => Ok(Self::Schema2(Schema2::parse(blob)?)),
            OCI_MANIFEST => Ok(Self::Oci(OciManifest::parse(blob)?)),
            other => Err(OciError::UnsupportedMediaType(format!(
                "{} is not a single-image manifest type",
                other
            ))),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Schema1(m) if m.signed => DOCKER_V2_SCHEMA1_SIGNED,
            Self::Schema1(_) => DOCKER_V2_SCHEMA1,
            Self::Schema2(_) => DOCKER_V2_SCHEMA2,
            Self::Oci(_) => OCI_MANIFEST,
        }
    }

    /// The config blob, or `None` for schema1 which embeds its config.
    pub fn config_info(&self) -> Option<BlobInfo> {
        match self {
            Self::Schema1(_) => None,
            Self::Schema2(m) => Some(m.config.blob_info()),
            Self::Oci(m) => Some(m.config.blob_info()),
        }
    }

    pub fn layer_infos(&self) -> Vec<LayerInfo> {
        match self {
            Self::Schema1(m) => m.layer_infos(),
            Self::Schema2(m) => m.layer_infos(),
            Self::Oci(m) => m.layer_infos(),
        }
    }

    pub fn update_layer_infos(&mut self, infos: &[BlobInfo]) -> Result<()> {
        match self {
            Self::Schema1(m) => m.update_layer_infos(infos),
            Self::Schema2(m) => m.update_layer_infos(infos),
            Self::Oci(m) => m.update_layer_infos(infos),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Self::Schema1(m) => m.serialize(),
            Self::Schema2(m) => Ok(serde_json::to_vec(m)?),
            Self::Oci(m) => Ok(serde_json::to_vec(m)?),
        }
    }

    /// Whether layers of `mime_type` may be recompressed within this format.
    pub fn can_change_layer_compression(&self, mime_type: &str) -> bool {
        match self {
            // There are no layer MIME types, assume a valid image.
            Self::Schema1(_) => true,
            Self::Schema2(_) => variants_recognize(SCHEMA2_VARIANTS, mime_type),
            Self::Oci(m) => {
                m.config.media_type == OCI_CONFIG && variants_recognize(OCI_VARIANTS, mime_type)
            }
        }
    }

    pub fn supports_encryption(&self) -> bool {
        matches!(self, Self::Oci(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn info(op: LayerCompression, alg: Option<Algorithm>) -> BlobInfo {
        BlobInfo {
            compression_operation: op,
            compression_algorithm: alg,
            ..Default::default()
        }
    }

    #[test]
    fn guess_mime_types() {
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#),
            DOCKER_V2_SCHEMA2
        );
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":2,"config":{"mediaType":"application/vnd.oci.image.config.v1+json"},"layers":[]}"#),
            OCI_MANIFEST
        );
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":2,"manifests":[{"digest":"x"}]}"#),
            OCI_INDEX
        );
        assert_eq!(guess_mime_type(br#"{"schemaVersion":1}"#), DOCKER_V2_SCHEMA1);
        assert_eq!(
            guess_mime_type(br#"{"schemaVersion":1,"signatures":[]}"#),
            DOCKER_V2_SCHEMA1_SIGNED
        );
        assert_eq!(guess_mime_type(b"not json"), "");
    }

    #[test]
    fn normalization_maps_unknown_to_signed_schema1() {
        assert_eq!(normalized_mime_type("application/json"), DOCKER_V2_SCHEMA1_SIGNED);
        assert_eq!(normalized_mime_type(DOCKER_V2_SCHEMA1), DOCKER_V2_SCHEMA1);
        assert_eq!(normalized_mime_type(OCI_INDEX), OCI_INDEX);
    }

    #[test]
    fn compression_support_by_format() {
        assert!(mime_type_supports_compression(DOCKER_V2_SCHEMA1_SIGNED, Algorithm::Gzip));
        assert!(mime_type_supports_compression(OCI_MANIFEST, Algorithm::ZstdChunked));
        assert!(!mime_type_supports_compression(DOCKER_V2_SCHEMA2, Algorithm::Zstd));
        assert!(!mime_type_supports_compression(OCI_MANIFEST, Algorithm::Xz));
    }

    #[test]
    fn reuse_conditions() {
        let required = ReuseConditions {
            required_compression: Some(Algorithm::Zstd),
            ..Default::default()
        };
        assert!(candidate_compression_matches_reuse_conditions(&required, Some(Algorithm::ZstdChunked)));
        assert!(!candidate_compression_matches_reuse_conditions(&required, Some(Algorithm::Gzip)));
        assert!(!candidate_compression_matches_reuse_conditions(&required, None));

        let formats = ReuseConditions {
            possible_manifest_formats: Some(vec![DOCKER_V2_SCHEMA2.to_string()]),
            ..Default::default()
        };
        assert!(!candidate_compression_matches_reuse_conditions(&formats, Some(Algorithm::Zstd)));
        assert!(candidate_compression_matches_reuse_conditions(&formats, None));
    }

    #[test]
    fn updated_mime_type_variants() {
        let gz = updated_mime_type(
            OCI_VARIANTS,
            OCI_LAYER,
            &info(LayerCompression::Compress, Some(Algorithm::Gzip)),
        )
        .unwrap();
        assert_eq!(gz, OCI_LAYER_GZIP);

        let chunked = updated_mime_type(
            OCI_VARIANTS,
            OCI_LAYER_GZIP,
            &info(LayerCompression::PreserveOriginal, Some(Algorithm::ZstdChunked)),
        )
        .unwrap();
        assert_eq!(chunked, OCI_LAYER_ZSTD);

        let plain = updated_mime_type(
            SCHEMA2_VARIANTS,
            DOCKER_V2_SCHEMA2_FOREIGN_LAYER_GZIP,
            &info(LayerCompression::Decompress, None),
        )
        .unwrap();
        assert_eq!(plain, DOCKER_V2_SCHEMA2_FOREIGN_LAYER);

        let err = updated_mime_type(
            SCHEMA2_VARIANTS,
            DOCKER_V2_SCHEMA2_LAYER,
            &info(LayerCompression::Compress, Some(Algorithm::Zstd)),
        )
        .unwrap_err();
        assert!(matches!(err, OciError::CompressionIncompatible(_)));
        assert_eq!(
            err.to_string(),
            format!("zstd compression is not supported for type {:?}", DOCKER_V2_SCHEMA2_LAYER)
        );

        let unknown = updated_mime_type(
            OCI_VARIANTS,
            "application/octet-stream",
            &info(LayerCompression::Decompress, None),
        )
        .unwrap_err();
        assert!(matches!(unknown, OciError::Manifest(_)));
    }
}
