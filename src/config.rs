//! File form of the copy options.
//!
//! A `CopyConfig` is loaded from YAML (`.yaml`/`.yml`) or JSON, validated,
//! then turned into [`crate::copy::Options`]. The CLI fills the same struct
//! from its flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use imgcopy_oci::manifest::{DOCKER_V2_SCHEMA1_SIGNED, DOCKER_V2_SCHEMA2, OCI_MANIFEST};
use imgcopy_oci::{Algorithm, Credentials, Digest, ImageRef};

use crate::copy::{ImageListSelection, Options};
pub use crate::copy::DEFAULT_MAX_PARALLEL_DOWNLOADS;
use crate::encryption::{DecryptConfig, EncryptConfig, Kek};
use crate::error::{Error, Result};
use crate::types::SystemContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyConfig {
    #[serde(default)]
    pub remove_signatures: bool,
    /// Ed25519 key file to sign the copied image with.
    #[serde(default)]
    pub sign_by_key: Option<PathBuf>,
    #[serde(default)]
    pub sign_passphrase_file: Option<PathBuf>,
    /// Reference written into signatures instead of the destination's.
    #[serde(default)]
    pub sign_identity: Option<String>,

    /// Compression for layers written to the destination (e.g. "gzip", "zstd").
    #[serde(default)]
    pub compression_format: Option<String>,
    #[serde(default)]
    pub compression_level: Option<i32>,
    /// Only reuse blobs compressed exactly with `compression_format`.
    #[serde(default)]
    pub force_compression_format: bool,
    /// "oci", "v2s2", "v2s1" or a full MIME type.
    #[serde(default)]
    pub force_manifest_mime_type: Option<String>,

    #[serde(default)]
    pub image_list_selection: ListSelection,
    /// Instance digests for [`ListSelection::Specific`].
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub preserve_digests: bool,

    /// Layer indexes to encrypt; negative values count from the end, an
    /// empty list means all layers.
    #[serde(default)]
    pub encrypt_layers: Option<Vec<i64>>,
    /// Recipient key files for encryption.
    #[serde(default)]
    pub encryption_keys: Vec<PathBuf>,
    #[serde(default)]
    pub decryption_keys: Vec<PathBuf>,

    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default)]
    pub optimize_destination_image_already_exists: bool,
    #[serde(default)]
    pub download_foreign_layers: bool,
    #[serde(default)]
    pub ensure_compression_variants_exist: Vec<String>,

    /// Minimum time between progress events, e.g. "500ms".
    #[serde(default = "default_progress_interval")]
    pub progress_interval: String,
    #[serde(default)]
    pub progress_bars: bool,

    /// Signature admission policy; accept anything when unset.
    #[serde(default)]
    pub policy: Option<PathBuf>,

    #[serde(default)]
    pub source: EndpointConfig,
    #[serde(default)]
    pub destination: EndpointConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSelection {
    /// The instance matching the host platform.
    #[default]
    System,
    All,
    Specific,
}

/// Per-endpoint settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    /// Plain HTTP to registries.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub dir_force_compress: bool,
    #[serde(default)]
    pub dir_force_decompress: bool,
    #[serde(default)]
    pub override_arch: Option<String>,
    #[serde(default)]
    pub override_os: Option<String>,
    #[serde(default)]
    pub override_variant: Option<String>,
}

fn default_max_parallel_downloads() -> usize {
    DEFAULT_MAX_PARALLEL_DOWNLOADS
}

fn default_progress_interval() -> String {
    "1s".to_string()
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(SecretString::from))
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            remove_signatures: false,
            sign_by_key: None,
            sign_passphrase_file: None,
            sign_identity: None,
            compression_format: None,
            compression_level: None,
            force_compression_format: false,
            force_manifest_mime_type: None,
            image_list_selection: ListSelection::default(),
            instances: Vec::new(),
            preserve_digests: false,
            encrypt_layers: None,
            encryption_keys: Vec::new(),
            decryption_keys: Vec::new(),
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            optimize_destination_image_already_exists: false,
            download_foreign_layers: false,
            ensure_compression_variants_exist: Vec::new(),
            progress_interval: default_progress_interval(),
            progress_bars: false,
            policy: None,
            source: EndpointConfig::default(),
            destination: EndpointConfig::default(),
        }
    }
}

/// Load a config file, YAML or JSON by extension.
pub fn load_config(path: &Path) -> Result<CopyConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let config: CopyConfig = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    };

    config.validate()?;
    Ok(config)
}

/// Map a `--format` style name to a manifest MIME type.
pub fn manifest_mime_type_by_name(name: &str) -> Result<&str> {
    match name {
        "oci" => Ok(OCI_MANIFEST),
        "v2s2" => Ok(DOCKER_V2_SCHEMA2),
        "v2s1" => Ok(DOCKER_V2_SCHEMA1_SIGNED),
        other if other.starts_with("application/") => Ok(other),
        other => Err(Error::Config(format!(
            "unknown manifest type {:?}, expected oci, v2s2 or v2s1",
            other
        ))),
    }
}

impl CopyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_downloads == 0 {
            return Err(Error::Config("max_parallel_downloads must be > 0".into()));
        }
        let format = self
            .compression_format
            .as_deref()
            .map(Algorithm::by_name)
            .transpose()
            .map_err(|e| Error::Config(e.to_string()))?;
        if let Some(level) = self.compression_level {
            let algorithm = format.unwrap_or(Algorithm::Gzip);
            if !algorithm.level_range().contains(&level) {
                return Err(Error::Config(format!(
                    "compression level {} is out of range {:?} for {}",
                    level,
                    algorithm.level_range(),
                    algorithm
                )));
            }
        }
        for name in &self.ensure_compression_variants_exist {
            Algorithm::by_name(name).map_err(|e| Error::Config(e.to_string()))?;
        }
        match self.image_list_selection {
            ListSelection::Specific if self.instances.is_empty() => {
                return Err(Error::Config(
                    "image_list_selection=specific requires at least one instance digest".into(),
                ));
            }
            ListSelection::Specific if !self.ensure_compression_variants_exist.is_empty() => {
                return Err(Error::Config(
                    "ensure_compression_variants_exist cannot be combined with specific image selection"
                        .into(),
                ));
            }
            _ => {}
        }
        for d in &self.instances {
            Digest::parse(d).map_err(|e| Error::Config(format!("instance {:?}: {}", d, e)))?;
        }
        if let Some(mt) = &self.force_manifest_mime_type {
            manifest_mime_type_by_name(mt)?;
        }
        if self.encrypt_layers.is_some() && self.encryption_keys.is_empty() {
            return Err(Error::Config(
                "encrypt_layers requires at least one encryption key".into(),
            ));
        }
        if let Some(identity) = &self.sign_identity {
            ImageRef::parse(identity).map_err(|e| Error::Config(e.to_string()))?;
        }
        for endpoint in [&self.source, &self.destination] {
            if endpoint.dir_force_compress && endpoint.dir_force_decompress {
                return Err(Error::Config(
                    "dir_force_compress and dir_force_decompress are mutually exclusive".into(),
                ));
            }
            if endpoint.password.is_some() && endpoint.username.is_none() {
                return Err(Error::Config("a password requires a username".into()));
            }
        }
        humantime::parse_duration(&self.progress_interval).map_err(|e| {
            Error::Config(format!("invalid progress_interval {:?}: {}", self.progress_interval, e))
        })?;
        Ok(())
    }

    pub fn progress_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.progress_interval)
            .map_err(|e| Error::Config(format!("invalid progress_interval: {}", e)))
    }

    /// Build copy options, reading any key files referenced.
    pub fn to_options(&self) -> Result<Options> {
        self.validate()?;

        let encrypt_config = if self.encryption_keys.is_empty() {
            None
        } else {
            Some(EncryptConfig {
                recipients: self
                    .encryption_keys
                    .iter()
                    .map(|p| Kek::from_file(p))
                    .collect::<Result<_>>()?,
            })
        };
        let decrypt_config = if self.decryption_keys.is_empty() {
            None
        } else {
            Some(DecryptConfig {
                keys: self
                    .decryption_keys
                    .iter()
                    .map(|p| Kek::from_file(p))
                    .collect::<Result<_>>()?,
            })
        };
        let sign_passphrase = match &self.sign_passphrase_file {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                Some(SecretString::from(text.trim_end_matches(['\r', '\n']).to_string()))
            }
            None => None,
        };

        Ok(Options {
            remove_signatures: self.remove_signatures,
            sign_by_key_path: self.sign_by_key.clone(),
            sign_passphrase,
            sign_identity: self
                .sign_identity
                .as_deref()
                .map(ImageRef::parse)
                .transpose()?,
            compression_format: self
                .compression_format
                .as_deref()
                .map(Algorithm::by_name)
                .transpose()?,
            compression_level: self.compression_level,
            force_compression_format: self.force_compression_format,
            force_manifest_mime_type: self
                .force_manifest_mime_type
                .as_deref()
                .map(|n| manifest_mime_type_by_name(n).map(str::to_string))
                .transpose()?,
            image_list_selection: match self.image_list_selection {
                ListSelection::System => ImageListSelection::CopySystemImage,
                ListSelection::All => ImageListSelection::CopyAllImages,
                ListSelection::Specific => ImageListSelection::CopySpecificImages,
            },
            instances: self
                .instances
                .iter()
                .map(|d| Digest::parse(d))
                .collect::<imgcopy_oci::Result<_>>()?,
            preserve_digests: self.preserve_digests,
            encrypt_layers: self.encrypt_layers.clone(),
            encrypt_config,
            decrypt_config,
            max_parallel_downloads: self.max_parallel_downloads,
            optimize_destination_image_already_exists: self
                .optimize_destination_image_already_exists,
            download_foreign_layers: self.download_foreign_layers,
            ensure_compression_variants_exist: self
                .ensure_compression_variants_exist
                .iter()
                .map(|n| Algorithm::by_name(n))
                .collect::<imgcopy_oci::Result<_>>()?,
            progress_interval: self.progress_interval()?,
            progress_bars: self.progress_bars,
            source_ctx: self.source.system_context(),
            destination_ctx: self.destination.system_context(),
            ..Options::default()
        })
    }
}

impl EndpointConfig {
    pub fn system_context(&self) -> SystemContext {
        SystemContext {
            architecture_choice: self.override_arch.clone(),
            os_choice: self.override_os.clone(),
            variant_choice: self.override_variant.clone(),
            registry_credentials: self.username.as_ref().map(|u| Credentials {
                username: u.clone(),
                password: self
                    .password
                    .clone()
                    .unwrap_or_else(|| SecretString::from(String::new())),
            }),
            registry_insecure: self.insecure,
            dir_force_compress: self.dir_force_compress,
            dir_force_decompress: self.dir_force_decompress,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn yaml_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "copy.yaml", "remove_signatures: true\n");
        let cfg = load_config(&path).unwrap();
        assert!(cfg.remove_signatures);
        assert_eq!(cfg.max_parallel_downloads, DEFAULT_MAX_PARALLEL_DOWNLOADS);
        assert_eq!(cfg.progress_interval().unwrap(), Duration::from_secs(1));
        assert_eq!(cfg.image_list_selection, ListSelection::System);
    }

    #[test]
    fn json_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "copy.json",
            r#"{"compression_format": "zstd", "progress_interval": "250ms",
                "destination": {"username": "u", "password": "p"}}"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.compression_format.as_deref(), Some("zstd"));
        let ctx = cfg.destination.system_context();
        assert_eq!(ctx.registry_credentials.unwrap().username, "u");
        assert!(!format!("{:?}", cfg.destination).contains("\"p\""));
    }

    #[test]
    fn rejects_invalid_settings() {
        let bad = [
            CopyConfig {
                max_parallel_downloads: 0,
                ..Default::default()
            },
            CopyConfig {
                compression_format: Some("lz4".into()),
                ..Default::default()
            },
            CopyConfig {
                image_list_selection: ListSelection::Specific,
                ..Default::default()
            },
            CopyConfig {
                image_list_selection: ListSelection::Specific,
                instances: vec![format!("sha256:{}", "a".repeat(64))],
                ensure_compression_variants_exist: vec!["zstd".into()],
                ..Default::default()
            },
            CopyConfig {
                compression_format: Some("gzip".into()),
                compression_level: Some(42),
                ..Default::default()
            },
            CopyConfig {
                progress_interval: "soon".into(),
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{:?} should be rejected", cfg);
        }
    }

    #[test]
    fn manifest_type_names() {
        assert_eq!(manifest_mime_type_by_name("oci").unwrap(), OCI_MANIFEST);
        assert_eq!(manifest_mime_type_by_name("v2s2").unwrap(), DOCKER_V2_SCHEMA2);
        assert!(manifest_mime_type_by_name("v3").is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "copy.yml", "remove_signature: true\n");
        assert!(load_config(&path).is_err());
    }
}
