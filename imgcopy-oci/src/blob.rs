use std::collections::BTreeMap;

use crate::compression::Algorithm;
use crate::digest::Digest;

/// What should happen to a layer's compression when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerCompression {
    /// Keep the blob as it is, or, combined with an algorithm, record that the
    /// blob now uses that algorithm.
    #[default]
    PreserveOriginal,
    Decompress,
    Compress,
}

/// Encryption edits applied to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoOperation {
    #[default]
    PreserveOriginal,
    Encrypt,
    Decrypt,
}

/// Describes one content-addressed blob (a layer or a config).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlobInfo {
    /// `None` while the content has not been hashed yet.
    pub digest: Option<Digest>,
    /// `None` when unknown.
    pub size: Option<u64>,
    /// Locations for foreign layers.
    pub urls: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub media_type: String,

    /// Compression edit relative to the blob the manifest currently describes.
    pub compression_operation: LayerCompression,
    /// Algorithm for `Compress`, or the algorithm now in use for `PreserveOriginal`.
    pub compression_algorithm: Option<Algorithm>,
    pub crypto_operation: CryptoOperation,
}

impl BlobInfo {
    pub fn new(digest: Digest, size: Option<u64>, media_type: impl Into<String>) -> Self {
        Self {
            digest: Some(digest),
            size,
            media_type: media_type.into(),
            ..Default::default()
        }
    }

    /// Short label for logs: the digest, or `<unknown>`.
    pub fn digest_label(&self) -> String {
        self.digest
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}
