/// Errors produced by the format layer and the registry client.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid digest {0:?}: {1}")]
    InvalidDigest(String, String),

    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedDigestAlgorithm(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A manifest format cannot describe a layer compressed with a given algorithm.
    #[error("{0}")]
    CompressionIncompatible(String),

    /// The registry refused a manifest of this MIME type.
    #[error("manifest type {media_type} rejected: {reason}")]
    ManifestTypeRejected { media_type: String, reason: String },

    #[error("unknown compression algorithm {0:?}")]
    UnknownCompression(String),

    #[error("invalid image reference {0:?}: {1}")]
    InvalidReference(String, String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
