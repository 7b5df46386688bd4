//! Error types for imgcopy

use thiserror::Error;

use imgcopy_oci::OciError;

/// Result type alias using imgcopy Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while copying images
#[derive(Error, Debug)]
pub enum Error {
    /// Admission policy refused the source image
    #[error("Source image rejected: {0}")]
    PolicyRejected(String),

    /// Content did not hash to the expected digest
    #[error("Digest did not match, expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The destination refused a manifest MIME type
    #[error("manifest type {media_type} rejected: {reason}")]
    ManifestTypeRejected { media_type: String, reason: String },

    /// A manifest format cannot describe the layer compression in use
    #[error("{0}")]
    CompressionIncompatible(String),

    /// A code path broke an internal invariant, e.g. editing an immutable manifest
    #[error("Internal error: {0}")]
    Internal(String),

    /// Source or destination failures
    #[error("{0}")]
    Transport(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested behavior is not available
    #[error("{0}")]
    Unsupported(String),

    /// Manifest planning or editing errors
    #[error("{0}")]
    Manifest(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Format layer errors that have no closer match above
    #[error(transparent)]
    Oci(OciError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Wrap `self` with a description of what was being done.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    fn innermost(&self) -> &Error {
        let mut e = self;
        while let Error::Context { source, .. } = e {
            e = source;
        }
        e
    }

    pub fn is_manifest_type_rejected(&self) -> bool {
        matches!(self.innermost(), Error::ManifestTypeRejected { .. })
    }

    pub fn is_digest_mismatch(&self) -> bool {
        matches!(self.innermost(), Error::DigestMismatch { .. })
    }

    pub fn is_compression_incompatible(&self) -> bool {
        matches!(self.innermost(), Error::CompressionIncompatible(_))
    }

    /// Errors after which another manifest format may still succeed.
    pub fn allows_manifest_fallback(&self) -> bool {
        self.is_manifest_type_rejected() || self.is_compression_incompatible()
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.innermost(), Error::Internal(_))
    }
}

impl From<OciError> for Error {
    fn from(e: OciError) -> Self {
        match e {
            OciError::ManifestTypeRejected { media_type, reason } => {
                Error::ManifestTypeRejected { media_type, reason }
            }
            OciError::CompressionIncompatible(msg) => Error::CompressionIncompatible(msg),
            OciError::DigestMismatch { expected, actual } => {
                Error::DigestMismatch { expected, actual }
            }
            OciError::Io(e) => Error::Io(e),
            other => Error::Oci(other),
        }
    }
}

/// Attach context to the error of a `Result`.
pub(crate) trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_walks_context() {
        let e = Error::ManifestTypeRejected {
            media_type: "x".into(),
            reason: "no".into(),
        }
        .context("writing manifest")
        .context("copying image");
        assert!(e.is_manifest_type_rejected());
        assert!(e.allows_manifest_fallback());
        assert_eq!(
            e.to_string(),
            "copying image: writing manifest: manifest type x rejected: no"
        );
    }

    #[test]
    fn oci_errors_keep_their_class() {
        let e: Error = OciError::CompressionIncompatible("zstd".into()).into();
        assert!(e.is_compression_incompatible());
        let e: Error = OciError::Manifest("bad".into()).into();
        assert!(!e.allows_manifest_fallback());
    }

    #[test]
    fn digest_mismatch_survives_context() {
        let e = Error::DigestMismatch {
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into(),
        }
        .context("writing blob");
        assert!(e.is_digest_mismatch());
        assert!(!e.allows_manifest_fallback());
        assert!(!Error::Io(std::io::ErrorKind::InvalidData.into()).is_digest_mismatch());
    }

    #[test]
    fn internal_prefix() {
        let e = Error::Internal("edit forbidden".into()).context("layer 1");
        assert!(e.is_internal());
        assert_eq!(e.to_string(), "layer 1: Internal error: edit forbidden");
    }
}
