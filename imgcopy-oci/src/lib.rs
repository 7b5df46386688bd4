//! Container image formats and registry access for imgcopy: digests,
//! compression descriptors, blob metadata, manifest formats, image
//! references and the registry HTTP client.

pub mod blob;
pub mod compression;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod reference;
pub mod registry;

pub use blob::{BlobInfo, CryptoOperation, LayerCompression};
pub use compression::Algorithm;
pub use digest::{Digest, DigestAlgorithm, Digester};
pub use error::{OciError, Result};
pub use reference::ImageRef;
pub use registry::{BlobStream, Credentials, RegistryClient, RegistryOptions};
