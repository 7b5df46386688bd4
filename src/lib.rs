//! imgcopy: copy container images between registries, OCI layouts and
//! plain directories.
//!
//! The engine reads an image through a source transport and writes it
//! through a destination transport, converting the manifest format,
//! (re)compressing, encrypting or decrypting layers on the way when the
//! destination asks for it. Blobs the destination already has are reused
//! and never read.
//!
//! # Example
//!
//! ```no_run
//! use imgcopy::copy::{copy_image, Options};
//! use imgcopy::policy::{Policy, PolicyContext};
//! use imgcopy::transport::parse_image_name;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let src = parse_image_name("docker://quay.io/example/app:1.0")?;
//!     let dest = parse_image_name("oci:/tmp/app-layout:1.0")?;
//!     let policy = PolicyContext::new(Policy::insecure_accept_anything());
//!
//!     let manifest = copy_image(
//!         &policy,
//!         dest.as_ref(),
//!         src.as_ref(),
//!         Options {
//!             report_writer: Some(Box::new(std::io::stdout())),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//!     println!("wrote {} manifest bytes", manifest.len());
//!     Ok(())
//! }
//! ```

// Engine
pub mod copy;
pub mod error;
pub mod image;
pub mod types;

// Pipeline stages
pub mod compression;
pub mod digesting;
pub mod encryption;
pub mod progress;

// Collaborators
pub mod blobinfocache;
pub mod config;
pub mod policy;
pub mod signature;
pub mod transport;

// Re-exports for convenience
pub use copy::{copy_image, ImageListSelection, Options};
pub use error::{Error, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::copy::{copy_image, ImageListSelection, Options};
    pub use crate::error::{Error, Result};
    pub use crate::policy::{Policy, PolicyContext};
    pub use crate::transport::parse_image_name;
    pub use crate::types::{ImageDestination, ImageReference, ImageSource, SystemContext};
    pub use imgcopy_oci::{Algorithm, Digest};
}
