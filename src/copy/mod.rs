//! The copy engine.
//!
//! [`copy_image`] moves one image, one instance of a list, or a whole list
//! from a source to a destination. Layers are reused, partially pulled or
//! streamed through the blob pipeline; manifests are converted when the
//! destination needs another format.

mod blob;
mod compression;
mod encryption;
pub mod manifest;
mod multiple;
mod sign;
mod single;

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use imgcopy_oci::manifest::{self as oci_manifest, wanted_platforms, ManifestList};
use imgcopy_oci::{Algorithm, BlobInfo, Digest, ImageRef};

use crate::blobinfocache::{BlobInfoCache, MemoryCache};
use crate::encryption::{DecryptConfig, EncryptConfig};
use crate::error::{Error, Result, ResultExt};
use crate::image::UnparsedImage;
use crate::policy::PolicyContext;
use crate::progress::{ProgressBars, ProgressProperties, ProgressSink};
use crate::signature::Signer;
use crate::types::{supports_multiple_images, ImageDestination, ImageReference, ImageSource, SystemContext};

pub use manifest::{determine_list_conversion, determine_manifest_conversion, ConversionInputs, ConversionPlan};

/// Blob copies in flight when nothing else is configured.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 6;

/// Which images to copy when the source is a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageListSelection {
    /// Only the instance matching the running system; the list is not copied.
    #[default]
    CopySystemImage,
    /// Every instance and the list itself.
    CopyAllImages,
    /// The instances named in [`Options::instances`], and the list.
    CopySpecificImages,
}

/// Inputs of [`copy_image`].
#[derive(Default)]
pub struct Options {
    /// Do not carry source signatures over.
    pub remove_signatures: bool,
    /// Sign the copied image with these.
    pub signers: Vec<Arc<dyn Signer>>,
    /// Also sign with the Ed25519 key at this path.
    pub sign_by_key_path: Option<PathBuf>,
    pub sign_passphrase: Option<SecretString>,
    /// Identity to sign as; defaults to the destination's registry reference.
    pub sign_identity: Option<ImageRef>,
    /// Receives "Copying blob …" style status lines.
    pub report_writer: Option<Box<dyn Write + Send>>,
    pub source_ctx: SystemContext,
    pub destination_ctx: SystemContext,
    /// Minimum time between progress events for one blob.
    pub progress_interval: Duration,
    pub progress: Option<mpsc::Sender<ProgressProperties>>,
    /// Draw terminal progress bars on stderr.
    pub progress_bars: bool,
    pub force_manifest_mime_type: Option<String>,
    pub image_list_selection: ImageListSelection,
    /// For [`ImageListSelection::CopySpecificImages`].
    pub instances: Vec<Digest>,
    /// Fail rather than change any manifest digest.
    pub preserve_digests: bool,
    /// Layer indexes to encrypt; negative values count from the end and an
    /// empty list means every layer. `None` disables encryption.
    pub encrypt_layers: Option<Vec<i64>>,
    pub encrypt_config: Option<EncryptConfig>,
    pub decrypt_config: Option<DecryptConfig>,
    /// Shared limit on concurrent blob copies across calls.
    pub concurrent_blob_copies: Option<Arc<Semaphore>>,
    /// Limit on concurrent blob copies within this call; 0 means the default.
    pub max_parallel_downloads: usize,
    /// Skip the copy when the destination already holds an identical manifest.
    pub optimize_destination_image_already_exists: bool,
    /// Copy layers that name external URLs instead of keeping the URLs.
    pub download_foreign_layers: bool,
    /// For each platform of a copied list, add instances using these algorithms.
    pub ensure_compression_variants_exist: Vec<Algorithm>,
    /// Overrides `destination_ctx.compression_format`.
    pub compression_format: Option<Algorithm>,
    pub compression_level: Option<i32>,
    /// Only reuse blobs compressed with the destination's compression format.
    pub force_compression_format: bool,
    /// Prefer gzip instances over zstd ones when choosing from a list.
    pub prefer_gzip_instances: bool,
    /// Defaults to a fresh [`MemoryCache`].
    pub blob_info_cache: Option<Arc<dyn BlobInfoCache>>,
    pub cancel: CancellationToken,
}

impl Options {
    fn dest_compression_format(&self) -> Option<Algorithm> {
        self.compression_format
            .or(self.destination_ctx.compression_format)
    }

    fn dest_compression_level(&self) -> Option<i32> {
        self.compression_level
            .or(self.destination_ctx.compression_level)
    }

    fn require_compression_format_match(&self) -> Result<bool> {
        if self.force_compression_format && self.dest_compression_format().is_none() {
            return Err(Error::Config(
                "cannot use ForceCompressionFormat with undefined default compression format".into(),
            ));
        }
        Ok(self.force_compression_format)
    }
}

/// State shared by every image copied in one [`copy_image`] call.
pub(crate) struct Copier<'a> {
    policy: &'a PolicyContext,
    dest_ref: &'a dyn ImageReference,
    src_ref: &'a dyn ImageReference,
    dest: &'a dyn ImageDestination,
    raw_source: &'a dyn ImageSource,
    options: &'a Options,
    unparsed_toplevel: UnparsedImage<'a>,
    cache: Arc<dyn BlobInfoCache>,
    bars: ProgressBars,
    progress: Option<ProgressSink>,
    report: Mutex<Option<Box<dyn Write + Send>>>,
    signers: Vec<Arc<dyn Signer>>,
    semaphore: Arc<Semaphore>,
}

impl Copier<'_> {
    pub(crate) fn report(&self, msg: impl AsRef<str>) {
        let mut guard = self.report.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(w) = guard.as_mut() {
            let _ = writeln!(w, "{}", msg.as_ref());
        }
    }

    fn report_copy_info(&self, kind: &str, info: &BlobInfo) {
        self.report(format!("Copying {} {}", kind, info.digest_label()));
    }

    async fn acquire_blob_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// Copy `src_ref` to `dest_ref`, returning the manifest written for the
/// top-level image: the list, or the single (possibly chosen) instance.
pub async fn copy_image(
    policy: &PolicyContext,
    dest_ref: &dyn ImageReference,
    src_ref: &dyn ImageReference,
    mut options: Options,
) -> Result<Vec<u8>> {
    let report = options.report_writer.take();
    let cancel = options.cancel.clone();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = run(policy, dest_ref, src_ref, &options, report) => res,
    }
}

async fn run(
    policy: &PolicyContext,
    dest_ref: &dyn ImageReference,
    src_ref: &dyn ImageReference,
    options: &Options,
    report: Option<Box<dyn Write + Send>>,
) -> Result<Vec<u8>> {
    if options.concurrent_blob_copies.is_some() && options.max_parallel_downloads != 0 {
        return Err(Error::Config(
            "Both ConcurrentBlobCopiesSemaphore and MaxParallelDownloads specified".into(),
        ));
    }

    let dest = dest_ref
        .new_image_destination(&options.destination_ctx)
        .await
        .with_context(|| format!("initializing destination {}", dest_ref))?;
    let raw_source = src_ref
        .new_image_source(&options.source_ctx)
        .await
        .with_context(|| format!("initializing source {}", src_ref))?;

    let res = with_endpoints(policy, dest_ref, src_ref, dest.as_ref(), raw_source.as_ref(), options, report).await;
    match (res, raw_source.close().await) {
        (Ok(m), Ok(())) => Ok(m),
        (Ok(_), Err(e)) => Err(e.context("closing source")),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            debug!(error = %close, "closing source after a failed copy");
            Err(e)
        }
    }
}

async fn with_endpoints(
    policy: &PolicyContext,
    dest_ref: &dyn ImageReference,
    src_ref: &dyn ImageReference,
    dest: &dyn ImageDestination,
    raw_source: &dyn ImageSource,
    options: &Options,
    report: Option<Box<dyn Write + Send>>,
) -> Result<Vec<u8>> {
    // Held for the whole call when blob copies cannot run in parallel here.
    let mut _external_permit: Option<OwnedSemaphorePermit> = None;
    let semaphore = if dest.has_thread_safe_put_blob() && raw_source.has_thread_safe_get_blob() {
        match &options.concurrent_blob_copies {
            Some(s) => s.clone(),
            None => {
                let max = match options.max_parallel_downloads {
                    0 => DEFAULT_MAX_PARALLEL_DOWNLOADS,
                    n => n,
                };
                Arc::new(Semaphore::new(max))
            }
        }
    } else {
        if let Some(external) = &options.concurrent_blob_copies {
            _external_permit = Some(
                external
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)
                    .context("acquiring semaphore for concurrent blob copies")?,
            );
        }
        Arc::new(Semaphore::new(1))
    };

    let (signers, signers_to_close) = sign::setup_signers(options)?;
    let copier = Copier {
        policy,
        dest_ref,
        src_ref,
        dest,
        raw_source,
        options,
        unparsed_toplevel: UnparsedImage::new(raw_source, src_ref, None),
        cache: options
            .blob_info_cache
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryCache::new())),
        bars: ProgressBars::new(options.progress_bars),
        progress: options
            .progress
            .clone()
            .filter(|_| !options.progress_interval.is_zero())
            .map(|tx| ProgressSink::new(tx, options.progress_interval)),
        report: Mutex::new(report),
        signers,
        semaphore,
    };
    let res = copier.copy_toplevel().await;
    sign::close_signers(&signers_to_close).await;
    res
}

impl Copier<'_> {
    async fn copy_toplevel(&self) -> Result<Vec<u8>> {
        let options = self.options;
        if options.image_list_selection == ImageListSelection::CopySpecificImages
            && !options.ensure_compression_variants_exist.is_empty()
        {
            return Err(Error::Unsupported(
                "EnsureCompressionVariantsExist is not implemented for CopySpecificImages".into(),
            ));
        }

        let (top_manifest, top_type) = self
            .unparsed_toplevel
            .manifest()
            .await
            .with_context(|| format!("determining manifest MIME type for {}", self.src_ref))?;
        let multi_image = oci_manifest::is_multi_image(top_type);

        let copied = if !multi_image {
            self.require_no_compression_variants()?;
            let require_match = options.require_compression_format_match()?;
            let single = self
                .copy_single_image(
                    &self.unparsed_toplevel,
                    None,
                    single::SingleImageOptions::new(require_match),
                )
                .await?;
            single.manifest
        } else if options.image_list_selection == ImageListSelection::CopySystemImage {
            self.require_no_compression_variants()?;
            let require_match = options.require_compression_format_match()?;
            let list = ManifestList::from_blob(top_manifest, top_type)
                .with_context(|| format!("parsing primary manifest as list for {}", self.src_ref))?;
            let ctx = &options.source_ctx;
            let wanted = wanted_platforms(
                ctx.architecture_choice.as_deref(),
                ctx.os_choice.as_deref(),
                ctx.variant_choice.as_deref(),
            );
            let instance = list
                .choose_instance(&wanted, options.prefer_gzip_instances)
                .with_context(|| format!("choosing an image from manifest list {}", self.src_ref))?;
            debug!(%instance, "Source is a manifest list; copying (only) the instance for the current system");
            let unparsed = UnparsedImage::new(self.raw_source, self.src_ref, Some(instance));
            let single = self
                .copy_single_image(&unparsed, None, single::SingleImageOptions::new(require_match))
                .await
                .context("copying system image from manifest list")?;
            single.manifest
        } else {
            if !supports_multiple_images(self.dest) {
                return Err(Error::Unsupported(format!(
                    "copying multiple images: destination transport {:?} does not support copying multiple images as a group",
                    self.dest_ref.transport_name()
                )));
            }
            if options.image_list_selection == ImageListSelection::CopyAllImages {
                debug!("Source is a manifest list; copying all instances");
            } else {
                debug!("Source is a manifest list; copying some instances");
            }
            self.copy_multiple_images().await?
        };

        self.dest
            .commit()
            .await
            .context("committing the finished image")?;
        Ok(copied)
    }

    fn require_no_compression_variants(&self) -> Result<()> {
        if self.options.ensure_compression_variants_exist.is_empty() {
            return Ok(());
        }
        Err(Error::Unsupported(
            "EnsureCompressionVariantsExist is not implemented when not creating a multi-architecture image"
                .into(),
        ))
    }

    /// Source signatures to carry over. Fails early if there are some and
    /// the destination cannot store them.
    async fn source_signatures(
        &self,
        unparsed: &UnparsedImage<'_>,
        getting_message: &str,
        checking_message: &str,
    ) -> Result<Vec<crate::signature::Signature>> {
        let sigs = if self.options.remove_signatures {
            Vec::new()
        } else {
            self.report(getting_message);
            unparsed
                .signatures()
                .await
                .context("reading signatures")?
                .to_vec()
        };
        if !sigs.is_empty() {
            self.report(checking_message);
            self.dest.supports_signatures().map_err(|e| {
                e.context(format!("can not copy signatures to {}", self.dest_ref))
            })?;
        }
        Ok(sigs)
    }

    /// Whether the destination reference pins a digest, and if so, that
    /// `manifest` (or the top-level manifest) matches it.
    async fn check_digested_destination(&self, manifest: &[u8], allow_toplevel: bool) -> Result<bool> {
        let Some(digest) = self.dest_ref.docker_reference().and_then(|r| r.digest) else {
            return Ok(false);
        };
        let matches = oci_manifest::matches_digest(manifest, &digest)
            .context("computing digest of source image's manifest")?;
        if matches {
            return Ok(true);
        }
        if allow_toplevel {
            let (list, _) = self
                .unparsed_toplevel
                .manifest()
                .await
                .context("reading manifest from source image")?;
            if oci_manifest::matches_digest(list, &digest)
                .context("computing digest of source image's manifest")?
            {
                return Ok(true);
            }
        }
        Err(Error::Manifest(
            "Digest of source image's manifest would not match destination reference".into(),
        ))
    }
}

/// Why a manifest may not be edited, if it may not.
fn cannot_modify_reason(has_signatures: bool, dest_is_digested: bool, preserve_digests: bool) -> Option<&'static str> {
    if preserve_digests {
        Some("Instructed to preserve digests")
    } else if dest_is_digested {
        Some("Destination specifies a digest")
    } else if has_signatures {
        Some("Would invalidate signatures")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_reasons_take_precedence() {
        assert_eq!(cannot_modify_reason(false, false, false), None);
        assert_eq!(
            cannot_modify_reason(true, false, false),
            Some("Would invalidate signatures")
        );
        assert_eq!(
            cannot_modify_reason(true, true, false),
            Some("Destination specifies a digest")
        );
        assert_eq!(
            cannot_modify_reason(true, true, true),
            Some("Instructed to preserve digests")
        );
    }

    #[test]
    fn forced_compression_needs_a_format() {
        let options = Options {
            force_compression_format: true,
            ..Default::default()
        };
        assert!(options.require_compression_format_match().is_err());

        let options = Options {
            force_compression_format: true,
            compression_format: Some(Algorithm::Zstd),
            ..Default::default()
        };
        assert!(options.require_compression_format_match().unwrap());
    }

    #[test]
    fn explicit_compression_overrides_context() {
        let options = Options {
            destination_ctx: SystemContext {
                compression_format: Some(Algorithm::Gzip),
                compression_level: Some(5),
                ..Default::default()
            },
            compression_format: Some(Algorithm::Zstd),
            ..Default::default()
        };
        assert_eq!(options.dest_compression_format(), Some(Algorithm::Zstd));
        assert_eq!(options.dest_compression_level(), Some(5));
    }
}
