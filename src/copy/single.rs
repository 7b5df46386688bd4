//! Copying one single-image manifest with its layers and config.

use std::io::Cursor;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use imgcopy_oci::manifest::{
    self as oci_manifest, manifest_digest, matches_platform, wanted_platforms, ReuseConditions,
};
use imgcopy_oci::{Algorithm, BlobInfo, Digest};

use crate::error::{Error, Result, ResultExt};
use crate::image::{ManifestUpdates, PendingImage, SourcedImage, UnparsedImage, UpdateInformation};
use crate::types::{PartialPull, PutBlobPartialOptions, TryReusingBlobOptions};

use super::blob::{
    updated_blob_info_from_reuse, updated_blob_info_from_upload, BlobCopyOptions, ProgressChunkAccessor,
};
use super::compression::compression_edits_from_blob_info;
use super::encryption::layers_to_encrypt;
use super::manifest::{determine_manifest_conversion, ConversionInputs, ConversionPlan};
use super::{cannot_modify_reason, Copier};

/// Per-image overrides of the call-wide options.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct SingleImageOptions {
    /// Only reuse blobs that use the compression format.
    pub require_compression_format_match: bool,
    /// `None` uses the destination defaults.
    pub compression_format: Option<Algorithm>,
    pub compression_level: Option<i32>,
}

impl SingleImageOptions {
    pub fn new(require_compression_format_match: bool) -> Self {
        Self {
            require_compression_format_match,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub(super) struct SingleImageResult {
    pub manifest: Vec<u8>,
    pub manifest_mime_type: String,
    pub manifest_digest: Digest,
    /// Algorithms used by the written layers.
    pub compression_algorithms: Vec<Algorithm>,
}

/// State of one single-image copy.
pub(super) struct ImageCopier<'c, 'a> {
    pub c: &'c Copier<'a>,
    pub src: SourcedImage,
    manifest_updates: ManifestUpdates,
    update_info: UpdateInformation,
    plan: ConversionPlan,
    diff_ids_are_needed: bool,
    pub cannot_modify_manifest_reason: Option<&'static str>,
    can_substitute_blobs: bool,
    pub compression_format: Option<Algorithm>,
    pub compression_level: Option<i32>,
    require_compression_format_match: bool,
}

fn push_unique(algos: &mut Vec<Algorithm>, algorithm: Algorithm) {
    if !algos.iter().any(|a| a.name() == algorithm.name()) {
        algos.push(algorithm);
    }
}

impl Copier<'_> {
    /// Copy the image `unparsed` refers to. `target_instance` is set when the
    /// image is written as an instance of a list.
    pub(super) async fn copy_single_image(
        &self,
        unparsed: &UnparsedImage<'_>,
        target_instance: Option<&Digest>,
        opts: SingleImageOptions,
    ) -> Result<SingleImageResult> {
        let (blob, mime_type) = unparsed
            .manifest()
            .await
            .with_context(|| format!("reading manifest for {}", unparsed.reference()))?;
        let mime_type = if mime_type.is_empty() {
            oci_manifest::guess_mime_type(blob)
        } else {
            mime_type.to_string()
        };
        if oci_manifest::is_multi_image(&mime_type) {
            return Err(Error::Manifest(
                "Unexpectedly received a manifest list instead of a manifest for a single image".into(),
            ));
        }

        self.policy.is_running_image_allowed(unparsed).await?;

        let src = SourcedImage::from_unparsed(unparsed)
            .await
            .with_context(|| format!("initializing image from source {}", self.src_ref))?;

        let dest_is_digested = self.check_digested_destination(&src.manifest_blob, true).await?;
        self.check_destination_platform(&src).await?;

        let mut sigs = self
            .source_signatures(
                unparsed,
                "Getting image source signatures",
                "Checking if image destination supports signatures",
            )
            .await?;

        let options = self.options;
        let cannot_modify_manifest_reason =
            cannot_modify_reason(!sigs.is_empty(), dest_is_digested, options.preserve_digests);

        let (mut compression_format, compression_level) = match opts.compression_format {
            Some(f) => (Some(f), opts.compression_level),
            None => (options.dest_compression_format(), options.dest_compression_level()),
        };
        if options.encrypt_layers.is_some() && compression_format == Some(Algorithm::ZstdChunked) {
            if opts.require_compression_format_match {
                return Err(Error::Config(
                    "explicitly requested to combine zstd:chunked with encryption, which is not beneficial; use plain zstd instead"
                        .into(),
                ));
            }
            warn!("Compression using zstd:chunked is not beneficial for encrypted layers, using plain zstd instead");
            compression_format = Some(Algorithm::Zstd);
        }

        let mut manifest_updates = ManifestUpdates::default();
        if let Some(reference) = self.embedded_reference_update(&src, cannot_modify_manifest_reason)? {
            manifest_updates.embedded_docker_reference = Some(reference);
        }

        let requires_oci_encryption = (src.is_encrypted() && options.decrypt_config.is_none())
            || options.encrypt_layers.is_some();
        let dest_supported = self.dest.supported_manifest_mime_types();
        let plan = determine_manifest_conversion(&ConversionInputs {
            src_mime_type: &src.manifest_mime_type,
            dest_supported_mime_types: &dest_supported,
            force_manifest_mime_type: options.force_manifest_mime_type.as_deref(),
            requested_compression: compression_format,
            requires_oci_encryption,
            cannot_modify_manifest_reason,
        })?;
        // Set early: other decisions depend on the destination format.
        if plan.preferred_needs_conversion {
            manifest_updates.manifest_mime_type = Some(plan.preferred_mime_type.clone());
        }
        let diff_ids_are_needed = src.updated_image_needs_layer_diff_ids(&manifest_updates);

        let mut ic = ImageCopier {
            c: self,
            src,
            manifest_updates,
            update_info: UpdateInformation::default(),
            plan,
            diff_ids_are_needed,
            cannot_modify_manifest_reason,
            can_substitute_blobs: cannot_modify_manifest_reason.is_none() && self.signers.is_empty(),
            compression_format,
            compression_level,
            require_compression_format_match: opts.require_compression_format_match,
        };

        if options.optimize_destination_image_already_exists {
            let should_update_sigs = !sigs.is_empty() || !self.signers.is_empty();
            let no_pending_updates = ic.manifest_updates.is_empty();
            debug!(
                should_update_sigs,
                requires_oci_encryption,
                no_pending_updates,
                require_match = ic.require_compression_format_match,
                "Checking if we can skip copying"
            );
            if !should_update_sigs
                && !requires_oci_encryption
                && no_pending_updates
                && !ic.require_compression_format_match
            {
                if let Some(existing) = ic.compare_destination_manifest(target_instance).await? {
                    self.report("Skipping: image already present at destination");
                    return Ok(existing);
                }
            }
        }

        let compression_algorithms = ic.copy_layers().await?;

        // Registries may reject a manifest format only when it is uploaded,
        // so the other candidates are tried after a failure.
        let preferred = ic.plan.preferred_mime_type.clone();
        let (manifest, manifest_mime_type, manifest_digest) =
            match ic.copy_updated_config_and_manifest(target_instance).await {
                Ok((m, d)) => (m, preferred, d),
                Err(e) => {
                    debug!(mime_type = %preferred, error = %e, "Writing manifest using preferred type failed");
                    if !e.allows_manifest_fallback() || ic.plan.other_candidates.is_empty() {
                        return Err(e);
                    }
                    if let Some(reason) = ic.cannot_modify_manifest_reason {
                        return Err(e.context(format!(
                            "writing manifest failed and we cannot try conversions: {:?}",
                            reason
                        )));
                    }
                    let mut errs = vec![format!("{}({})", preferred, e)];
                    let mut written = None;
                    for candidate in ic.plan.other_candidates.clone() {
                        debug!(mime_type = %candidate, "Trying to use manifest type");
                        ic.manifest_updates.manifest_mime_type = Some(candidate.clone());
                        match ic.copy_updated_config_and_manifest(target_instance).await {
                            Ok((m, d)) => {
                                written = Some((m, candidate, d));
                                break;
                            }
                            Err(e) => {
                                debug!(mime_type = %candidate, error = %e, "Upload of manifest type failed");
                                errs.push(format!("{}({})", candidate, e));
                            }
                        }
                    }
                    written.ok_or_else(|| {
                        Error::Manifest(format!(
                            "Uploading manifest failed, attempted the following formats: {}",
                            errs.join(", ")
                        ))
                    })?
                }
            };
        let target_instance = target_instance.map(|_| &manifest_digest);

        let new_sigs = self
            .create_signatures(&manifest, options.sign_identity.as_ref())
            .await?;
        sigs.extend(new_sigs);
        if !sigs.is_empty() {
            self.report("Storing signatures");
            self.dest
                .put_signatures(&sigs, target_instance)
                .await
                .context("writing signatures")?;
        }

        Ok(SingleImageResult {
            manifest,
            manifest_mime_type,
            manifest_digest,
            compression_algorithms,
        })
    }

    /// Destinations that run images note when the image is for another
    /// platform. This is informational only.
    async fn check_destination_platform(&self, src: &SourcedImage) -> Result<()> {
        if !self.dest.must_match_runtime_os() {
            return Ok(());
        }
        let platform = src
            .platform(self.raw_source, self.cache.as_ref())
            .await
            .context("parsing image configuration")?;
        let ctx = &self.options.destination_ctx;
        let wanted = wanted_platforms(
            ctx.architecture_choice.as_deref(),
            ctx.os_choice.as_deref(),
            ctx.variant_choice.as_deref(),
        );
        if !wanted.iter().any(|w| matches_platform(&platform, w)) {
            let options: Vec<String> = wanted
                .iter()
                .map(|w| format!("{}+{}+{:?}", w.os, w.architecture, w.variant))
                .collect();
            info!(
                "Image operating system mismatch: image uses OS {:?}+architecture {:?}+{:?}, expecting one of {:?}",
                platform.os,
                platform.architecture,
                platform.variant,
                options.join(", ")
            );
        }
        Ok(())
    }

    /// The name to embed in a schema1 manifest written to the destination,
    /// if it differs from the current one.
    fn embedded_reference_update(
        &self,
        src: &SourcedImage,
        cannot_modify_manifest_reason: Option<&str>,
    ) -> Result<Option<imgcopy_oci::ImageRef>> {
        if self.dest.ignores_embedded_docker_reference() {
            return Ok(None);
        }
        let Some(dest_ref) = self.dest_ref.docker_reference() else {
            return Ok(None);
        };
        if !src.embedded_docker_reference_conflicts(&dest_ref) {
            return Ok(None);
        }
        if let Some(reason) = cannot_modify_manifest_reason {
            return Err(Error::Manifest(format!(
                "Copying a schema1 image with an embedded Docker reference to {} (Docker reference {}) would change the manifest, which we cannot do: {:?}",
                self.dest_ref, dest_ref, reason
            )));
        }
        Ok(Some(dest_ref))
    }
}

impl ImageCopier<'_, '_> {
    /// If the destination already holds this exact manifest, the result of
    /// copying it. Failures to read the destination mean "no".
    async fn compare_destination_manifest(
        &self,
        target_instance: Option<&Digest>,
    ) -> Result<Option<SingleImageResult>> {
        let src_digest = manifest_digest(&self.src.manifest_blob)?;
        let dest_source = match self
            .c
            .dest_ref
            .new_image_source(&self.c.options.destination_ctx)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                debug!(dest = %self.c.dest_ref, error = %e, "Unable to create destination image source");
                return Ok(None);
            }
        };
        let fetched = dest_source.get_manifest(target_instance).await;
        if let Err(e) = dest_source.close().await {
            debug!(error = %e, "closing destination image source");
        }
        let (dest_manifest, dest_mime_type) = match fetched {
            Ok(m) => m,
            Err(e) => {
                debug!(dest = %self.c.dest_ref, error = %e, "Unable to get destination image manifest");
                return Ok(None);
            }
        };
        if manifest_digest(&dest_manifest)? != src_digest {
            return Ok(None);
        }

        let mut compression_algorithms = Vec::new();
        for layer in self.src.layer_infos() {
            if let (_, Some(a)) = compression_edits_from_blob_info(&layer.info)? {
                push_unique(&mut compression_algorithms, a);
            }
        }
        Ok(Some(SingleImageResult {
            manifest: dest_manifest,
            manifest_mime_type: dest_mime_type,
            manifest_digest: src_digest,
            compression_algorithms,
        }))
    }

    /// Copy every layer, concurrently up to the blob permit limit, and record
    /// the manifest edits they need. Returns the algorithms of the written
    /// layers.
    async fn copy_layers(&mut self) -> Result<Vec<Algorithm>> {
        let src_layers = self.src.layer_infos();
        let count = src_layers.len();
        let to_encrypt = match &self.c.options.encrypt_layers {
            Some(indexes) => layers_to_encrypt(indexes, count)?,
            None => vec![false; count],
        };

        let this = &*self;
        let results = join_all(src_layers.iter().enumerate().map(|(index, layer)| {
            let to_encrypt = to_encrypt[index];
            async move {
                let _permit = this.c.acquire_blob_permit().await.context("copying layer")?;
                this.copy_layer_or_keep_foreign(index, &layer.info, to_encrypt, layer.empty_layer)
                    .await
            }
        }))
        .await;

        let mut compression_algorithms = Vec::new();
        let mut dest_infos = Vec::with_capacity(count);
        let mut diff_ids = Vec::with_capacity(count);
        for res in results {
            let (info, diff_id) = res?;
            if let Some(a) = info.compression_algorithm {
                push_unique(&mut compression_algorithms, a);
            }
            dest_infos.push(info);
            diff_ids.push(diff_id);
        }

        let digests_differ = src_layers
            .iter()
            .zip(&dest_infos)
            .any(|(s, d)| s.info.digest != d.digest);
        self.update_info.layer_infos = dest_infos.clone();
        if self.diff_ids_are_needed {
            self.update_info.layer_diff_ids = diff_ids;
        }
        if digests_differ {
            self.manifest_updates.layer_infos = Some(dest_infos);
        }
        Ok(compression_algorithms)
    }

    async fn copy_layer_or_keep_foreign(
        &self,
        index: usize,
        src_info: &BlobInfo,
        to_encrypt: bool,
        empty_layer: bool,
    ) -> Result<(BlobInfo, Option<Digest>)> {
        let options = self.c.options;
        if !options.download_foreign_layers
            && self.c.dest.accepts_foreign_layer_urls()
            && !src_info.urls.is_empty()
        {
            // Only schema1 conversions need DiffIDs, and schema1 has no foreign layers.
            if self.diff_ids_are_needed {
                return Err(Error::Unsupported(
                    "getting DiffID for foreign layers is unimplemented".into(),
                ));
            }
            debug!(
                digest = %src_info.digest_label(),
                transport = self.c.dest_ref.transport_name(),
                "Skipping foreign layer copy"
            );
            return Ok((src_info.clone(), None));
        }
        self.copy_layer(index, src_info.clone(), to_encrypt, empty_layer).await
    }

    /// Copy one layer: reuse it, pull it partially, or stream it. Returns the
    /// written blob and its DiffID, when known.
    async fn copy_layer(
        &self,
        index: usize,
        mut src_info: BlobInfo,
        to_encrypt: bool,
        empty_layer: bool,
    ) -> Result<(BlobInfo, Option<Digest>)> {
        let c = self.c;
        let src_digest = src_info
            .digest
            .clone()
            .ok_or_else(|| Error::Internal(format!("layer {} has no digest", index)))?;
        if src_info.compression_algorithm.is_none() {
            let (operation, algorithm) = compression_edits_from_blob_info(&src_info)?;
            src_info.compression_operation = operation;
            src_info.compression_algorithm = algorithm;
        }
        c.report_copy_info("blob", &src_info);

        let mut cached_diff_id = None;
        let mut diff_id_needed = false;
        if self.diff_ids_are_needed {
            cached_diff_id = c.cache.uncompressed_digest(&src_digest);
            diff_id_needed = cached_diff_id.is_none();
        }
        // Encrypted data only takes the full stream path.
        let encrypting_or_decrypting = to_encrypt
            || (crate::encryption::is_encrypted_media_type(&src_info.media_type)
                && c.options.decrypt_config.is_some());
        let can_avoid_processing_complete_layer = !diff_id_needed && !encrypting_or_decrypting;

        if can_avoid_processing_complete_layer {
            let can_change_compression = self.src.can_change_layer_compression(&src_info.media_type);
            debug!(
                digest = %src_digest,
                general_substitution = self.can_substitute_blobs,
                media_type = %src_info.media_type,
                can_change_compression,
                "Checking if we can reuse blob"
            );
            let mut possible_manifest_formats = vec![self.plan.preferred_mime_type.clone()];
            possible_manifest_formats.extend(self.plan.other_candidates.iter().cloned());
            let reuse_options = TryReusingBlobOptions {
                cache: c.cache.as_ref(),
                can_substitute: self.can_substitute_blobs && can_change_compression,
                empty_layer,
                layer_index: Some(index),
                src_ref: c.src_ref.docker_reference(),
                toc_digest: imgcopy_oci::compression::toc_digest(&src_info.annotations)?,
                conditions: ReuseConditions {
                    possible_manifest_formats: Some(possible_manifest_formats),
                    required_compression: self
                        .compression_format
                        .filter(|_| self.require_compression_format_match),
                },
                original_compression: src_info.compression_algorithm,
            };
            let reused = c
                .dest
                .try_reusing_blob(&src_info, &reuse_options)
                .await
                .with_context(|| format!("trying to reuse blob {} at destination", src_digest))?;
            if let Some(reused) = reused {
                debug!(digest = %src_digest, "Skipping blob (already present)");
                let label = if reused.matched_by_toc_digest {
                    "skipped: already exists (found by TOC)"
                } else {
                    "skipped: already exists"
                };
                let bar = c.bars.bar(&BlobInfo::new(reused.digest.clone(), Some(0), ""), "blob", label);
                bar.mark_complete();
                if let Some(sink) = &c.progress {
                    sink.skipped(&src_info);
                }
                return Ok((updated_blob_info_from_reuse(&src_info, &reused), cached_diff_id));
            }
        }

        // The destination decides which parts of the blob it still needs.
        if can_avoid_processing_complete_layer
            && c.raw_source.supports_get_blob_at()
            && c.dest.supports_put_blob_partial()
        {
            let bar = c.bars.bar(&src_info, "blob", "done");
            let proxy = ProgressChunkAccessor {
                source: c.raw_source,
                bar: &bar,
            };
            let pulled = c
                .dest
                .put_blob_partial(
                    &proxy,
                    &src_info,
                    PutBlobPartialOptions {
                        cache: c.cache.as_ref(),
                        empty_layer,
                        layer_index: index,
                    },
                )
                .await
                .with_context(|| format!("partial pull of blob {}", src_digest))?;
            match pulled {
                PartialPull::Pulled(uploaded) => {
                    bar.mark_complete();
                    debug!(digest = %src_digest, "Retrieved partial blob");
                    return Ok((updated_blob_info_from_upload(&src_info, &uploaded), cached_diff_id));
                }
                PartialPull::FallbackRequested => {
                    debug!(digest = %src_digest, "Failed to retrieve partial blob, copying the full layer");
                }
            }
        }

        let bar = c.bars.bar(&src_info, "blob", "done");
        let (reader, size) = c
            .raw_source
            .get_blob(&src_info, c.cache.as_ref())
            .await
            .with_context(|| format!("reading blob {}", src_digest))?;
        let stream_info = BlobInfo {
            digest: Some(src_digest.clone()),
            size,
            media_type: src_info.media_type.clone(),
            annotations: src_info.annotations.clone(),
            ..Default::default()
        };
        let copied = self
            .copy_blob_from_stream(
                reader,
                &stream_info,
                &bar,
                BlobCopyOptions {
                    is_config: false,
                    empty_layer,
                    layer_index: Some(index),
                    to_encrypt,
                    compute_diff_id: diff_id_needed,
                },
            )
            .await?;

        let mut diff_id = cached_diff_id;
        if let Some(computed) = copied.diff_id {
            let computed = computed.context("computing layer DiffID")?;
            debug!(diff_id = %computed, digest = %src_digest, "Computed DiffID for layer");
            // The source was read completely, so its digest was verified.
            if !encrypting_or_decrypting {
                c.cache.record_digest_uncompressed_pair(&src_digest, &computed);
            }
            diff_id = Some(computed);
        }
        bar.mark_complete();
        Ok((copied.info, diff_id))
    }

    /// Write the config and the (possibly edited) manifest. Returns the
    /// manifest as written and its digest.
    async fn copy_updated_config_and_manifest(
        &self,
        target_instance: Option<&Digest>,
    ) -> Result<(Vec<u8>, Digest)> {
        let c = self.c;
        let pending = if self.manifest_updates.is_empty() {
            self.src.unmodified(c.raw_source, c.cache.as_ref()).await?
        } else {
            if let Some(reason) = self.cannot_modify_manifest_reason {
                return Err(Error::Internal(format!(
                    "copy needs an updated manifest but that was known to be forbidden: {:?}",
                    reason
                )));
            }
            if !self.diff_ids_are_needed && self.src.updated_image_needs_layer_diff_ids(&self.manifest_updates) {
                // Only reachable when falling back to a format other than the preferred one.
                return Err(Error::Unsupported(format!(
                    "Can not convert image to {}, preparing DiffIDs for this case is not supported",
                    self.manifest_updates.manifest_mime_type.as_deref().unwrap_or_default()
                )));
            }
            self.src
                .updated_image(c.raw_source, c.cache.as_ref(), &self.manifest_updates, &self.update_info)
                .await
                .context("creating an updated image manifest")?
        };

        self.copy_config(&pending).await?;

        c.report("Writing manifest to image destination");
        let digest = manifest_digest(&pending.manifest)?;
        let instance = target_instance.map(|_| &digest);
        if let Err(e) = c.dest.put_manifest(&pending.manifest, instance).await {
            debug!(error = %e, manifest = %String::from_utf8_lossy(&pending.manifest), "Error while writing manifest");
            return Err(e.context("writing manifest"));
        }
        Ok((pending.manifest, digest))
    }

    /// Upload the config blob of `pending`, unchanged.
    async fn copy_config(&self, pending: &PendingImage) -> Result<()> {
        let Some((src_info, blob)) = &pending.config else {
            return Ok(());
        };
        let c = self.c;
        let _permit = c.acquire_blob_permit().await.context("copying config")?;
        let bar = c.bars.bar(src_info, "config", "done");
        c.report_copy_info("config", src_info);
        let copied = self
            .copy_blob_from_stream(
                Box::pin(Cursor::new(blob.clone())),
                src_info,
                &bar,
                BlobCopyOptions {
                    is_config: true,
                    ..Default::default()
                },
            )
            .await?;
        bar.mark_complete();
        if copied.info.digest != src_info.digest {
            return Err(Error::Internal(format!(
                "copying uncompressed config blob {} changed digest to {}",
                src_info.digest_label(),
                copied.info.digest_label()
            )));
        }
        Ok(())
    }
}
