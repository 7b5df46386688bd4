//! Copying a manifest list and (some of) its instances.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use imgcopy_oci::manifest::{
    ListEdit, ManifestList, Platform, DOCKER_V2_LIST, DOCKER_V2_SCHEMA1, DOCKER_V2_SCHEMA1_SIGNED,
    DOCKER_V2_SCHEMA2, OCI_INDEX, OCI_MANIFEST,
};
use imgcopy_oci::{Algorithm, Digest};

use crate::error::{Error, Result, ResultExt};
use crate::image::UnparsedImage;

use super::manifest::determine_list_conversion;
use super::single::SingleImageOptions;
use super::{cannot_modify_reason, Copier, ImageListSelection, Options};

/// What to do with one list instance.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum InstanceCopy {
    /// Copy the instance, replacing it in the list.
    Copy {
        source_digest: Digest,
        require_compression_format_match: bool,
    },
    /// Copy the instance again, compressed with `algorithm`, and add the
    /// result to the list.
    Clone {
        source_digest: Digest,
        algorithm: Algorithm,
        artifact_type: Option<String>,
        platform: Option<Platform>,
        annotations: BTreeMap<String, String>,
    },
}

/// Platform fields compared when grouping instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
struct PlatformKey {
    architecture: String,
    os: String,
    os_version: String,
    os_features: String,
    variant: String,
}

impl PlatformKey {
    fn new(platform: Option<&Platform>) -> Self {
        let Some(p) = platform else {
            return Self::default();
        };
        let mut features = p.os_features.clone();
        features.sort();
        Self {
            architecture: p.architecture.clone(),
            os: p.os.clone(),
            os_version: p.os_version.clone(),
            os_features: features.join(","),
            variant: p.variant.clone(),
        }
    }
}

/// Compression algorithm names already present for each platform.
fn platform_compression_map(
    list: &ManifestList,
    instances: &[Digest],
) -> Result<HashMap<PlatformKey, BTreeSet<String>>> {
    let mut res: HashMap<PlatformKey, BTreeSet<String>> = HashMap::new();
    for digest in instances {
        let details = list
            .instance(digest)
            .with_context(|| format!("getting details for instance {}", digest))?;
        res.entry(PlatformKey::new(details.platform.as_ref()))
            .or_default()
            .extend(details.compression_algorithm_names);
    }
    Ok(res)
}

/// The copies needed for `instances` of `list`, in list order: each selected
/// instance, followed by clones for compression variants its platform lacks.
pub(super) fn prepare_instance_copies(
    list: &ManifestList,
    instances: &[Digest],
    options: &Options,
) -> Result<Vec<InstanceCopy>> {
    if options.image_list_selection == ImageListSelection::CopySpecificImages
        && !options.ensure_compression_variants_exist.is_empty()
    {
        return Err(Error::Unsupported(
            "EnsureCompressionVariantsExist is not implemented for CopySpecificImages".into(),
        ));
    }
    let mut by_platform = platform_compression_map(list, instances)?;
    let mut res = Vec::new();
    for (i, digest) in instances.iter().enumerate() {
        if options.image_list_selection == ImageListSelection::CopySpecificImages
            && !options.instances.contains(digest)
        {
            debug!("Skipping instance {} ({}/{})", digest, i + 1, instances.len());
            continue;
        }
        let details = list
            .instance(digest)
            .with_context(|| format!("getting details for instance {}", digest))?;
        res.push(InstanceCopy::Copy {
            source_digest: digest.clone(),
            require_compression_format_match: options.require_compression_format_match()?,
        });
        let present = by_platform
            .entry(PlatformKey::new(details.platform.as_ref()))
            .or_default();
        for &algorithm in &options.ensure_compression_variants_exist {
            // Recorded as present so the platform gets one clone per algorithm.
            if present.insert(algorithm.name().to_string()) {
                res.push(InstanceCopy::Clone {
                    source_digest: digest.clone(),
                    algorithm,
                    artifact_type: details.artifact_type.clone(),
                    platform: details.platform.clone(),
                    annotations: details.annotations.clone(),
                });
            }
        }
    }
    Ok(res)
}

/// The list type implied by a forced single-image manifest type.
fn forced_list_mime_type(forced: Option<&str>) -> Option<&str> {
    match forced {
        Some(DOCKER_V2_SCHEMA1 | DOCKER_V2_SCHEMA1_SIGNED | DOCKER_V2_SCHEMA2) => Some(DOCKER_V2_LIST),
        Some(OCI_MANIFEST) => Some(OCI_INDEX),
        other => other,
    }
}

impl Copier<'_> {
    /// Copy the top-level list and the selected instances. Returns the list
    /// as written.
    pub(super) async fn copy_multiple_images(&self) -> Result<Vec<u8>> {
        let (original_blob, list_type) = self
            .unparsed_toplevel
            .manifest()
            .await
            .context("reading manifest list")?;
        let original_blob = original_blob.to_vec();
        let original_list = ManifestList::from_blob(&original_blob, list_type).with_context(|| {
            format!(
                "parsing manifest list {:?}",
                String::from_utf8_lossy(&original_blob)
            )
        })?;
        let mut updated_list = original_list.clone();

        let mut sigs = self
            .source_signatures(
                &self.unparsed_toplevel,
                "Getting image list signatures",
                "Checking if image list destination supports signatures",
            )
            .await?;

        let dest_is_digested = self.check_digested_destination(&original_blob, false).await?;
        let cannot_modify_list_reason =
            cannot_modify_reason(!sigs.is_empty(), dest_is_digested, self.options.preserve_digests);

        let forced = forced_list_mime_type(self.options.force_manifest_mime_type.as_deref());
        let (selected_list_type, other_candidates) = determine_list_conversion(
            original_list.mime_type(),
            &self.dest.supported_manifest_mime_types(),
            forced,
        )
        .context("determining manifest list type to write to destination")?;
        if selected_list_type != original_list.mime_type() {
            if let Some(reason) = cannot_modify_list_reason {
                return Err(Error::Manifest(format!(
                    "Manifest list must be converted to type {:?} to be written to destination, but we cannot modify it: {:?}",
                    selected_list_type, reason
                )));
            }
        }

        let instances = updated_list.instances();
        let copies = prepare_instance_copies(&updated_list, &instances, self.options)
            .context("preparing instances for copy")?;
        self.report(format!(
            "Copying {} images generated from {} images in list",
            copies.len(),
            instances.len()
        ));
        let total = copies.len();
        let mut edits = Vec::with_capacity(total);
        for (i, copy) in copies.into_iter().enumerate() {
            match copy {
                InstanceCopy::Copy {
                    source_digest,
                    require_compression_format_match,
                } => {
                    debug!("Copying instance {} ({}/{})", source_digest, i + 1, total);
                    self.report(format!("Copying image {} ({}/{})", source_digest, i + 1, total));
                    let unparsed = UnparsedImage::new(self.raw_source, self.src_ref, Some(source_digest.clone()));
                    let updated = self
                        .copy_single_image(
                            &unparsed,
                            Some(&source_digest),
                            SingleImageOptions::new(require_compression_format_match),
                        )
                        .await
                        .with_context(|| format!("copying image {}/{} from manifest list", i + 1, total))?;
                    edits.push(ListEdit::Update {
                        old_digest: source_digest,
                        digest: updated.manifest_digest,
                        size: updated.manifest.len() as i64,
                        media_type: updated.manifest_mime_type,
                        affect_annotations: false,
                        annotations: None,
                        compression_algorithms: updated.compression_algorithms,
                    });
                }
                InstanceCopy::Clone {
                    source_digest,
                    algorithm,
                    artifact_type,
                    platform,
                    annotations,
                } => {
                    debug!("Replicating instance {} ({}/{})", source_digest, i + 1, total);
                    self.report(format!("Replicating image {} ({}/{})", source_digest, i + 1, total));
                    let unparsed = UnparsedImage::new(self.raw_source, self.src_ref, Some(source_digest.clone()));
                    let updated = self
                        .copy_single_image(
                            &unparsed,
                            Some(&source_digest),
                            SingleImageOptions {
                                require_compression_format_match: true,
                                compression_format: Some(algorithm),
                                compression_level: None,
                            },
                        )
                        .await
                        .with_context(|| format!("replicating image {}/{} from manifest list", i + 1, total))?;
                    edits.push(ListEdit::Add {
                        digest: updated.manifest_digest,
                        size: updated.manifest.len() as i64,
                        media_type: updated.manifest_mime_type,
                        artifact_type,
                        platform,
                        annotations,
                        compression_algorithms: updated.compression_algorithms,
                    });
                }
            }
        }

        updated_list
            .edit_instances(&edits)
            .context("updating manifest list")?;

        self.report("Writing manifest list to image destination");
        let original_serialized = original_list
            .serialize()
            .context("encoding original manifest list for comparison")?;
        let mut errs = Vec::new();
        let mut written = None;
        for list_type in std::iter::once(&selected_list_type).chain(&other_candidates) {
            debug!(list_type = %list_type, "Trying to use manifest list type");
            let attempted = if list_type.as_str() != updated_list.mime_type() {
                updated_list.convert_to(list_type).with_context(|| {
                    format!("converting manifest list to list with MIME type {:?}", list_type)
                })?
            } else {
                updated_list.clone()
            };
            let mut attempted_blob = attempted
                .serialize()
                .with_context(|| format!("encoding updated manifest list ({:?})", updated_list.mime_type()))?;
            if attempted_blob != original_serialized {
                if let Some(reason) = cannot_modify_list_reason {
                    return Err(Error::Manifest(format!(
                        "Manifest list must be converted to type {:?} to be written to destination, but we cannot modify it: {:?}",
                        list_type, reason
                    )));
                }
                debug!("Manifest list has been updated");
            } else {
                // Unchanged: keep the original bytes so the digest stays the same.
                attempted_blob = original_blob.clone();
            }
            match self.dest.put_manifest(&attempted_blob, None).await {
                Ok(()) => {
                    written = Some(attempted_blob);
                    break;
                }
                Err(e) => {
                    debug!(list_type = %list_type, error = %e, "Upload of manifest list type failed");
                    errs.push(format!("{}({})", list_type, e));
                }
            }
        }
        let manifest_list = written.ok_or_else(|| {
            Error::Manifest(format!(
                "Uploading manifest list failed, attempted the following formats: {}",
                errs.join(", ")
            ))
        })?;

        let new_sigs = self
            .create_signatures(&manifest_list, self.options.sign_identity.as_ref())
            .await?;
        sigs.extend(new_sigs);
        self.report("Storing list signatures");
        self.dest
            .put_signatures(&sigs, None)
            .await
            .context("writing signatures")?;

        Ok(manifest_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest::from_bytes(&[n])
    }

    fn index(entries: &[(Digest, &str, bool)]) -> ManifestList {
        let manifests: Vec<serde_json::Value> = entries
            .iter()
            .map(|(d, arch, zstd)| {
                let mut m = serde_json::json!({
                    "mediaType": OCI_MANIFEST,
                    "digest": d.to_string(),
                    "size": 100,
                    "platform": {"architecture": arch, "os": "linux"},
                });
                if *zstd {
                    m["annotations"] = serde_json::json!({
                        (imgcopy_oci::manifest::OCI_INSTANCE_ANNOTATION_ZSTD): "true"
                    });
                }
                m
            })
            .collect();
        let blob = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": manifests,
        }))
        .unwrap();
        ManifestList::from_blob(&blob, OCI_INDEX).unwrap()
    }

    #[test]
    fn clones_only_missing_variants() {
        let list = index(&[
            (digest(1), "amd64", false),
            (digest(2), "amd64", true),
            (digest(3), "arm64", false),
        ]);
        let options = Options {
            image_list_selection: ImageListSelection::CopyAllImages,
            ensure_compression_variants_exist: vec![Algorithm::Zstd],
            ..Default::default()
        };
        let copies = prepare_instance_copies(&list, &list.instances(), &options).unwrap();
        let clones: Vec<&Digest> = copies
            .iter()
            .filter_map(|c| match c {
                InstanceCopy::Clone { source_digest, .. } => Some(source_digest),
                InstanceCopy::Copy { .. } => None,
            })
            .collect();
        assert_eq!(copies.len(), 4);
        assert_eq!(clones, vec![&digest(3)]);
    }

    #[test]
    fn no_variants_means_plain_copies() {
        let list = index(&[(digest(1), "amd64", false), (digest(2), "arm64", false)]);
        let options = Options {
            image_list_selection: ImageListSelection::CopyAllImages,
            ..Default::default()
        };
        let copies = prepare_instance_copies(&list, &list.instances(), &options).unwrap();
        assert_eq!(
            copies,
            vec![
                InstanceCopy::Copy {
                    source_digest: digest(1),
                    require_compression_format_match: false
                },
                InstanceCopy::Copy {
                    source_digest: digest(2),
                    require_compression_format_match: false
                },
            ]
        );
    }

    #[test]
    fn specific_selection_skips_unlisted_instances() {
        let list = index(&[(digest(1), "amd64", false), (digest(2), "arm64", false)]);
        let options = Options {
            image_list_selection: ImageListSelection::CopySpecificImages,
            instances: vec![digest(2)],
            ..Default::default()
        };
        let copies = prepare_instance_copies(&list, &list.instances(), &options).unwrap();
        assert_eq!(copies.len(), 1);
        assert!(matches!(&copies[0], InstanceCopy::Copy { source_digest, .. } if *source_digest == digest(2)));
    }

    #[test]
    fn platform_key_ignores_feature_order() {
        let a = Platform {
            architecture: "amd64".into(),
            os: "windows".into(),
            os_features: vec!["b".into(), "a".into()],
            ..Default::default()
        };
        let mut b = a.clone();
        b.os_features.reverse();
        assert_eq!(PlatformKey::new(Some(&a)), PlatformKey::new(Some(&b)));
        assert_ne!(PlatformKey::new(Some(&a)), PlatformKey::new(None));
    }

    #[test]
    fn forced_single_types_map_to_list_types() {
        assert_eq!(forced_list_mime_type(Some(DOCKER_V2_SCHEMA2)), Some(DOCKER_V2_LIST));
        assert_eq!(forced_list_mime_type(Some(OCI_MANIFEST)), Some(OCI_INDEX));
        assert_eq!(forced_list_mime_type(Some(OCI_INDEX)), Some(OCI_INDEX));
        assert_eq!(forced_list_mime_type(None), None);
    }
}
