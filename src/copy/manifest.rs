//! Choosing the manifest format(s) to write.

use tracing::debug;

use imgcopy_oci::manifest::{
    compression_universally_supported, is_multi_image, mime_type_supports_compression,
    mime_type_supports_encryption, normalized_mime_type, DOCKER_V2_SCHEMA1,
    DOCKER_V2_SCHEMA1_SIGNED, DOCKER_V2_SCHEMA2, OCI_MANIFEST, SUPPORTED_LIST_MIME_TYPES,
};
use imgcopy_oci::Algorithm;

use crate::error::{Error, Result};

/// Formats to convert to when the original cannot be used. Schema2 is
/// preferred since it does not change with the upload location; unsigned
/// schema1 is left out because registries insist on a signature anyway.
const PREFERRED_MANIFEST_MIME_TYPES: [&str; 2] = [DOCKER_V2_SCHEMA2, DOCKER_V2_SCHEMA1_SIGNED];

/// Used when the destination accepts anything.
const ALL_MANIFEST_MIME_TYPES: [&str; 4] = [
    OCI_MANIFEST,
    DOCKER_V2_SCHEMA2,
    DOCKER_V2_SCHEMA1_SIGNED,
    DOCKER_V2_SCHEMA1,
];

#[derive(Debug, Clone, Default)]
pub struct ConversionInputs<'a> {
    pub src_mime_type: &'a str,
    /// As reported by the destination; empty means anything.
    pub dest_supported_mime_types: &'a [String],
    pub force_manifest_mime_type: Option<&'a str>,
    /// Only set when the user explicitly asked for an algorithm.
    pub requested_compression: Option<Algorithm>,
    pub requires_oci_encryption: bool,
    pub cannot_modify_manifest_reason: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPlan {
    /// The format to try first, whether or not it needs a conversion.
    pub preferred_mime_type: String,
    pub preferred_needs_conversion: bool,
    /// Formats to fall back to, in order.
    pub other_candidates: Vec<String>,
}

/// An insertion-ordered list without duplicates.
#[derive(Default)]
struct OrderedSet(Vec<String>);

impl OrderedSet {
    fn push(&mut self, s: &str) {
        if !self.0.iter().any(|e| e == s) {
            self.0.push(s.to_string());
        }
    }
}

pub fn determine_manifest_conversion(input: &ConversionInputs<'_>) -> Result<ConversionPlan> {
    let src_type = normalized_mime_type(input.src_mime_type);
    if src_type != input.src_mime_type {
        debug!(
            "Source manifest MIME type {}, treating it as {}",
            input.src_mime_type, src_type
        );
    }

    let forced: Vec<String>;
    let dest_types: Vec<&str> = match input.force_manifest_mime_type {
        Some(f) => vec![f],
        None if input.dest_supported_mime_types.is_empty() => ALL_MANIFEST_MIME_TYPES.to_vec(),
        None => {
            forced = input.dest_supported_mime_types.to_vec();
            forced.iter().map(String::as_str).collect()
        }
    };

    let restrictive = input
        .requested_compression
        .filter(|a| !compression_universally_supported(*a));
    let supported: Vec<&str> = dest_types
        .iter()
        .copied()
        .filter(|t| !input.requires_oci_encryption || mime_type_supports_encryption(t))
        .filter(|t| restrictive.map_or(true, |a| mime_type_supports_compression(t, a)))
        .collect();

    if supported.is_empty() {
        return Err(no_supported_format(input, restrictive, &dest_types));
    }

    let mut prioritized = OrderedSet::default();
    if supported.contains(&src_type) {
        prioritized.push(src_type);
    }
    if input.cannot_modify_manifest_reason.is_some() {
        debug!("We can't modify the manifest, hoping for the best...");
        return Ok(ConversionPlan {
            preferred_mime_type: src_type.to_string(),
            preferred_needs_conversion: false,
            other_candidates: Vec::new(),
        });
    }
    for t in PREFERRED_MANIFEST_MIME_TYPES {
        if supported.contains(&t) {
            prioritized.push(t);
        }
    }
    for t in &dest_types {
        if supported.contains(t) {
            prioritized.push(t);
        }
    }

    debug!(
        "Manifest has MIME type {}, ordered candidate list [{}]",
        src_type,
        prioritized.0.join(", ")
    );
    let mut list = prioritized.0.into_iter();
    let preferred = list
        .next()
        .ok_or_else(|| Error::Internal("no candidate MIME types".into()))?;
    let needs_conversion = preferred != src_type;
    if !needs_conversion {
        debug!("... will first try using the original manifest unmodified");
    }
    Ok(ConversionPlan {
        preferred_mime_type: preferred,
        preferred_needs_conversion: needs_conversion,
        other_candidates: list.collect(),
    })
}

/// Explain why every destination format was filtered out.
fn no_supported_format(
    input: &ConversionInputs<'_>,
    restrictive: Option<Algorithm>,
    dest_types: &[&str],
) -> Error {
    let encryption = input.requires_oci_encryption;
    if let Some(forced) = input.force_manifest_mime_type {
        return Error::Manifest(match restrictive {
            Some(a) if encryption => format!(
                "compression using {}, and encryption, required together with format {}, which does not support both",
                a.name(),
                forced
            ),
            None if encryption => format!(
                "encryption required together with format {}, which does not support encryption",
                forced
            ),
            Some(a) => format!(
                "compression using {} required together with format {}, which does not support it",
                a.name(),
                forced
            ),
            None => {
                return Error::Internal(
                    "forced manifest MIME type was rejected for an unknown reason".into(),
                )
            }
        });
    }
    if input.dest_supported_mime_types.is_empty() {
        return match restrictive {
            Some(a) => Error::Manifest(format!(
                "compression using {} required, but none of the known manifest formats support it",
                a.name()
            )),
            None => Error::Internal(
                "every known manifest format was rejected, but no restriction applies".into(),
            ),
        };
    }
    let list = dest_types.join(", ");
    match restrictive {
        Some(a) if encryption => Error::Manifest(format!(
            "compression using {}, and encryption, required but the destination only supports MIME types [{}], none of which support both",
            a.name(),
            list
        )),
        None if encryption => Error::Manifest(format!(
            "encryption required but the destination only supports MIME types [{}], none of which support encryption",
            list
        )),
        Some(a) => Error::Manifest(format!(
            "compression using {} required but the destination only supports MIME types [{}], none of which support it",
            a.name(),
            list
        )),
        None => Error::Internal(
            "no supported destination format, and we are neither encrypting nor requiring a restrictive compression algorithm"
                .into(),
        ),
    }
}

/// Choose the list format to write: the current one if acceptable, then any
/// other list type the destination supports.
pub fn determine_list_conversion(
    current: &str,
    dest_supported: &[String],
    forced: Option<&str>,
) -> Result<(String, Vec<String>)> {
    let candidates: Vec<String> = match forced {
        Some(f) => vec![f.to_string()],
        None if dest_supported.is_empty() => {
            SUPPORTED_LIST_MIME_TYPES.iter().map(|s| s.to_string()).collect()
        }
        None => dest_supported.to_vec(),
    };
    let mut prioritized = OrderedSet::default();
    if candidates.iter().any(|t| t == current) {
        prioritized.push(current);
    }
    for t in &candidates {
        if is_multi_image(t) {
            prioritized.push(t);
        }
    }
    debug!(
        "Manifest list has MIME type {}, ordered candidate list [{}]",
        current,
        candidates.join(", ")
    );
    let mut list = prioritized.0.into_iter();
    let selected = list.next().ok_or_else(|| {
        Error::Manifest(format!(
            "destination does not support any supported manifest list types ({})",
            SUPPORTED_LIST_MIME_TYPES.join(", ")
        ))
    })?;
    Ok((selected, list.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcopy_oci::manifest::{DOCKER_V2_LIST, OCI_INDEX};

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn plan(src: &str, dest: &[&str]) -> ConversionPlan {
        let dest = strings(dest);
        determine_manifest_conversion(&ConversionInputs {
            src_mime_type: src,
            dest_supported_mime_types: &dest,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn original_type_first() {
        let p = plan(OCI_MANIFEST, &[DOCKER_V2_SCHEMA2, OCI_MANIFEST]);
        assert_eq!(p.preferred_mime_type, OCI_MANIFEST);
        assert!(!p.preferred_needs_conversion);
        assert_eq!(p.other_candidates, strings(&[DOCKER_V2_SCHEMA2]));
    }

    #[test]
    fn unrestricted_destination() {
        let p = plan(DOCKER_V2_SCHEMA2, &[]);
        assert_eq!(p.preferred_mime_type, DOCKER_V2_SCHEMA2);
        assert_eq!(
            p.other_candidates,
            strings(&[DOCKER_V2_SCHEMA1_SIGNED, OCI_MANIFEST, DOCKER_V2_SCHEMA1])
        );
    }

    #[test]
    fn conversion_needed() {
        let p = plan(DOCKER_V2_SCHEMA1_SIGNED, &[OCI_MANIFEST]);
        assert_eq!(p.preferred_mime_type, OCI_MANIFEST);
        assert!(p.preferred_needs_conversion);
        assert!(p.other_candidates.is_empty());
    }

    #[test]
    fn deterministic() {
        let dest = strings(&[DOCKER_V2_SCHEMA1, OCI_MANIFEST, DOCKER_V2_SCHEMA2]);
        let input = ConversionInputs {
            src_mime_type: DOCKER_V2_SCHEMA2,
            dest_supported_mime_types: &dest,
            ..Default::default()
        };
        let a = determine_manifest_conversion(&input).unwrap();
        let b = determine_manifest_conversion(&input).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.preferred_mime_type, DOCKER_V2_SCHEMA2);
    }

    #[test]
    fn cannot_modify_keeps_source() {
        let dest = strings(&[OCI_MANIFEST]);
        let p = determine_manifest_conversion(&ConversionInputs {
            src_mime_type: DOCKER_V2_SCHEMA2,
            dest_supported_mime_types: &dest,
            cannot_modify_manifest_reason: Some("Would invalidate signatures"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.preferred_mime_type, DOCKER_V2_SCHEMA2);
        assert!(p.other_candidates.is_empty());
    }

    #[test]
    fn encryption_filters_docker_formats() {
        let dest = strings(&[DOCKER_V2_SCHEMA2, OCI_MANIFEST]);
        let p = determine_manifest_conversion(&ConversionInputs {
            src_mime_type: DOCKER_V2_SCHEMA2,
            dest_supported_mime_types: &dest,
            requires_oci_encryption: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.preferred_mime_type, OCI_MANIFEST);

        let dest = strings(&[DOCKER_V2_SCHEMA2]);
        let err = determine_manifest_conversion(&ConversionInputs {
            src_mime_type: DOCKER_V2_SCHEMA2,
            dest_supported_mime_types: &dest,
            requires_oci_encryption: true,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("none of which support encryption"));
    }

    #[test]
    fn forced_format_and_compression_conflict() {
        let err = determine_manifest_conversion(&ConversionInputs {
            src_mime_type: DOCKER_V2_SCHEMA2,
            force_manifest_mime_type: Some(DOCKER_V2_SCHEMA1_SIGNED),
            requested_compression: Some(Algorithm::Zstd),
            ..Default::default()
        })
        .unwrap_err()
        .to_string();
        assert!(err.contains("zstd"), "{}", err);
        assert!(err.contains(DOCKER_V2_SCHEMA1_SIGNED), "{}", err);
    }

    #[test]
    fn unknown_compression_everywhere() {
        let err = determine_manifest_conversion(&ConversionInputs {
            src_mime_type: OCI_MANIFEST,
            requested_compression: Some(Algorithm::Xz),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("none of the known manifest formats support it"));
    }

    #[test]
    fn list_conversion() {
        let (t, rest) = determine_list_conversion(DOCKER_V2_LIST, &[], None).unwrap();
        assert_eq!(t, DOCKER_V2_LIST);
        assert_eq!(rest, strings(&[OCI_INDEX]));

        let dest = strings(&[OCI_MANIFEST, OCI_INDEX]);
        let (t, rest) = determine_list_conversion(DOCKER_V2_LIST, &dest, None).unwrap();
        assert_eq!(t, OCI_INDEX);
        assert!(rest.is_empty());

        let dest = strings(&[OCI_MANIFEST]);
        assert!(determine_list_conversion(DOCKER_V2_LIST, &dest, None).is_err());
    }
}
