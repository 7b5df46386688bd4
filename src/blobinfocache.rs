//! Records of blob relationships (compressed ↔ uncompressed digests) and
//! known blob locations, used to skip transfers and hashing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use imgcopy_oci::manifest::{candidate_compression_matches_reuse_conditions, ReuseConditions};
use imgcopy_oci::{Algorithm, Digest, LayerCompression};

/// Compressor name recorded for uncompressed blobs.
pub const UNCOMPRESSED: &str = "uncompressed";
/// Compressor name recorded when the compression could not be determined.
pub const UNKNOWN_COMPRESSION: &str = "unknown";

/// Most candidates returned by [`BlobInfoCache::candidate_locations`].
const REPLACEMENT_ATTEMPTS: usize = 5;
/// Most candidates without a known location among them.
const REPLACEMENT_UNKNOWN_LOCATION_ATTEMPTS: usize = 2;

/// What is known about how a blob is compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCompressorData {
    /// Base algorithm name, [`UNCOMPRESSED`] or [`UNKNOWN_COMPRESSION`].
    pub base_variant_compressor: String,
    /// Specific variant name (e.g. "zstd:chunked") or [`UNKNOWN_COMPRESSION`].
    pub specific_variant_compressor: String,
    pub specific_variant_annotations: BTreeMap<String, String>,
}

impl DigestCompressorData {
    pub fn unknown() -> Self {
        Self {
            base_variant_compressor: UNKNOWN_COMPRESSION.to_string(),
            specific_variant_compressor: UNKNOWN_COMPRESSION.to_string(),
            specific_variant_annotations: BTreeMap::new(),
        }
    }
}

/// Where blobs live, scoped by transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationScope {
    pub transport: String,
    /// E.g. a registry repository.
    pub scope: String,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateLocationsOptions {
    /// Other compressed forms of the same content are acceptable.
    pub can_substitute: bool,
    pub conditions: ReuseConditions,
    /// Also return digests with no recorded location.
    pub include_unknown_locations: bool,
}

/// A blob that may be used in place of the requested one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementCandidate {
    pub digest: Digest,
    pub compression_operation: LayerCompression,
    pub compression_algorithm: Option<Algorithm>,
    pub compression_annotations: BTreeMap<String, String>,
    /// `None` when the location is not known.
    pub location: Option<String>,
}

/// Cache of digest relationships. All records are additive; implementations
/// must be safe for concurrent use.
pub trait BlobInfoCache: Send + Sync {
    /// The uncompressed digest for `any`, or `any` itself when it is known to
    /// be uncompressed.
    fn uncompressed_digest(&self, any: &Digest) -> Option<Digest>;

    /// `uncompressed` must come from our own verified computation.
    fn record_digest_uncompressed_pair(&self, any: &Digest, uncompressed: &Digest);

    fn uncompressed_digest_for_toc(&self, toc: &Digest) -> Option<Digest>;

    fn record_toc_uncompressed_pair(&self, toc: &Digest, uncompressed: &Digest);

    fn record_known_location(&self, scope: &LocationScope, digest: &Digest, location: &str);

    fn record_digest_compressor_data(&self, digest: &Digest, data: DigestCompressorData);

    /// Blobs that may be present at `scope`, most promising first.
    fn candidate_locations(
        &self,
        scope: &LocationScope,
        primary: &Digest,
        options: &CandidateLocationsOptions,
    ) -> Vec<ReplacementCandidate>;
}

// ---------------------------------------------------------------------------
// Memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    uncompressed_digests: HashMap<Digest, Digest>,
    uncompressed_digests_by_toc: HashMap<Digest, Digest>,
    digests_by_uncompressed: HashMap<Digest, BTreeSet<Digest>>,
    /// location → logical time it was last recorded
    known_locations: HashMap<(LocationScope, Digest), HashMap<String, u64>>,
    compressors: HashMap<Digest, DigestCompressorData>,
    clock: u64,
}

/// A process-local [`BlobInfoCache`].
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<State>,
}

struct Ranked {
    candidate: ReplacementCandidate,
    seen: u64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl State {
    fn uncompressed_digest(&self, any: &Digest) -> Option<Digest> {
        if let Some(d) = self.uncompressed_digests.get(any) {
            return Some(d.clone());
        }
        // Presence as a key means `any` was recorded as an uncompressed digest.
        if self.digests_by_uncompressed.contains_key(any) {
            return Some(any.clone());
        }
        None
    }

    fn append_candidates(
        &self,
        out: &mut Vec<Ranked>,
        scope: &LocationScope,
        digest: &Digest,
        options: &CandidateLocationsOptions,
    ) {
        let Some((op, algorithm, annotations)) =
            candidate_compression(options, digest, self.compressors.get(digest))
        else {
            return;
        };
        let make = |location: Option<String>| ReplacementCandidate {
            digest: digest.clone(),
            compression_operation: op,
            compression_algorithm: algorithm,
            compression_annotations: annotations.clone(),
            location,
        };
        match self.known_locations.get(&(scope.clone(), digest.clone())) {
            Some(locations) if !locations.is_empty() => {
                for (location, seen) in locations {
                    out.push(Ranked {
                        candidate: make(Some(location.clone())),
                        seen: *seen,
                    });
                }
            }
            _ if options.include_unknown_locations => out.push(Ranked {
                candidate: make(None),
                seen: 0,
            }),
            _ => {}
        }
    }
}

/// The compression edit a candidate would imply, or `None` if the candidate
/// is unusable under `options`.
fn candidate_compression(
    options: &CandidateLocationsOptions,
    digest: &Digest,
    data: Option<&DigestCompressorData>,
) -> Option<(LayerCompression, Option<Algorithm>, BTreeMap<String, String>)> {
    let unknown = DigestCompressorData::unknown();
    let data = data.unwrap_or(&unknown);
    let (op, algorithm, annotations) = match data.base_variant_compressor.as_str() {
        UNCOMPRESSED => (LayerCompression::Decompress, None, BTreeMap::new()),
        UNKNOWN_COMPRESSION => {
            let c = &options.conditions;
            if c.required_compression.is_some() || c.possible_manifest_formats.is_some() {
                debug!(%digest, "ignoring cache record with unknown compression");
                return None;
            }
            return Some((LayerCompression::PreserveOriginal, None, BTreeMap::new()));
        }
        name => {
            let Ok(base) = Algorithm::by_name(name) else {
                debug!(%digest, compressor = name, "ignoring cache record with unrecognized compression");
                return None;
            };
            let specific = (data.specific_variant_compressor != UNKNOWN_COMPRESSION)
                .then(|| Algorithm::by_name(&data.specific_variant_compressor).ok())
                .flatten()
                .filter(|s| candidate_compression_matches_reuse_conditions(&options.conditions, Some(*s)));
            match specific {
                Some(s) => (
                    LayerCompression::Compress,
                    Some(s),
                    data.specific_variant_annotations.clone(),
                ),
                None => (LayerCompression::Compress, Some(base), BTreeMap::new()),
            }
        }
    };
    if !candidate_compression_matches_reuse_conditions(&options.conditions, algorithm) {
        debug!(%digest, "ignoring cache record, compression does not match");
        return None;
    }
    Some((op, algorithm, annotations))
}

/// Order candidates: the primary digest first, the uncompressed digest last,
/// otherwise most recently seen first. Then cap the list.
fn prioritize(
    mut candidates: Vec<Ranked>,
    primary: &Digest,
    uncompressed: Option<&Digest>,
) -> Vec<ReplacementCandidate> {
    candidates.sort_by(|a, b| {
        let a_primary = &a.candidate.digest == primary;
        let b_primary = &b.candidate.digest == primary;
        let a_uncompressed = Some(&a.candidate.digest) == uncompressed;
        let b_uncompressed = Some(&b.candidate.digest) == uncompressed;
        b_primary
            .cmp(&a_primary)
            .then(a_uncompressed.cmp(&b_uncompressed))
            .then(b.seen.cmp(&a.seen))
    });
    let (known, unknown): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .map(|r| r.candidate)
        .partition(|c| c.location.is_some());
    let known_used = known.len().min(REPLACEMENT_ATTEMPTS);
    let unknown_used = unknown
        .len()
        .min(REPLACEMENT_UNKNOWN_LOCATION_ATTEMPTS)
        .min(REPLACEMENT_ATTEMPTS - known_used);
    known
        .into_iter()
        .take(known_used)
        .chain(unknown.into_iter().take(unknown_used))
        .collect()
}

impl BlobInfoCache for MemoryCache {
    fn uncompressed_digest(&self, any: &Digest) -> Option<Digest> {
        self.lock().uncompressed_digest(any)
    }

    fn record_digest_uncompressed_pair(&self, any: &Digest, uncompressed: &Digest) {
        let mut st = self.lock();
        if let Some(previous) = st.uncompressed_digests.get(any) {
            if previous != uncompressed {
                warn!(
                    blob = %any,
                    previous = %previous,
                    now = %uncompressed,
                    "uncompressed digest for blob changed"
                );
            }
        }
        st.uncompressed_digests.insert(any.clone(), uncompressed.clone());
        st.digests_by_uncompressed
            .entry(uncompressed.clone())
            .or_default()
            .insert(any.clone());
    }

    fn uncompressed_digest_for_toc(&self, toc: &Digest) -> Option<Digest> {
        self.lock().uncompressed_digests_by_toc.get(toc).cloned()
    }

    fn record_toc_uncompressed_pair(&self, toc: &Digest, uncompressed: &Digest) {
        let mut st = self.lock();
        if let Some(previous) = st.uncompressed_digests_by_toc.get(toc) {
            if previous != uncompressed {
                warn!(
                    toc = %toc,
                    previous = %previous,
                    now = %uncompressed,
                    "uncompressed digest for blob with TOC changed"
                );
            }
        }
        st.uncompressed_digests_by_toc
            .insert(toc.clone(), uncompressed.clone());
    }

    fn record_known_location(&self, scope: &LocationScope, digest: &Digest, location: &str) {
        let mut st = self.lock();
        st.clock += 1;
        let now = st.clock;
        st.known_locations
            .entry((scope.clone(), digest.clone()))
            .or_default()
            .insert(location.to_string(), now);
    }

    fn record_digest_compressor_data(&self, digest: &Digest, data: DigestCompressorData) {
        let mut st = self.lock();
        if let Some(previous) = st.compressors.get(digest) {
            if previous.base_variant_compressor != data.base_variant_compressor {
                warn!(
                    blob = %digest,
                    previous = %previous.base_variant_compressor,
                    now = %data.base_variant_compressor,
                    "compressor for blob changed"
                );
            }
        }
        if data.base_variant_compressor == UNKNOWN_COMPRESSION {
            st.compressors.remove(digest);
            return;
        }
        st.compressors.insert(digest.clone(), data);
    }

    fn candidate_locations(
        &self,
        scope: &LocationScope,
        primary: &Digest,
        options: &CandidateLocationsOptions,
    ) -> Vec<ReplacementCandidate> {
        let st = self.lock();
        let mut out = Vec::new();
        st.append_candidates(&mut out, scope, primary, options);
        let mut uncompressed = None;
        if options.can_substitute {
            uncompressed = st.uncompressed_digest(primary);
            if let Some(u) = &uncompressed {
                if let Some(others) = st.digests_by_uncompressed.get(u) {
                    for d in others {
                        if d != primary && d != u {
                            st.append_candidates(&mut out, scope, d, options);
                        }
                    }
                }
                if u != primary {
                    st.append_candidates(&mut out, scope, u, options);
                }
            }
        }
        prioritize(out, primary, uncompressed.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Digest {
        Digest::from_bytes(s.as_bytes())
    }

    fn scope() -> LocationScope {
        LocationScope {
            transport: "docker".into(),
            scope: "example.com/repo".into(),
        }
    }

    fn compressor(base: &str) -> DigestCompressorData {
        DigestCompressorData {
            base_variant_compressor: base.into(),
            specific_variant_compressor: UNKNOWN_COMPRESSION.into(),
            specific_variant_annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn uncompressed_digest_lookup() {
        let cache = MemoryCache::new();
        let (gz, plain) = (d("gz"), d("plain"));
        assert_eq!(cache.uncompressed_digest(&gz), None);
        cache.record_digest_uncompressed_pair(&gz, &plain);
        assert_eq!(cache.uncompressed_digest(&gz), Some(plain.clone()));
        // Known as an uncompressed digest itself.
        assert_eq!(cache.uncompressed_digest(&plain), Some(plain));
    }

    #[test]
    fn toc_pairs() {
        let cache = MemoryCache::new();
        cache.record_toc_uncompressed_pair(&d("toc"), &d("plain"));
        assert_eq!(cache.uncompressed_digest_for_toc(&d("toc")), Some(d("plain")));
        assert_eq!(cache.uncompressed_digest_for_toc(&d("other")), None);
    }

    #[test]
    fn candidates_primary_first_uncompressed_last() {
        let cache = MemoryCache::new();
        let (primary, zstd, plain) = (d("gz"), d("zstd"), d("plain"));
        cache.record_digest_uncompressed_pair(&primary, &plain);
        cache.record_digest_uncompressed_pair(&zstd, &plain);
        cache.record_digest_compressor_data(&primary, compressor("gzip"));
        cache.record_digest_compressor_data(&zstd, compressor("zstd"));
        cache.record_digest_compressor_data(&plain, compressor(UNCOMPRESSED));
        cache.record_known_location(&scope(), &plain, "a");
        cache.record_known_location(&scope(), &zstd, "b");
        cache.record_known_location(&scope(), &primary, "c");

        let opts = CandidateLocationsOptions {
            can_substitute: true,
            ..Default::default()
        };
        let got: Vec<Digest> = cache
            .candidate_locations(&scope(), &primary, &opts)
            .into_iter()
            .map(|c| c.digest)
            .collect();
        assert_eq!(got, vec![primary.clone(), zstd, plain]);

        let no_subst = CandidateLocationsOptions::default();
        assert_eq!(cache.candidate_locations(&scope(), &primary, &no_subst).len(), 1);
    }

    #[test]
    fn candidates_capped_and_newest_first() {
        let cache = MemoryCache::new();
        let primary = d("p");
        cache.record_digest_compressor_data(&primary, compressor("gzip"));
        for i in 0..8 {
            cache.record_known_location(&scope(), &primary, &format!("loc{}", i));
        }
        let got = cache.candidate_locations(&scope(), &primary, &CandidateLocationsOptions::default());
        assert_eq!(got.len(), 5);
        assert_eq!(got[0].location.as_deref(), Some("loc7"));
    }

    #[test]
    fn unknown_compression_dropped_under_conditions() {
        let cache = MemoryCache::new();
        let primary = d("p");
        cache.record_known_location(&scope(), &primary, "x");
        let plain = CandidateLocationsOptions::default();
        assert_eq!(cache.candidate_locations(&scope(), &primary, &plain).len(), 1);

        let strict = CandidateLocationsOptions {
            conditions: ReuseConditions {
                required_compression: Some(Algorithm::Zstd),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cache.candidate_locations(&scope(), &primary, &strict).is_empty());
    }

    #[test]
    fn unknown_compressor_record_deletes() {
        let cache = MemoryCache::new();
        let primary = d("p");
        cache.record_digest_compressor_data(&primary, compressor("zstd"));
        cache.record_digest_compressor_data(&primary, DigestCompressorData::unknown());
        cache.record_known_location(&scope(), &primary, "x");
        let got = cache.candidate_locations(&scope(), &primary, &CandidateLocationsOptions::default());
        assert_eq!(got[0].compression_algorithm, None);
    }

    #[test]
    fn unknown_locations_only_on_request() {
        let cache = MemoryCache::new();
        let primary = d("p");
        cache.record_digest_compressor_data(&primary, compressor("gzip"));
        assert!(cache
            .candidate_locations(&scope(), &primary, &CandidateLocationsOptions::default())
            .is_empty());
        let opts = CandidateLocationsOptions {
            include_unknown_locations: true,
            ..Default::default()
        };
        let got = cache.candidate_locations(&scope(), &primary, &opts);
        assert_eq!(got.len(), 1);
        assert!(got[0].location.is_none());
    }
}
