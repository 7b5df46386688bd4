//! Compression algorithm descriptors.
//!
//! Only names, magic numbers and the annotation keys that identify seekable
//! ("chunked") layers live here; the streaming codecs are in the engine.

use std::collections::BTreeMap;
use std::fmt;

use crate::digest::Digest;
use crate::error::{OciError, Result};

/// Annotation carrying the digest of a zstd:chunked table of contents.
pub const ZSTD_CHUNKED_MANIFEST_CHECKSUM_KEY: &str =
    "io.github.containers.zstd-chunked.manifest-checksum";
/// Annotation carrying `offset:length:uncompressed_length:type` of the TOC frame.
pub const ZSTD_CHUNKED_MANIFEST_POSITION_KEY: &str =
    "io.github.containers.zstd-chunked.manifest-position";
/// Annotation carrying the digest of an eStargz table of contents.
pub const ESTARGZ_TOC_DIGEST_KEY: &str = "containerd.io/snapshot/stargz/toc.digest";

/// A layer compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    /// zstd with independently decompressible chunks and a table of contents.
    ZstdChunked,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::Gzip,
        Algorithm::Bzip2,
        Algorithm::Xz,
        Algorithm::Zstd,
        Algorithm::ZstdChunked,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Bzip2 => "bzip2",
            Algorithm::Xz => "xz",
            Algorithm::Zstd => "zstd",
            Algorithm::ZstdChunked => "zstd:chunked",
        }
    }

    /// The algorithm whose decompressor can read this variant.
    pub fn base_variant(self) -> Algorithm {
        match self {
            Algorithm::ZstdChunked => Algorithm::Zstd,
            other => other,
        }
    }

    pub fn base_variant_name(self) -> &'static str {
        self.base_variant().name()
    }

    pub fn by_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name() == name)
            .ok_or_else(|| OciError::UnknownCompression(name.to_string()))
    }

    /// Leading bytes of a stream compressed with this algorithm.
    pub fn magic(self) -> &'static [u8] {
        match self {
            Algorithm::Gzip => &[0x1f, 0x8b, 0x08],
            Algorithm::Bzip2 => b"BZh",
            Algorithm::Xz => &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00],
            Algorithm::Zstd | Algorithm::ZstdChunked => &[0x28, 0xb5, 0x2f, 0xfd],
        }
    }

    /// Accepted compression levels.
    pub fn level_range(self) -> std::ops::RangeInclusive<i32> {
        match self {
            Algorithm::Gzip | Algorithm::Bzip2 => 1..=9,
            Algorithm::Xz => 0..=9,
            Algorithm::Zstd | Algorithm::ZstdChunked => 1..=22,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Longest magic number; readers must supply at least this much to [`detect`]
/// unless the stream is shorter.
pub const MAX_MAGIC_LEN: usize = 6;

/// Identify the base compression algorithm of a stream from its first bytes.
///
/// Never reports [`Algorithm::ZstdChunked`]; whether a zstd stream is chunked
/// is decided from its annotations, see [`toc_digest`].
pub fn detect(header: &[u8]) -> Option<Algorithm> {
    [Algorithm::Gzip, Algorithm::Bzip2, Algorithm::Xz, Algorithm::Zstd]
        .into_iter()
        .find(|a| header.starts_with(a.magic()))
}

/// The table-of-contents digest recorded in layer annotations, if any.
pub fn toc_digest(annotations: &BTreeMap<String, String>) -> Result<Option<Digest>> {
    let chunked = annotations.get(ZSTD_CHUNKED_MANIFEST_CHECKSUM_KEY);
    let estargz = annotations.get(ESTARGZ_TOC_DIGEST_KEY);
    match (chunked, estargz) {
        (Some(_), Some(_)) => Err(OciError::Manifest(
            "both zstd:chunked and eStargz TOC found".to_string(),
        )),
        (Some(d), None) | (None, Some(d)) => Digest::parse(d).map(Some),
        (None, None) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
