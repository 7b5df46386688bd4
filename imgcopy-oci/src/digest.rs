use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{OciError, Result};

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

/// Hash algorithms a digest may be verified with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// The canonical algorithm used for newly computed digests.
    pub const CANONICAL: DigestAlgorithm = DigestAlgorithm::Sha256;

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    /// Start a new running hash.
    pub fn digester(self) -> Digester {
        match self {
            DigestAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Digester::Sha512(Sha512::new()),
        }
    }
}

/// A running hash that finishes into a [`Digest`].
#[derive(Clone)]
pub enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Digester::Sha256(_) => DigestAlgorithm::Sha256,
            Digester::Sha512(_) => DigestAlgorithm::Sha512,
        }
    }

    pub fn finish(self) -> Digest {
        let (alg, hex) = match self {
            Digester::Sha256(h) => (DigestAlgorithm::Sha256, hex_encode(&h.finalize())),
            Digester::Sha512(h) => (DigestAlgorithm::Sha512, hex_encode(&h.finalize())),
        };
        Digest(format!("{}:{}", alg.name(), hex))
    }
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// A content digest of the form `algorithm:encoded`.
///
/// Only the shape is validated on parse; algorithms we cannot compute are
/// rejected later, when a caller actually needs to verify content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(raw: &str) -> Result<Self> {
        let (alg, encoded) = raw
            .split_once(':')
            .ok_or_else(|| OciError::InvalidDigest(raw.to_string(), "missing ':'".into()))?;
        let alg_ok = !alg.is_empty()
            && alg
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
        if !alg_ok {
            return Err(OciError::InvalidDigest(
                raw.to_string(),
                "invalid algorithm component".into(),
            ));
        }
        if encoded.is_empty()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c))
        {
            return Err(OciError::InvalidDigest(
                raw.to_string(),
                "invalid encoded component".into(),
            ));
        }
        if let Some(known) = DigestAlgorithm::from_name(alg) {
            if encoded.len() != known.hex_len()
                || !encoded
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            {
                return Err(OciError::InvalidDigest(
                    raw.to_string(),
                    format!("not a valid {} hex value", known.name()),
                ));
            }
        }
        Ok(Self(raw.to_string()))
    }

    /// Canonical (sha256) digest of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut d = DigestAlgorithm::CANONICAL.digester();
        d.update(data);
        d.finish()
    }

    pub fn algorithm_name(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// The algorithm, if it is one we can compute.
    pub fn algorithm(&self) -> Result<DigestAlgorithm> {
        DigestAlgorithm::from_name(self.algorithm_name())
            .ok_or_else(|| OciError::UnsupportedDigestAlgorithm(self.algorithm_name().to_string()))
    }

    /// The encoded (hex) portion.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> Result<bool> {
        let mut d = self.algorithm()?.digester();
        d.update(data);
        Ok(&d.finish() == self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = OciError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
