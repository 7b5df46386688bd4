use std::fmt;

use crate::digest::Digest;
use crate::error::{OciError, Result};

/// Domain used for references without an explicit registry.
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// Host actually serving [`DEFAULT_DOMAIN`].
pub const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed, normalized registry image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry domain (e.g. "docker.io", "localhost:5000").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    /// - `repo:tag@sha256:abc123`
    ///
    /// A reference with neither tag nor digest gets the `latest` tag.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut r = Self::parse_name_only(raw)?;
        if r.tag.is_none() && r.digest.is_none() {
            r.tag = Some(DEFAULT_TAG.to_string());
        }
        Ok(r)
    }

    /// Like [`ImageRef::parse`], but leaves a missing tag unset.
    pub fn parse_name_only(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid(raw, "empty image reference"));
        }

        let (rest, digest) = match raw.split_once('@') {
            Some((name, d)) => (
                name,
                Some(Digest::parse(d).map_err(|e| invalid(raw, &e.to_string()))?),
            ),
            None => (raw, None),
        };

        // A tag colon always comes after the last '/'; anything before that
        // is a registry port.
        let after_last_slash = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match rest.rfind(':') {
            Some(colon) if colon >= after_last_slash => {
                (&rest[..colon], Some(rest[colon + 1..].to_string()))
            }
            _ => (rest, None),
        };
        if let Some(tag) = &tag {
            validate_tag(raw, tag)?;
        }

        // A component is treated as a registry hostname when it contains a
        // dot or a colon (port), or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name_part.to_string()),
        };
        let registry = if registry == "index.docker.io" {
            DEFAULT_DOMAIN.to_string()
        } else {
            registry
        };

        // Docker Hub official images without "library/" prefix.
        let repository = if registry == DEFAULT_DOMAIN && !repository.contains('/') {
            format!("{}{}", OFFICIAL_REPO_PREFIX, repository)
        } else {
            repository
        };
        validate_repository(raw, &repository)?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The tag or digest used in `/v2/<repo>/manifests/<reference>` URLs.
    /// A digest wins over a tag.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// `registry/repository` without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The host serving this reference's registry.
    pub fn registry_host(&self) -> &str {
        if self.registry == DEFAULT_DOMAIN {
            DEFAULT_REGISTRY_HOST
        } else {
            &self.registry
        }
    }

    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            tag: None,
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Scopes this reference belongs to, most specific first: the full name
    /// (with tag or digest), then every parent repository namespace, then
    /// the registry domain.
    pub fn policy_namespaces(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut name = self.name();
        out.push(name.clone());
        while let Some(pos) = name.rfind('/') {
            name.truncate(pos);
            out.push(name.clone());
        }
        out
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(t) = &self.tag {
            write!(f, ":{}", t)?;
        }
        if let Some(d) = &self.digest {
            write!(f, "@{}", d)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageRef {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(raw: &str, msg: &str) -> OciError {
    OciError::InvalidReference(raw.to_string(), msg.to_string())
}

fn validate_tag(raw: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || tag.len() > 128 || !chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c)) {
        return Err(invalid(raw, &format!("invalid tag {:?}", tag)));
    }
    Ok(())
}

fn validate_repository(raw: &str, repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(invalid(raw, "empty repository"));
    }
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c));
        if !valid {
            return Err(invalid(
                raw,
                &format!("repository name component {:?} must be lowercase alphanumeric", component),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
