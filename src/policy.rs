//! Signature admission policy.
//!
//! A policy maps transport scopes to lists of requirements; every
//! requirement of the most specific matching scope must accept an image
//! before it is copied.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use imgcopy_oci::ImageRef;

use crate::error::{Error, Result};
use crate::image::UnparsedImage;
use crate::signature::{decode_public_key, load_public_key, verify_image_manifest};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
    pub default: Vec<Requirement>,
    #[serde(default)]
    pub transports: HashMap<String, HashMap<String, Vec<Requirement>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Requirement {
    InsecureAcceptAnything,
    Reject,
    #[serde(rename_all = "camelCase")]
    SignedBy {
        key_type: String,
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        key_data: Option<String>,
        #[serde(default)]
        signed_identity: IdentityMatch,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IdentityMatch {
    /// Digest references match any signature for the same repository;
    /// tag references need an exact match.
    #[default]
    MatchRepoDigestOrExact,
    MatchExact,
}

impl Policy {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let policy: Policy = serde_json::from_slice(data)
            .map_err(|e| Error::Config(format!("invalid policy: {}", e)))?;
        if policy.default.is_empty() {
            return Err(Error::Config(
                "invalid policy: \"default\" must contain at least one requirement".into(),
            ));
        }
        for scopes in policy.transports.values() {
            for (scope, reqs) in scopes {
                if reqs.is_empty() {
                    return Err(Error::Config(format!(
                        "invalid policy: no requirements for scope {:?}",
                        scope
                    )));
                }
            }
        }
        Ok(policy)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_slice(&data).map_err(|e| e.context(format!("loading {}", path.display())))
    }

    /// Accept everything.
    pub fn insecure_accept_anything() -> Self {
        Self {
            default: vec![Requirement::InsecureAcceptAnything],
            transports: HashMap::new(),
        }
    }
}

/// Evaluates a [`Policy`] against source images.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    policy: Policy,
}

impl PolicyContext {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    /// The requirements that apply to an image known by `identity` and
    /// `namespaces` within `transport`.
    fn requirements_for(&self, transport: &str, identity: &str, namespaces: &[String]) -> &[Requirement] {
        if let Some(scopes) = self.policy.transports.get(transport) {
            let candidates = std::iter::once(identity)
                .chain(namespaces.iter().map(String::as_str))
                .chain(std::iter::once(""));
            for scope in candidates {
                if let Some(reqs) = scopes.get(scope) {
                    debug!(transport, scope, "using policy scope");
                    return reqs;
                }
            }
        }
        &self.policy.default
    }

    /// `Ok` if every applicable requirement accepts `image`, otherwise
    /// [`Error::PolicyRejected`].
    pub async fn is_running_image_allowed(&self, image: &UnparsedImage<'_>) -> Result<()> {
        let reference = image.reference();
        let reqs = self.requirements_for(
            reference.transport_name(),
            &reference.policy_configuration_identity(),
            &reference.policy_configuration_namespaces(),
        );
        for req in reqs {
            match req {
                Requirement::InsecureAcceptAnything => {}
                Requirement::Reject => {
                    return Err(Error::PolicyRejected(format!(
                        "Running image {} is rejected by policy.",
                        reference
                    )));
                }
                Requirement::SignedBy {
                    key_type,
                    key_path,
                    key_data,
                    signed_identity,
                } => {
                    if key_type != "ed25519" {
                        return Err(Error::PolicyRejected(format!(
                            "unsupported signedBy key type {:?}",
                            key_type
                        )));
                    }
                    let key = match (key_path, key_data) {
                        (Some(path), None) => load_public_key(Path::new(path)),
                        (None, Some(data)) => decode_public_key(data),
                        _ => Err(Error::Config(
                            "signedBy requires exactly one of keyPath and keyData".into(),
                        )),
                    }
                    .map_err(|e| Error::PolicyRejected(e.to_string()))?;
                    self.check_signed_by(image, &key, signed_identity).await?;
                }
            }
        }
        Ok(())
    }

    async fn check_signed_by(
        &self,
        image: &UnparsedImage<'_>,
        key: &[u8],
        identity: &IdentityMatch,
    ) -> Result<()> {
        let signatures = image.signatures().await?;
        if signatures.is_empty() {
            return Err(Error::PolicyRejected(
                "A signature was required, but no signature exists".into(),
            ));
        }
        let (manifest, _) = image.manifest().await?;
        let image_ref = image.reference().docker_reference();
        let mut rejections = Vec::new();
        for sig in signatures {
            let outcome = verify_image_manifest(sig, key, manifest).and_then(|signed| {
                if identity_matches(identity, image_ref.as_ref(), &signed) {
                    Ok(())
                } else {
                    Err(Error::Signature(format!(
                        "Signature for identity {:?} is not accepted",
                        signed
                    )))
                }
            });
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => rejections.push(e.to_string()),
            }
        }
        Err(Error::PolicyRejected(match rejections.as_slice() {
            [one] => one.clone(),
            many => format!("None of the signatures were accepted, reasons: {}", many.join("; ")),
        }))
    }
}

fn identity_matches(rule: &IdentityMatch, image: Option<&ImageRef>, signed: &str) -> bool {
    let Some(image) = image else {
        return false;
    };
    let Ok(signed) = ImageRef::parse_name_only(signed) else {
        return false;
    };
    match rule {
        IdentityMatch::MatchRepoDigestOrExact if image.digest.is_some() => {
            image.name() == signed.name()
        }
        _ => image.to_string() == signed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(hex_char: char) -> String {
        format!("sha256:{}", hex_char.to_string().repeat(64))
    }

    #[test]
    fn parse_policy_shapes() {
        let p = Policy::from_slice(
            br#"{
                "default": [{"type": "reject"}],
                "transports": {
                    "docker": {
                        "docker.io/library/busybox": [{"type": "insecureAcceptAnything"}],
                        "quay.io": [{"type": "signedBy", "keyType": "ed25519", "keyData": "AAAA"}]
                    }
                }
            }"#,
        )
        .unwrap();
        assert!(matches!(p.default[0], Requirement::Reject));
        let quay = &p.transports["docker"]["quay.io"][0];
        match quay {
            Requirement::SignedBy { signed_identity, .. } => {
                assert_eq!(*signed_identity, IdentityMatch::MatchRepoDigestOrExact)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_default_rejected() {
        assert!(Policy::from_slice(br#"{"default": []}"#).is_err());
    }

    #[test]
    fn scope_lookup_most_specific_first() {
        let p = Policy::from_slice(
            br#"{
                "default": [{"type": "reject"}],
                "transports": {
                    "docker": {
                        "": [{"type": "reject"}],
                        "docker.io/library": [{"type": "insecureAcceptAnything"}]
                    }
                }
            }"#,
        )
        .unwrap();
        let ctx = PolicyContext::new(p);
        let r = ImageRef::parse("busybox").unwrap();
        let reqs = ctx.requirements_for("docker", &r.to_string(), &r.policy_namespaces());
        assert!(matches!(reqs[0], Requirement::InsecureAcceptAnything));

        let other = ImageRef::parse("quay.io/a/b:1").unwrap();
        let reqs = ctx.requirements_for("docker", &other.to_string(), &other.policy_namespaces());
        assert!(matches!(reqs[0], Requirement::Reject));

        let reqs = ctx.requirements_for("dir", "/tmp/x", &[]);
        assert!(matches!(reqs[0], Requirement::Reject));
    }

    #[test]
    fn identity_rules() {
        let tagged = ImageRef::parse("quay.io/a/b:1").unwrap();
        assert!(identity_matches(&IdentityMatch::MatchExact, Some(&tagged), "quay.io/a/b:1"));
        assert!(!identity_matches(&IdentityMatch::MatchExact, Some(&tagged), "quay.io/a/b:2"));
        assert!(!identity_matches(
            &IdentityMatch::MatchRepoDigestOrExact,
            Some(&tagged),
            "quay.io/a/b:2"
        ));

        let digested = ImageRef::parse(&format!("quay.io/a/b@{}", d('a'))).unwrap();
        assert!(identity_matches(
            &IdentityMatch::MatchRepoDigestOrExact,
            Some(&digested),
            "quay.io/a/b:anything"
        ));
        assert!(!identity_matches(&IdentityMatch::MatchExact, Some(&digested), "quay.io/a/b:1"));
        assert!(!identity_matches(&IdentityMatch::MatchExact, None, "quay.io/a/b:1"));
    }
}
