//! Image signatures: "simple signing" payloads sealed with Ed25519.
//!
//! A signature binds a manifest digest to a registry reference. The payload
//! is JSON; the stored form is an envelope with the base64 payload, the
//! base64 signature over those payload bytes, and the signing key's
//! fingerprint.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use tracing::debug;

use imgcopy_oci::manifest::matches_digest;
use imgcopy_oci::{Digest, ImageRef};

use crate::error::{Error, Result};

pub const SIGNATURE_TYPE: &str = "atomic container signature";
const KEY_KDF_ITERATIONS: u32 = 100_000;

/// A stored signature envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub payload: String,
    pub signature: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
}

impl Signature {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Signature(format!("invalid signature: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedImage {
    #[serde(rename = "docker-manifest-digest")]
    pub manifest_digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedIdentity {
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critical {
    #[serde(rename = "type")]
    pub kind: String,
    pub image: SignedImage,
    pub identity: SignedIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Optional {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// The signed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub critical: Critical,
    #[serde(default)]
    pub optional: Optional,
}

/// Produces signatures for manifests being written.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Shown before signing, e.g. "Signing image with key abcd…".
    fn progress_message(&self) -> String;

    async fn sign_image_manifest(&self, manifest: &[u8], identity: &ImageRef) -> Result<Signature>;

    /// Release resources; called once when the copy returns.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Short key identifier: the first 16 hex characters of the public key's SHA-256.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    Digest::from_bytes(public_key).encoded()[..16].to_string()
}

pub struct Ed25519Signer {
    key_pair: Ed25519KeyPair,
    key_id: String,
}

impl Ed25519Signer {
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| Error::Signature(format!("invalid Ed25519 key: {}", e)))?;
        let key_id = key_fingerprint(key_pair.public_key().as_ref());
        Ok(Self { key_pair, key_id })
    }

    /// Load a key written by [`generate_signing_key`]. Keys written with a
    /// passphrase require the same passphrase.
    pub fn from_file(path: &Path, passphrase: Option<&str>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let pkcs8 = decode_private_key(text.trim(), passphrase)
            .map_err(|e| e.context(format!("loading signing key {}", path.display())))?;
        Self::from_pkcs8(&pkcs8)
    }

    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    fn progress_message(&self) -> String {
        format!("Signing image with Ed25519 key {}", self.key_id)
    }

    async fn sign_image_manifest(&self, manifest: &[u8], identity: &ImageRef) -> Result<Signature> {
        let manifest_digest = imgcopy_oci::manifest::manifest_digest(manifest)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .ok();
        let payload = Payload {
            critical: Critical {
                kind: SIGNATURE_TYPE.to_string(),
                image: SignedImage { manifest_digest },
                identity: SignedIdentity {
                    docker_reference: identity.to_string(),
                },
            },
            optional: Optional {
                creator: Some(format!("imgcopy {}", env!("CARGO_PKG_VERSION"))),
                timestamp,
            },
        };
        let payload = serde_json::to_vec(&payload)?;
        let sig = self.key_pair.sign(&payload);
        debug!(key = %self.key_id, identity = %identity, "signed manifest");
        Ok(Signature {
            payload: B64.encode(&payload),
            signature: B64.encode(sig.as_ref()),
            key_id: self.key_id.clone(),
        })
    }
}

/// Check `signature` against `public_key` and return the signed payload.
/// Does not interpret the payload beyond its type.
pub fn verify(signature: &Signature, public_key: &[u8]) -> Result<Payload> {
    if signature.key_id != key_fingerprint(public_key) {
        return Err(Error::Signature(format!(
            "signature made by key {}, not {}",
            signature.key_id,
            key_fingerprint(public_key)
        )));
    }
    let payload = B64
        .decode(&signature.payload)
        .map_err(|e| Error::Signature(format!("invalid payload encoding: {}", e)))?;
    let sig = B64
        .decode(&signature.signature)
        .map_err(|e| Error::Signature(format!("invalid signature encoding: {}", e)))?;
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(&payload, &sig)
        .map_err(|_| Error::Signature("cryptographic signature verification failed".into()))?;
    let payload: Payload = serde_json::from_slice(&payload)
        .map_err(|e| Error::Signature(format!("invalid signature payload: {}", e)))?;
    if payload.critical.kind != SIGNATURE_TYPE {
        return Err(Error::Signature(format!(
            "unrecognized signature type {:?}",
            payload.critical.kind
        )));
    }
    Ok(payload)
}

/// Verify `signature` and check it names `manifest`. Returns the signed
/// reference.
pub fn verify_image_manifest(signature: &Signature, public_key: &[u8], manifest: &[u8]) -> Result<String> {
    let payload = verify(signature, public_key)?;
    if !matches_digest(manifest, &payload.critical.image.manifest_digest)? {
        return Err(Error::Signature(format!(
            "signature is for manifest {}, not the image's manifest",
            payload.critical.image.manifest_digest
        )));
    }
    Ok(payload.critical.identity.docker_reference)
}

// ---------------------------------------------------------------------------
// Key files
// ---------------------------------------------------------------------------

/// A passphrase-protected key file.
#[derive(Serialize, Deserialize)]
struct SealedKeyFile {
    kdf: String,
    iterations: u32,
    salt: String,
    nonce: String,
    sealed: String,
}

/// Generate an Ed25519 key. Returns the private key file contents (base64
/// PKCS#8, or a JSON document when `passphrase` is set) and the base64
/// public key.
pub fn generate_signing_key(passphrase: Option<&str>) -> Result<(String, String)> {
    let rng = ring::rand::SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| Error::Signature("failed to generate Ed25519 key".into()))?;
    let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
        .map_err(|e| Error::Signature(format!("invalid Ed25519 key: {}", e)))?;
    let public = B64.encode(key_pair.public_key().as_ref());
    let private = match passphrase {
        None => B64.encode(pkcs8.as_ref()),
        Some(p) => seal_private_key(pkcs8.as_ref(), p)?,
    };
    Ok((private, public))
}

/// Read a base64 public key file.
pub fn load_public_key(path: &Path) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    decode_public_key(text.trim())
        .map_err(|e| e.context(format!("loading public key {}", path.display())))
}

pub fn decode_public_key(data: &str) -> Result<Vec<u8>> {
    let raw = B64
        .decode(data.trim())
        .map_err(|e| Error::Signature(format!("invalid public key encoding: {}", e)))?;
    if raw.len() != 32 {
        return Err(Error::Signature(format!(
            "Ed25519 public key must be 32 bytes, got {}",
            raw.len()
        )));
    }
    Ok(raw)
}

fn passphrase_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<LessSafeKey> {
    let mut key = [0u8; 32];
    let iterations = std::num::NonZeroU32::new(iterations)
        .ok_or_else(|| Error::Signature("key file has zero KDF iterations".into()))?;
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &key)
        .map_err(|_| Error::Signature("failed to derive key file key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn seal_private_key(pkcs8: &[u8], passphrase: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::fill(&mut salt)
        .and_then(|_| getrandom::fill(&mut nonce))
        .map_err(|e| Error::Signature(format!("Failed to generate random bytes: {}", e)))?;
    let key = passphrase_key(passphrase, &salt, KEY_KDF_ITERATIONS)?;
    let mut in_out = pkcs8.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| Error::Signature("failed to seal private key".into()))?;
    Ok(serde_json::to_string_pretty(&SealedKeyFile {
        kdf: "pbkdf2-sha256".to_string(),
        iterations: KEY_KDF_ITERATIONS,
        salt: B64.encode(salt),
        nonce: B64.encode(nonce),
        sealed: B64.encode(in_out),
    })?)
}

fn decode_private_key(text: &str, passphrase: Option<&str>) -> Result<Vec<u8>> {
    if !text.starts_with('{') {
        return B64
            .decode(text)
            .map_err(|e| Error::Signature(format!("invalid private key encoding: {}", e)));
    }
    let file: SealedKeyFile = serde_json::from_str(text)?;
    if file.kdf != "pbkdf2-sha256" {
        return Err(Error::Signature(format!("unsupported key derivation {:?}", file.kdf)));
    }
    let passphrase = passphrase
        .ok_or_else(|| Error::Signature("private key is protected by a passphrase".into()))?;
    let decode = |v: &str| {
        B64.decode(v)
            .map_err(|e| Error::Signature(format!("invalid key file: {}", e)))
    };
    let salt = decode(&file.salt)?;
    let nonce: [u8; NONCE_LEN] = decode(&file.nonce)?
        .try_into()
        .map_err(|_| Error::Signature("invalid key file nonce".into()))?;
    let mut sealed = decode(&file.sealed)?;
    let key = passphrase_key(passphrase, &salt, file.iterations)?;
    let plain = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
        .map_err(|_| Error::Signature("wrong passphrase for private key".into()))?;
    Ok(plain.to_vec())
}
