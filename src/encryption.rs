//! Layer encryption: AES-256-GCM over fixed-size segments, with the content
//! key sealed for each recipient key-encryption key (KEK).
//!
//! Encrypted layer wire format: a sequence of `ciphertext || tag` segments of
//! [`SEGMENT_SIZE`] plaintext bytes each. The final segment is shorter than
//! that (possibly empty) and is authenticated with a "last" marker, so
//! truncation and reordering are detected.
//!
//! Sealed blobs (private options) are `nonce (12 bytes) || ciphertext || tag`.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::Bytes;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use imgcopy_oci::{Digest, DigestAlgorithm, Digester};

use crate::error::{Error, Result};
use crate::types::BlobReader;

/// Annotation holding the sealed private options, one entry per recipient.
pub const KEYS_ANNOTATION: &str = "org.opencontainers.image.enc.keys.imgcopy";
/// Annotation holding the public cipher options.
pub const PUBOPTS_ANNOTATION: &str = "org.opencontainers.image.enc.pubopts";
/// Prefix shared by all encryption annotations.
pub const ANNOTATION_PREFIX: &str = "org.opencontainers.image.enc";

/// Plaintext bytes per segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const CIPHER_NAME: &str = "AES_256_GCM_SEGMENTED";

/// A 256-bit key-encryption key.
#[derive(Clone)]
pub struct Kek {
    key: [u8; 32],
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").field("id", &self.id()).finish()
    }
}

impl Kek {
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key)
            .map_err(|e| Error::Encryption(format!("Failed to generate key: {}", e)))?;
        Ok(Self { key })
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Read a base64-encoded key file, as written by `imgcopy keygen --kek`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let raw = B64
            .decode(text.trim())
            .map_err(|e| Error::Encryption(format!("{}: invalid key encoding: {}", path.display(), e)))?;
        let key: [u8; 32] = raw.try_into().map_err(|_| {
            Error::Encryption(format!("{}: key must be 32 bytes", path.display()))
        })?;
        Ok(Self { key })
    }

    pub fn to_base64(&self) -> String {
        B64.encode(self.key)
    }

    /// Short fingerprint naming the key in annotations.
    pub fn id(&self) -> String {
        Digest::from_bytes(&self.key).encoded()[..16].to_string()
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        random(&mut nonce)?;
        let key = aead_key(&self.key)?;
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| Error::Encryption("AES-256-GCM seal failed".into()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Encryption("Sealed blob too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| Error::Encryption("Invalid nonce in sealed blob".into()))?;
        let key = aead_key(&self.key)?;
        let mut in_out = ciphertext.to_vec();
        let plain = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| Error::Encryption("AES-256-GCM open failed".into()))?;
        Ok(plain.to_vec())
    }
}

/// Recipients of newly encrypted layers.
#[derive(Debug, Clone, Default)]
pub struct EncryptConfig {
    pub recipients: Vec<Kek>,
}

/// Keys able to open encrypted layers.
#[derive(Debug, Clone, Default)]
pub struct DecryptConfig {
    pub keys: Vec<Kek>,
}

fn random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| Error::Encryption(format!("Failed to generate random bytes: {}", e)))
}

fn aead_key(key: &[u8; 32]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn segment_nonce(base: &[u8; NONCE_LEN], counter: u64) -> Nonce {
    let mut n = *base;
    for (b, c) in n[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
        *b ^= c;
    }
    Nonce::assume_unique_for_key(n)
}

fn segment_aad(last: bool) -> Aad<[u8; 1]> {
    Aad::from([u8::from(last)])
}

#[derive(Serialize, Deserialize)]
struct PrivateOptions {
    #[serde(rename = "symmetricKey")]
    symmetric_key: String,
    nonce: String,
    digest: Digest,
}

#[derive(Serialize, Deserialize)]
struct PublicOptions {
    cipher: String,
    #[serde(rename = "segmentSize")]
    segment_size: usize,
}

#[derive(Serialize, Deserialize)]
struct WrappedKey {
    kid: String,
    sealed: String,
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Produces the encryption annotations once the encrypted stream was read
/// to the end.
pub struct EncryptionFinalizer {
    recipients: Vec<Kek>,
    key: [u8; 32],
    nonce: [u8; NONCE_LEN],
    plaintext_digest: Arc<Mutex<Option<Digest>>>,
}

impl EncryptionFinalizer {
    pub fn finalize(self) -> Result<BTreeMap<String, String>> {
        let digest = self
            .plaintext_digest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| Error::Encryption("layer was not fully encrypted".into()))?;
        let private = serde_json::to_vec(&PrivateOptions {
            symmetric_key: B64.encode(self.key),
            nonce: B64.encode(self.nonce),
            digest,
        })?;
        let mut wrapped = Vec::with_capacity(self.recipients.len());
        for kek in &self.recipients {
            let entry = WrappedKey {
                kid: kek.id(),
                sealed: B64.encode(kek.seal(&private)?),
            };
            wrapped.push(B64.encode(serde_json::to_vec(&entry)?));
        }
        let public = serde_json::to_vec(&PublicOptions {
            cipher: CIPHER_NAME.to_string(),
            segment_size: SEGMENT_SIZE,
        })?;
        Ok(BTreeMap::from([
            (KEYS_ANNOTATION.to_string(), wrapped.join(",")),
            (PUBOPTS_ANNOTATION.to_string(), B64.encode(public)),
        ]))
    }
}

struct EncryptState {
    input: BlobReader,
    key: LessSafeKey,
    nonce: [u8; NONCE_LEN],
    counter: u64,
    digester: Option<Digester>,
    plaintext_digest: Arc<Mutex<Option<Digest>>>,
}

/// Encrypt `input` for the recipients in `config`.
pub fn encrypt_layer(input: BlobReader, config: &EncryptConfig) -> Result<(BlobReader, EncryptionFinalizer)> {
    if config.recipients.is_empty() {
        return Err(Error::Encryption("no recipients specified".into()));
    }
    let mut key = [0u8; 32];
    random(&mut key)?;
    let mut nonce = [0u8; NONCE_LEN];
    random(&mut nonce)?;
    let plaintext_digest = Arc::new(Mutex::new(None));
    let state = EncryptState {
        input,
        key: aead_key(&key)?,
        nonce,
        counter: 0,
        digester: Some(DigestAlgorithm::CANONICAL.digester()),
        plaintext_digest: plaintext_digest.clone(),
    };
    let stream = futures_util::stream::try_unfold(state, |mut st| async move {
        let Some(mut digester) = st.digester.take() else {
            return Ok(None);
        };
        let mut segment = Vec::with_capacity(SEGMENT_SIZE + TAG_LEN);
        (&mut st.input)
            .take(SEGMENT_SIZE as u64)
            .read_to_end(&mut segment)
            .await?;
        digester.update(&segment);
        let last = segment.len() < SEGMENT_SIZE;
        st.key
            .seal_in_place_append_tag(segment_nonce(&st.nonce, st.counter), segment_aad(last), &mut segment)
            .map_err(|_| io::Error::other("AES-256-GCM seal failed"))?;
        st.counter += 1;
        if last {
            *st.plaintext_digest.lock().unwrap_or_else(|p| p.into_inner()) = Some(digester.finish());
        } else {
            st.digester = Some(digester);
        }
        Ok::<_, io::Error>(Some((Bytes::from(segment), st)))
    });
    let finalizer = EncryptionFinalizer {
        recipients: config.recipients.clone(),
        key,
        nonce,
        plaintext_digest,
    };
    Ok((Box::pin(StreamReader::new(stream)), finalizer))
}

// ---------------------------------------------------------------------------
// Decryption
// ---------------------------------------------------------------------------

struct DecryptState {
    input: BlobReader,
    key: LessSafeKey,
    nonce: [u8; NONCE_LEN],
    counter: u64,
    digester: Option<Digester>,
    expected: Digest,
}

/// Decrypt `input` using the annotations of its descriptor. Returns the
/// plaintext stream and the plaintext digest recorded at encryption time;
/// the stream fails at its end if the content does not match it.
pub fn decrypt_layer(
    input: BlobReader,
    annotations: &BTreeMap<String, String>,
    config: &DecryptConfig,
) -> Result<(BlobReader, Digest)> {
    let public = annotations
        .get(PUBOPTS_ANNOTATION)
        .ok_or_else(|| Error::Encryption("missing public encryption options".into()))?;
    let public: PublicOptions = serde_json::from_slice(
        &B64.decode(public)
            .map_err(|e| Error::Encryption(format!("invalid public options: {}", e)))?,
    )?;
    if public.cipher != CIPHER_NAME || public.segment_size != SEGMENT_SIZE {
        return Err(Error::Encryption(format!(
            "unsupported cipher {} with segment size {}",
            public.cipher, public.segment_size
        )));
    }

    let wrapped = annotations
        .get(KEYS_ANNOTATION)
        .ok_or_else(|| Error::Encryption("no wrapped keys for a supported key type".into()))?;
    let private = unwrap_private_options(wrapped, config)?;
    let key: [u8; 32] = decode_fixed(&private.symmetric_key, "symmetric key")?;
    let nonce: [u8; NONCE_LEN] = decode_fixed(&private.nonce, "nonce")?;

    let state = DecryptState {
        input,
        key: aead_key(&key)?,
        nonce,
        counter: 0,
        digester: Some(private.digest.algorithm()?.digester()),
        expected: private.digest.clone(),
    };
    let stream = futures_util::stream::try_unfold(state, |mut st| async move {
        let Some(mut digester) = st.digester.take() else {
            return Ok(None);
        };
        let mut segment = Vec::with_capacity(SEGMENT_SIZE + TAG_LEN);
        (&mut st.input)
            .take((SEGMENT_SIZE + TAG_LEN) as u64)
            .read_to_end(&mut segment)
            .await?;
        if segment.len() < TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "encrypted layer is truncated",
            ));
        }
        let last = segment.len() < SEGMENT_SIZE + TAG_LEN;
        let plain_len = st
            .key
            .open_in_place(segment_nonce(&st.nonce, st.counter), segment_aad(last), &mut segment)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "encrypted layer segment failed authentication"))?
            .len();
        segment.truncate(plain_len);
        digester.update(&segment);
        st.counter += 1;
        if last {
            let actual = digester.finish();
            if actual != st.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("decrypted layer digest {} does not match {}", actual, st.expected),
                ));
            }
        } else {
            st.digester = Some(digester);
        }
        Ok::<_, io::Error>(Some((Bytes::from(segment), st)))
    });
    Ok((Box::pin(StreamReader::new(stream)), private.digest))
}

fn unwrap_private_options(wrapped: &str, config: &DecryptConfig) -> Result<PrivateOptions> {
    for entry in wrapped.split(',').filter(|e| !e.is_empty()) {
        let Ok(raw) = B64.decode(entry) else { continue };
        let Ok(entry) = serde_json::from_slice::<WrappedKey>(&raw) else { continue };
        let Some(kek) = config.keys.iter().find(|k| k.id() == entry.kid) else {
            continue;
        };
        let sealed = B64
            .decode(&entry.sealed)
            .map_err(|e| Error::Encryption(format!("invalid wrapped key: {}", e)))?;
        return Ok(serde_json::from_slice(&kek.unseal(&sealed)?)?);
    }
    Err(Error::Encryption(
        "no suitable key found for decrypting layer key".into(),
    ))
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    B64.decode(value)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| Error::Encryption(format!("invalid {} in private options", what)))
}

/// Whether `mime_type` marks an encrypted layer.
pub fn is_encrypted_media_type(mime_type: &str) -> bool {
    mime_type.ends_with(imgcopy_oci::manifest::ENCRYPTED_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encrypt(data: &[u8], kek: &Kek) -> (Vec<u8>, BTreeMap<String, String>) {
        let config = EncryptConfig {
            recipients: vec![kek.clone()],
        };
        let (mut r, fin) = encrypt_layer(Box::pin(io::Cursor::new(data.to_vec())), &config).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        (out, fin.finalize().unwrap())
    }

    #[tokio::test]
    async fn round_trip_across_segments() {
        let kek = Kek::generate().unwrap();
        for len in [0, 10, SEGMENT_SIZE, SEGMENT_SIZE * 2 + 7] {
            let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let (ciphertext, annotations) = encrypt(&data, &kek).await;
            assert_ne!(ciphertext, data);
            let config = DecryptConfig {
                keys: vec![kek.clone()],
            };
            let (mut r, digest) =
                decrypt_layer(Box::pin(io::Cursor::new(ciphertext)), &annotations, &config).unwrap();
            assert_eq!(digest, Digest::from_bytes(&data));
            let mut plain = Vec::new();
            r.read_to_end(&mut plain).await.unwrap();
            assert_eq!(plain, data, "len {}", len);
        }
    }

    #[tokio::test]
    async fn truncation_detected() {
        let kek = Kek::generate().unwrap();
        let data = vec![1u8; SEGMENT_SIZE * 2];
        let (mut ciphertext, annotations) = encrypt(&data, &kek).await;
        // Drop the empty final segment.
        ciphertext.truncate(ciphertext.len() - TAG_LEN);
        let config = DecryptConfig { keys: vec![kek] };
        let (mut r, _) =
            decrypt_layer(Box::pin(io::Cursor::new(ciphertext)), &annotations, &config).unwrap();
        let mut plain = Vec::new();
        assert!(r.read_to_end(&mut plain).await.is_err());
    }

    #[tokio::test]
    async fn wrong_key_rejected() {
        let (ciphertext, annotations) = encrypt(b"secret", &Kek::generate().unwrap()).await;
        let config = DecryptConfig {
            keys: vec![Kek::generate().unwrap()],
        };
        assert!(decrypt_layer(Box::pin(io::Cursor::new(ciphertext)), &annotations, &config).is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kek = Kek::generate().unwrap();
        let path = dir.path().join("kek");
        std::fs::write(&path, kek.to_base64()).unwrap();
        assert_eq!(Kek::from_file(&path).unwrap().id(), kek.id());
    }
}
