//! Encryption stages of the blob pipeline.

use std::collections::BTreeMap;

use imgcopy_oci::{BlobInfo, CryptoOperation};

use crate::encryption::{
    decrypt_layer, encrypt_layer, is_encrypted_media_type, EncryptionFinalizer, ANNOTATION_PREFIX,
};
use crate::error::{Error, Result};
use crate::types::BlobReader;

use super::single::ImageCopier;

pub(super) struct DecryptionStep {
    pub decrypting: bool,
}

impl DecryptionStep {
    pub fn update_crypto_operation(&self, operation: &mut CryptoOperation) {
        if self.decrypting {
            *operation = CryptoOperation::Decrypt;
        }
    }
}

pub(super) struct EncryptionStep {
    pub encrypting: bool,
    finalizer: Option<EncryptionFinalizer>,
}

impl EncryptionStep {
    /// Once the encrypted stream was consumed, mark the blob as encrypted and
    /// add the annotations needed to decrypt it.
    pub fn update_crypto_operation_and_annotations(
        self,
        operation: &mut CryptoOperation,
        annotations: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(finalizer) = self.finalizer.filter(|_| self.encrypting) else {
            return Ok(());
        };
        let added = finalizer
            .finalize()
            .map_err(|e| Error::Encryption(format!("Unable to finalize encryption: {}", e)))?;
        *operation = CryptoOperation::Encrypt;
        annotations.extend(added);
        Ok(())
    }
}

impl ImageCopier<'_, '_> {
    /// Decrypt the stream if it is encrypted and we have keys for it. The
    /// stream keeps its encrypted MIME type; the manifest edit drops it.
    pub(super) fn decryption_step(
        &self,
        reader: BlobReader,
        stream_info: &mut BlobInfo,
        src_info: &BlobInfo,
    ) -> Result<(BlobReader, DecryptionStep)> {
        let Some(config) = self.c.options.decrypt_config.as_ref() else {
            return Ok((reader, DecryptionStep { decrypting: false }));
        };
        if !is_encrypted_media_type(&stream_info.media_type) {
            return Ok((reader, DecryptionStep { decrypting: false }));
        }
        if let Some(reason) = self.cannot_modify_manifest_reason {
            return Err(Error::Manifest(format!(
                "layer {} should be decrypted, but we can’t modify the manifest: {}",
                src_info.digest_label(),
                reason
            )));
        }
        let (reader, plaintext_digest) = decrypt_layer(reader, &stream_info.annotations, config)
            .map_err(|e| e.context(format!("decrypting layer {}", src_info.digest_label())))?;
        stream_info.digest = Some(plaintext_digest);
        stream_info.size = None;
        stream_info
            .annotations
            .retain(|k, _| !k.starts_with(ANNOTATION_PREFIX));
        Ok((reader, DecryptionStep { decrypting: true }))
    }

    /// Encrypt the stream if this layer was selected for encryption.
    pub(super) fn encryption_step(
        &self,
        reader: BlobReader,
        stream_info: &mut BlobInfo,
        to_encrypt: bool,
        src_info: &BlobInfo,
    ) -> Result<(BlobReader, EncryptionStep)> {
        let skip = EncryptionStep {
            encrypting: false,
            finalizer: None,
        };
        let Some(config) = self.c.options.encrypt_config.as_ref() else {
            return Ok((reader, skip));
        };
        if !to_encrypt || is_encrypted_media_type(&src_info.media_type) {
            return Ok((reader, skip));
        }
        if let Some(reason) = self.cannot_modify_manifest_reason {
            return Err(Error::Manifest(format!(
                "layer {} should be encrypted, but we can’t modify the manifest: {}",
                src_info.digest_label(),
                reason
            )));
        }
        let (reader, finalizer) = encrypt_layer(reader, config)
            .map_err(|e| e.context(format!("encrypting blob {}", src_info.digest_label())))?;
        stream_info.digest = None;
        stream_info.size = None;
        Ok((
            reader,
            EncryptionStep {
                encrypting: true,
                finalizer: Some(finalizer),
            },
        ))
    }
}

/// Which of `count` layers `indexes` selects. Negative values count from
/// the end; an empty list selects every layer.
pub(super) fn layers_to_encrypt(indexes: &[i64], count: usize) -> Result<Vec<bool>> {
    let mut selected = vec![indexes.is_empty(); count];
    let n = count as i64;
    for &l in indexes {
        let position = if (0..n).contains(&l) {
            l
        } else if l < 0 && l + n >= 0 {
            l + n
        } else {
            return Err(Error::Config(format!(
                "when choosing layers to encrypt, layer index {} out of range ({} layers exist)",
                l, count
            )));
        };
        selected[position as usize] = true;
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indexes_count_from_the_end() {
        assert_eq!(layers_to_encrypt(&[-1], 3).unwrap(), vec![false, false, true]);
        assert_eq!(layers_to_encrypt(&[0, -3], 3).unwrap(), vec![true, false, false]);
    }

    #[test]
    fn empty_selection_means_all() {
        assert_eq!(layers_to_encrypt(&[], 2).unwrap(), vec![true, true]);
    }

    #[test]
    fn out_of_range() {
        let err = layers_to_encrypt(&[0, 3], 3).unwrap_err();
        assert!(err
            .to_string()
            .contains("layer index 3 out of range (3 layers exist)"));
        assert!(layers_to_encrypt(&[-4], 3).is_err());
    }
}
