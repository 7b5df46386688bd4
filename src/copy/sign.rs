use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::warn;

use imgcopy_oci::ImageRef;

use crate::error::{Error, Result};
use crate::signature::{Ed25519Signer, Signature, Signer};

use super::{Copier, Options};

/// Signers for one copy call. The second list holds the ones created here,
/// which must be closed when the call returns.
pub(super) fn setup_signers(options: &Options) -> Result<(Vec<Arc<dyn Signer>>, Vec<Arc<dyn Signer>>)> {
    let mut signers = options.signers.clone();
    let mut to_close: Vec<Arc<dyn Signer>> = Vec::new();
    if let Some(path) = &options.sign_by_key_path {
        let passphrase = options.sign_passphrase.as_ref().map(|p| p.expose_secret());
        let signer: Arc<dyn Signer> = Arc::new(
            Ed25519Signer::from_file(path, passphrase)
                .map_err(|e| e.context(format!("loading signing key {}", path.display())))?,
        );
        signers.push(signer.clone());
        to_close.push(signer);
    }
    Ok((signers, to_close))
}

pub(super) async fn close_signers(signers: &[Arc<dyn Signer>]) {
    for (i, s) in signers.iter().enumerate() {
        if let Err(e) = s.close().await {
            warn!("Error closing per-copy signer {}: {}", i + 1, e);
        }
    }
}

impl Copier<'_> {
    /// Signatures over `manifest` from every configured signer.
    pub(super) async fn create_signatures(
        &self,
        manifest: &[u8],
        identity: Option<&ImageRef>,
    ) -> Result<Vec<Signature>> {
        if self.signers.is_empty() {
            return Ok(Vec::new());
        }
        self.dest
            .supports_signatures()
            .map_err(|e| e.context("Can not sign image"))?;

        let identity = match identity {
            Some(i) => i.clone(),
            None => self.dest_ref.docker_reference().ok_or_else(|| {
                Error::Signature(format!(
                    "Cannot determine canonical Docker reference for destination {}",
                    self.dest_ref
                ))
            })?,
        };

        let mut res = Vec::with_capacity(self.signers.len());
        for (i, signer) in self.signers.iter().enumerate() {
            let msg = signer.progress_message();
            if self.signers.len() == 1 {
                self.report(&msg);
            } else {
                self.report(format!("[signer {}/{}] {}", i + 1, self.signers.len(), msg));
            }
            let sig = signer
                .sign_image_manifest(manifest, &identity)
                .await
                .map_err(|e| {
                    let e = e.context("creating signature");
                    if self.signers.len() == 1 {
                        e
                    } else {
                        e.context(format!("signer {}", i + 1))
                    }
                })?;
            res.push(sig);
        }
        Ok(res)
    }
}
