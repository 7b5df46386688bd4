//! The blob pipeline: one source stream in, one destination blob out, with
//! verification, decryption, compression changes and encryption in between.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;

use imgcopy_oci::{Algorithm, BlobInfo, Digest, DigestAlgorithm};

use crate::compression::decompressor;
use crate::digesting::{DigestingReader, Validation};
use crate::error::{Error, Result, ResultExt};
use crate::progress::{BlobBar, ProgressReader};
use crate::types::{
    BlobChunkAccessor, BlobReader, ImageSource, ImageSourceChunk, PutBlobOptions, ReusedBlob,
    UploadedBlob,
};

use super::compression::detect_compression_step;
use super::single::ImageCopier;

/// Chunks buffered between the pipeline and the DiffID computation.
const DIFF_ID_CHANNEL_CAPACITY: usize = 16;

/// Per-blob inputs of [`ImageCopier::copy_blob_from_stream`].
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct BlobCopyOptions {
    pub is_config: bool,
    pub empty_layer: bool,
    pub layer_index: Option<usize>,
    pub to_encrypt: bool,
    /// Also compute the uncompressed digest of the source stream.
    pub compute_diff_id: bool,
}

/// Result of copying one stream.
pub(super) struct StreamCopy {
    pub info: BlobInfo,
    /// Set iff a DiffID was asked for.
    pub diff_id: Option<Result<Digest>>,
}

impl ImageCopier<'_, '_> {
    /// Copy `src_reader`, the content of `src_info`, to the destination.
    /// The returned info describes the blob as written, with the compression
    /// and crypto edits the manifest needs.
    pub(super) async fn copy_blob_from_stream(
        &self,
        src_reader: BlobReader,
        src_info: &BlobInfo,
        bar: &BlobBar,
        options: BlobCopyOptions,
    ) -> Result<StreamCopy> {
        let expected = src_info
            .digest
            .as_ref()
            .ok_or_else(|| Error::Internal("copying a blob with unknown digest".into()))?;
        let (digesting, validation) = DigestingReader::new(src_reader, expected)
            .map_err(|e| e.context(format!("preparing to verify blob {}", expected)))?;
        let mut stream_info = src_info.clone();
        let reader: BlobReader = Box::pin(bar.wrap(digesting));

        let (reader, decryption) = self.decryption_step(reader, &mut stream_info, src_info)?;
        let (reader, detected) = detect_compression_step(reader, &stream_info, src_info).await?;

        // The DiffID is computed from the source as read, before any
        // compression change.
        let (reader, tee) = if options.compute_diff_id {
            let (tee, rx) = TeeReader::new(reader);
            (Box::pin(tee.clone()) as BlobReader, Some((tee, rx)))
        } else {
            (reader, None)
        };

        let can_modify_blob = !options.is_config && self.cannot_modify_manifest_reason.is_none();
        let (reader, compression) =
            self.compression_step(reader, &mut stream_info, can_modify_blob, src_info, &detected)?;

        if decryption.decrypting && options.to_encrypt {
            return Err(Error::Unsupported(
                "Unable to support both decryption and encryption in the same copy".into(),
            ));
        }
        let (mut reader, encryption) =
            self.encryption_step(reader, &mut stream_info, options.to_encrypt, src_info)?;

        if let Some(sink) = &self.c.progress {
            reader = Box::pin(ProgressReader::new(reader, sink.clone(), src_info.clone()));
        }
        let mut reader = ErrorAnnotationReader::new(reader);
        let put_options = PutBlobOptions {
            cache: self.c.cache.as_ref(),
            is_config: options.is_config,
            empty_layer: options.empty_layer,
            layer_index: options.layer_index,
        };

        let (uploaded, diff_id) = match tee {
            None => {
                let uploaded = self
                    .c
                    .dest
                    .put_blob(&mut reader, &stream_info, put_options)
                    .await
                    .map_err(|e| mismatch_or(e, expected, &validation))
                    .context("writing blob")?;
                (uploaded, None)
            }
            Some((tee, rx)) => {
                let upload = async {
                    let res = self
                        .c
                        .dest
                        .put_blob(&mut reader, &stream_info, put_options)
                        .await
                        .map_err(|e| mismatch_or(e, expected, &validation))
                        .context("writing blob");
                    // The destination may not have read everything; the
                    // DiffID needs the whole input.
                    let res = match res {
                        Ok(uploaded) => tee
                            .drain()
                            .await
                            .map_err(|e| mismatch_or(e.into(), expected, &validation))
                            .with_context(|| format!("reading input blob {}", src_info.digest_label()))
                            .map(|()| uploaded),
                        Err(e) => Err(e),
                    };
                    tee.close();
                    res
                };
                let (uploaded, diff_id) = tokio::join!(upload, compute_diff_id(rx, detected.algorithm));
                (uploaded?, Some(diff_id))
            }
        };

        let mut uploaded_info = updated_blob_info_from_upload(&stream_info, &uploaded);
        compression.update_compression_edits(&mut uploaded_info);
        decryption.update_crypto_operation(&mut uploaded_info.crypto_operation);
        let encrypting = encryption.encrypting;
        encryption.update_crypto_operation_and_annotations(
            &mut uploaded_info.crypto_operation,
            &mut uploaded_info.annotations,
        )?;

        if validation.failed() {
            return Err(Error::Internal(format!(
                "writing blob {}, digest verification failed but was ignored",
                src_info.digest_label()
            )));
        }
        if let Some(expected) = &stream_info.digest {
            if *expected != uploaded.digest {
                return Err(Error::Internal(format!(
                    "writing blob {}, blob with digest {} saved with digest {}",
                    src_info.digest_label(),
                    expected,
                    uploaded.digest
                )));
            }
        }
        if validation.succeeded() {
            compression.record_validated_digest_data(
                self.c.cache.as_ref(),
                &uploaded_info,
                src_info,
                encrypting,
                decryption.decrypting,
            )?;
        }

        Ok(StreamCopy {
            info: uploaded_info,
            diff_id,
        })
    }
}

/// `err`, or the digest mismatch that made the upload fail.
fn mismatch_or(err: Error, expected: &Digest, validation: &Validation) -> Error {
    match validation.actual() {
        Some(actual) if validation.failed() => Error::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        },
        _ => err,
    }
}

/// The info of a freshly written blob. Compression and crypto edits are
/// carried over from `input` and adjusted by the caller.
pub(super) fn updated_blob_info_from_upload(input: &BlobInfo, uploaded: &UploadedBlob) -> BlobInfo {
    BlobInfo {
        digest: Some(uploaded.digest.clone()),
        size: Some(uploaded.size),
        urls: Vec::new(),
        annotations: input.annotations.clone(),
        media_type: input.media_type.clone(),
        compression_operation: input.compression_operation,
        compression_algorithm: input.compression_algorithm,
        crypto_operation: input.crypto_operation,
    }
}

/// The info of a blob the destination already had.
pub(super) fn updated_blob_info_from_reuse(input: &BlobInfo, reused: &ReusedBlob) -> BlobInfo {
    let mut res = BlobInfo {
        digest: Some(reused.digest.clone()),
        size: reused.size,
        urls: Vec::new(),
        annotations: input.annotations.clone(),
        media_type: input.media_type.clone(),
        compression_operation: reused.compression_operation,
        compression_algorithm: reused.compression_algorithm,
        crypto_operation: input.crypto_operation,
    };
    // Transports that found exactly the requested blob may not know its
    // compression; the source does.
    if input.digest.as_ref() == Some(&reused.digest) {
        if res.compression_operation == imgcopy_oci::LayerCompression::PreserveOriginal {
            res.compression_operation = input.compression_operation;
        }
        if res.compression_algorithm.is_none() {
            res.compression_algorithm = input.compression_algorithm;
        }
    }
    res.annotations.extend(
        reused
            .compression_annotations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    res
}

// ---------------------------------------------------------------------------
// Reader adapters
// ---------------------------------------------------------------------------

/// Marks errors coming from the source side so they are not mistaken for
/// destination write failures.
struct ErrorAnnotationReader {
    inner: BlobReader,
}

impl ErrorAnnotationReader {
    fn new(inner: BlobReader) -> Self {
        Self { inner }
    }
}

impl AsyncRead for ErrorAnnotationReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match ready!(self.inner.as_mut().poll_read(cx, buf)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(io::Error::new(
                e.kind(),
                format!("happened during read: {}", e),
            ))),
        }
    }
}

struct TeeState {
    inner: BlobReader,
    sender: Option<PollSender<Bytes>>,
}

/// Copies everything read from `inner` into a channel. A closed receiver
/// only stops the copying; reads continue.
#[derive(Clone)]
struct TeeReader {
    state: Arc<Mutex<TeeState>>,
}

impl TeeReader {
    fn new(inner: BlobReader) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(DIFF_ID_CHANNEL_CAPACITY);
        let tee = Self {
            state: Arc::new(Mutex::new(TeeState {
                inner,
                sender: Some(PollSender::new(tx)),
            })),
        };
        (tee, rx)
    }

    /// Read whatever the consumer left unread.
    async fn drain(&self) -> io::Result<()> {
        let mut this = self.clone();
        tokio::io::copy(&mut this, &mut tokio::io::sink()).await?;
        Ok(())
    }

    /// Signal the end of input to the receiver.
    fn close(&self) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).sender = None;
    }
}

impl AsyncRead for TeeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let state = &mut *guard;
        if let Some(sender) = state.sender.as_mut() {
            if ready!(sender.poll_reserve(cx)).is_err() {
                state.sender = None;
            }
        }
        let before = buf.filled().len();
        ready!(state.inner.as_mut().poll_read(cx, buf))?;
        let new = &buf.filled()[before..];
        if let Some(sender) = state.sender.as_mut() {
            if !new.is_empty() {
                if sender.send_item(Bytes::copy_from_slice(new)).is_err() {
                    state.sender = None;
                }
            } else if buf.remaining() > 0 {
                // EOF
                state.sender = None;
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// The canonical digest of the uncompressed content arriving on `rx`.
async fn compute_diff_id(rx: mpsc::Receiver<Bytes>, compression: Option<Algorithm>) -> Result<Digest> {
    let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
    });
    let mut reader: BlobReader = Box::pin(StreamReader::new(chunks));
    if let Some(algorithm) = compression {
        reader = decompressor(algorithm, reader);
    }
    let mut digester = DigestAlgorithm::CANONICAL.digester();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
    }
    Ok(digester.finish())
}

/// Ranged reads from the source, counted on the blob's progress bar.
pub(super) struct ProgressChunkAccessor<'p> {
    pub source: &'p dyn ImageSource,
    pub bar: &'p BlobBar,
}

#[async_trait]
impl BlobChunkAccessor for ProgressChunkAccessor<'_> {
    async fn get_blob_at(
        &self,
        info: &BlobInfo,
        chunks: &[ImageSourceChunk],
    ) -> Result<Vec<BlobReader>> {
        let readers = self.source.get_blob_at(info, chunks).await?;
        Ok(readers
            .into_iter()
            .map(|r| Box::pin(self.bar.wrap(r)) as BlobReader)
            .collect())
    }
}
