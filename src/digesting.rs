//! A reader that verifies its content against an expected digest.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use imgcopy_oci::{Digest, Digester};

use crate::error::{Error, Result};

/// Outcome flags of a [`DigestingReader`]. Neither is set if the stream was
/// not read to the end.
#[derive(Debug, Default)]
pub struct Validation {
    succeeded: AtomicBool,
    failed: AtomicBool,
    actual: OnceLock<Digest>,
}

impl Validation {
    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The digest the content actually had, once it failed to match.
    pub fn actual(&self) -> Option<&Digest> {
        self.actual.get()
    }
}

pub struct DigestingReader<R> {
    inner: R,
    digester: Option<Digester>,
    expected: Digest,
    mismatch: Option<String>,
    validation: Arc<Validation>,
}

impl<R: AsyncRead + Unpin> DigestingReader<R> {
    /// Fails if `expected` uses an algorithm we cannot compute.
    pub fn new(inner: R, expected: &Digest) -> Result<(Self, Arc<Validation>)> {
        let algorithm = expected.algorithm().map_err(|e| {
            Error::Unsupported(format!("Invalid digest specification {}: {}", expected, e))
        })?;
        let validation = Arc::new(Validation::default());
        Ok((
            Self {
                inner,
                digester: Some(algorithm.digester()),
                expected: expected.clone(),
                mismatch: None,
                validation: validation.clone(),
            },
            validation,
        ))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(msg) = &this.mismatch {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, msg.clone())));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let new = &buf.filled()[before..];
        if !new.is_empty() {
            if let Some(d) = this.digester.as_mut() {
                d.update(new);
            }
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        // EOF
        if let Some(d) = this.digester.take() {
            let actual = d.finish();
            if actual != this.expected {
                let msg = format!(
                    "Digest did not match, expected {}, got {}",
                    this.expected, actual
                );
                let _ = this.validation.actual.set(actual);
                this.validation.failed.store(true, Ordering::Release);
                this.mismatch = Some(msg.clone());
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, msg)));
            }
            this.validation.succeeded.store(true, Ordering::Release);
        }
        Poll::Ready(Ok(()))
    }
}
