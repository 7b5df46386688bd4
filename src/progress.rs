//! Copy progress: terminal progress bars and the typed event channel.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use imgcopy_oci::BlobInfo;

/// Digest characters shown in bar prefixes.
const SHORT_DIGEST_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Event channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A blob transfer started.
    NewArtifact,
    /// More bytes were read.
    Read,
    /// The transfer finished.
    Done,
    /// The blob was already present at the destination.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ProgressProperties {
    pub event: ProgressEvent,
    pub artifact: BlobInfo,
    /// Total bytes read so far.
    pub offset: u64,
    /// Bytes read since the previous event.
    pub offset_update: u64,
}

/// Where progress events are delivered. Sending never blocks; events are
/// dropped while the receiver is full or gone.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: mpsc::Sender<ProgressProperties>,
    interval: Duration,
}

impl ProgressSink {
    pub fn new(sender: mpsc::Sender<ProgressProperties>, interval: Duration) -> Self {
        Self { sender, interval }
    }

    pub fn skipped(&self, artifact: &BlobInfo) {
        self.emit(ProgressEvent::Skipped, artifact, 0, 0);
    }

    fn emit(&self, event: ProgressEvent, artifact: &BlobInfo, offset: u64, offset_update: u64) {
        let _ = self.sender.try_send(ProgressProperties {
            event,
            artifact: artifact.clone(),
            offset,
            offset_update,
        });
    }
}

/// Reports the bytes flowing through it as [`ProgressEvent::Read`] events,
/// at most once per interval.
pub struct ProgressReader<R> {
    inner: R,
    sink: ProgressSink,
    artifact: BlobInfo,
    offset: u64,
    reported: u64,
    last_report: Instant,
    done: bool,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, sink: ProgressSink, artifact: BlobInfo) -> Self {
        sink.emit(ProgressEvent::NewArtifact, &artifact, 0, 0);
        Self {
            inner,
            sink,
            artifact,
            offset: 0,
            reported: 0,
            last_report: Instant::now(),
            done: false,
        }
    }

    fn report_done(&mut self) {
        if !self.done {
            self.done = true;
            self.sink.emit(
                ProgressEvent::Done,
                &self.artifact,
                self.offset,
                self.offset - self.reported,
            );
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = (buf.filled().len() - before) as u64;
        if n == 0 && buf.remaining() > 0 {
            this.report_done();
            return Poll::Ready(Ok(()));
        }
        this.offset += n;
        if this.last_report.elapsed() >= this.sink.interval {
            this.sink.emit(
                ProgressEvent::Read,
                &this.artifact,
                this.offset,
                this.offset - this.reported,
            );
            this.reported = this.offset;
            this.last_report = Instant::now();
        }
        Poll::Ready(Ok(()))
    }
}

impl<R> Drop for ProgressReader<R> {
    fn drop(&mut self) {
        self.report_done();
    }
}

// ---------------------------------------------------------------------------
// Progress bars
// ---------------------------------------------------------------------------

/// A set of per-blob bars drawn together. Hidden when progress output is off.
#[derive(Clone)]
pub struct ProgressBars {
    multi: Option<MultiProgress>,
}

impl ProgressBars {
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: enabled.then(|| MultiProgress::with_draw_target(ProgressDrawTarget::stderr())),
        }
    }

    pub fn hidden() -> Self {
        Self { multi: None }
    }

    /// A bar for one blob. `kind` is "blob" or "config"; `on_complete`
    /// replaces the byte counters once the bar is finished.
    pub fn bar(&self, info: &BlobInfo, kind: &str, on_complete: &str) -> BlobBar {
        let Some(multi) = &self.multi else {
            return BlobBar {
                bar: ProgressBar::hidden(),
                on_complete: String::new(),
                size: info.size,
            };
        };
        let encoded = info
            .digest
            .as_ref()
            .map(|d| d.encoded().to_string())
            .unwrap_or_default();
        let mut prefix = format!("Copying {} {}", kind, encoded);
        prefix.truncate("Copying blob ".len() + SHORT_DIGEST_LEN);

        let bar = match info.size {
            Some(size) if size > 0 => {
                let bar = multi.add(ProgressBar::new(size));
                if let Ok(style) = ProgressStyle::with_template(
                    "{prefix} {bar:40} {binary_bytes} / {binary_total_bytes} | {binary_bytes_per_sec}",
                ) {
                    bar.set_style(style);
                }
                bar
            }
            _ => {
                let bar = multi.add(ProgressBar::new_spinner());
                if let Ok(style) =
                    ProgressStyle::with_template("{spinner} {prefix} {binary_bytes_per_sec}")
                {
                    bar.set_style(style.tick_strings(&[".", "..", "...", "....", ""]));
                }
                bar
            }
        };
        bar.set_prefix(prefix.clone());
        BlobBar {
            bar,
            on_complete: format!("{} {}", prefix, on_complete),
            size: info.size,
        }
    }
}

pub struct BlobBar {
    bar: ProgressBar,
    on_complete: String,
    size: Option<u64>,
}

impl BlobBar {
    /// Count bytes read through `reader` on this bar.
    pub fn wrap<R: AsyncRead + Unpin>(&self, reader: R) -> indicatif::ProgressBarIter<R> {
        self.bar.wrap_async_read(reader)
    }

    /// The bar as it is drawn after a transfer completed, even if fewer
    /// bytes than expected were read.
    pub fn mark_complete(&self) {
        if let Some(size) = self.size {
            self.bar.set_position(size);
        }
        if let Ok(style) = ProgressStyle::with_template("{msg}") {
            self.bar.set_style(style);
        }
        self.bar.finish_with_message(self.on_complete.clone());
    }

    /// Remove an unfinished bar.
    pub fn abandon(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

impl Drop for BlobBar {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcopy_oci::Digest;
    use tokio::io::AsyncReadExt;

    fn artifact() -> BlobInfo {
        BlobInfo::new(Digest::from_bytes(b"x"), Some(4), "application/octet-stream")
    }

    #[tokio::test]
    async fn reader_reports_new_read_done() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = ProgressSink::new(tx, Duration::ZERO);
        let mut r = ProgressReader::new(&b"data"[..], sink, artifact());
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        drop(r);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.first().unwrap().event, ProgressEvent::NewArtifact);
        assert!(events.iter().any(|e| e.event == ProgressEvent::Read));
        let done: Vec<_> = events.iter().filter(|e| e.event == ProgressEvent::Done).collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].offset, 4);
    }

    #[tokio::test]
    async fn full_channel_never_blocks() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx, Duration::ZERO);
        let data = vec![0u8; 64 * 1024];
        let mut r = ProgressReader::new(&data[..], sink, artifact());
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), data.len());
    }

    #[test]
    fn hidden_bars_are_inert() {
        let bars = ProgressBars::hidden();
        let bar = bars.bar(&artifact(), "blob", "done");
        bar.mark_complete();
    }
}
