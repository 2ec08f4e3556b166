use crate::core::events::ProgressEvent;
use crate::core::hub::HubHandle;
use crate::core::model::{DownloadJob, EventKind, JobId};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Per-job byte counter that reports to the hub.
///
/// `update` events are throttled to one per `interval`. The write that reaches
/// `expected` is treated as the final one and never emits an `update`; the
/// terminal event comes from [`complete`](Self::complete) or
/// [`fail`](Self::fail), and only the first of those is published.
pub struct ProgressTracker {
    job_id: JobId,
    title: String,
    expected: u64,
    downloaded: u64,
    interval: Duration,
    next_emit: Instant,
    finished: bool,
    hub: HubHandle,
}

impl ProgressTracker {
    pub fn new(job: &DownloadJob, hub: HubHandle, interval: Duration) -> Self {
        Self {
            job_id: job.id,
            title: job.display_title.clone(),
            expected: job.expected_size,
            downloaded: 0,
            interval,
            next_emit: Instant::now(),
            finished: false,
            hub,
        }
    }

    pub fn set_expected(&mut self, expected: u64) {
        self.expected = expected;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn percent(&self) -> Option<f64> {
        if self.expected == 0 {
            return None;
        }
        Some(self.downloaded as f64 * 100.0 / self.expected as f64)
    }

    pub fn record(&mut self, n: usize) {
        self.downloaded += n as u64;
        if self.finished || n == 0 {
            return;
        }
        if self.expected > 0 && self.downloaded >= self.expected {
            return;
        }

        let now = Instant::now();
        if now < self.next_emit {
            return;
        }
        self.next_emit = now + self.interval;

        debug!(
            job = %self.job_id,
            "downloading {}: {} / {}{}",
            self.title,
            fmt_bytes(self.downloaded),
            fmt_bytes(self.expected),
            self.percent().map(|p| format!(" ({:.1}%)", p)).unwrap_or_default()
        );
        self.hub.publish(self.event(EventKind::Update));
    }

    pub fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.hub.publish(self.event(EventKind::Complete));
    }

    pub fn fail(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.hub.publish(self.event(EventKind::Failed).with_message(message));
    }

    fn event(&self, kind: EventKind) -> ProgressEvent {
        ProgressEvent::for_job(kind, self.job_id, &self.title, self.downloaded, self.expected)
    }
}

/// Counts every byte accepted by the wrapped writer.
pub struct ProgressWriter<'a, W> {
    inner: W,
    tracker: &'a mut ProgressTracker,
}

impl<'a, W> ProgressWriter<'a, W> {
    pub fn new(inner: W, tracker: &'a mut ProgressTracker) -> Self {
        Self { inner, tracker }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<'_, W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            this.tracker.record(*n);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
