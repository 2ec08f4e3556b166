use crate::core::hub::HubHandle;
use crate::core::model::DownloadJob;
use crate::core::progress::{fmt_bytes, ProgressTracker, ProgressWriter};
use crate::core::queue::WorkerInbox;
use crate::plugins::registry::{MediaCatalog, PartSource};
use anyhow::Context;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("source error: {0:#}")]
    Source(anyhow::Error),

    #[error("could not resolve a remote part for media {0}")]
    Unresolvable(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared pieces every worker in the pool needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub source: Arc<dyn PartSource>,
    pub catalog: Arc<dyn MediaCatalog>,
    pub hub: HubHandle,
    pub progress_interval: Duration,
    /// Longest wait for the next chunk before the transfer is abandoned.
    pub stall_timeout: Duration,
}

pub struct DownloadWorker {
    id: usize,
    ctx: WorkerContext,
    inbox: WorkerInbox,
}

impl DownloadWorker {
    pub fn new(id: usize, ctx: WorkerContext, inbox: WorkerInbox) -> Self {
        Self { id, ctx, inbox }
    }

    pub fn spawn_pool(ctx: WorkerContext, inboxes: Vec<WorkerInbox>) -> Vec<tokio::task::JoinHandle<()>> {
        inboxes
            .into_iter()
            .enumerate()
            .map(|(id, inbox)| tokio::spawn(DownloadWorker::new(id, ctx.clone(), inbox).run()))
            .collect()
    }

    /// Drains the queue until every producer is gone. A failed job never stops the loop.
    pub async fn run(mut self) {
        info!(worker = self.id, "download worker started");
        while let Some(job) = self.inbox.next().await {
            self.process(job).await;
        }
        info!(worker = self.id, "download worker stopped");
    }

    async fn process(&self, job: DownloadJob) {
        let started = Instant::now();
        info!(
            worker = self.id,
            job = %job.id,
            media = %job.media_id,
            "downloading {} to {}",
            job.display_title,
            job.destination_path.display()
        );

        let mut tracker = ProgressTracker::new(&job, self.ctx.hub.clone(), self.ctx.progress_interval);
        match self.transfer(&job, &mut tracker).await {
            Ok(()) => {
                tracker.complete();
                info!(
                    worker = self.id,
                    job = %job.id,
                    "downloaded {} ({} in {:.1}s)",
                    job.display_title,
                    fmt_bytes(tracker.downloaded()),
                    started.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                error!(worker = self.id, job = %job.id, "failed to download {}: {}", job.display_title, e);
                let tmp = job.temp_path();
                if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!(path = %tmp.display(), "could not remove temp file: {}", rm);
                    }
                }
                tracker.fail(&e.to_string());
            }
        }
    }

    async fn transfer(&self, job: &DownloadJob, tracker: &mut ProgressTracker) -> Result<(), TransferError> {
        let source_path = match &job.source_path {
            Some(p) => p.clone(),
            None => {
                let (key, size) = self.resolve(job).await?;
                if tracker.expected() == 0 {
                    tracker.set_expected(size);
                }
                key
            }
        };
        let expected = tracker.expected();

        if let Some(parent) = job.destination_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = job.temp_path();
        debug!(job = %job.id, path = %tmp.display(), "creating temp file");
        let file = File::create(&tmp).await?;

        let mut stream = self.ctx.source.open(&source_path).await.map_err(TransferError::Source)?;

        let stall = self.ctx.stall_timeout;
        let mut writer = ProgressWriter::new(file, tracker);
        loop {
            let chunk = match timeout(stall, stream.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => {
                    let msg = format!("stalled: no data within {:?}", stall);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, msg).into());
                }
            };
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        let actual = tracker.downloaded();
        if expected > 0 && actual != expected {
            return Err(TransferError::SizeMismatch { expected, actual });
        }

        // rename replaces an existing file in one step
        debug!(job = %job.id, "renaming to final path {}", job.destination_path.display());
        tokio::fs::rename(&tmp, &job.destination_path).await?;
        Ok(())
    }

    async fn resolve(&self, job: &DownloadJob) -> Result<(String, u64), TransferError> {
        let items = self
            .ctx
            .catalog
            .get_metadata_with_parts(&job.media_id)
            .await
            .with_context(|| format!("resolve media {}", job.media_id))
            .map_err(TransferError::Source)?;
        let first = items.iter().flat_map(|m| m.parts()).next().map(|p| (p.key.clone(), p.size));
        first.ok_or_else(|| TransferError::Unresolvable(job.media_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::ProgressEvent;
    use crate::core::hub::{Hub, Subscription};
    use crate::core::model::{EventKind, JobId};
    use crate::core::queue::DownloadQueue;
    use crate::core::testing::{media_item, FakeCatalog, MemorySource, Script};
    use std::path::Path;

    struct Rig {
        hub: HubHandle,
        sub: Subscription,
        queue: DownloadQueue,
    }

    fn rig(source: MemorySource, catalog: FakeCatalog) -> Rig {
        rig_with(source, catalog, 1, Duration::from_secs(5))
    }

    fn rig_with(source: MemorySource, catalog: FakeCatalog, workers: usize, stall_timeout: Duration) -> Rig {
        let hub = Hub::spawn(1024, Duration::from_secs(3600));
        let sub = hub.subscribe();
        let (queue, rx) = DownloadQueue::new();
        let ctx = WorkerContext {
            source: Arc::new(source),
            catalog: Arc::new(catalog),
            hub: hub.clone(),
            progress_interval: Duration::from_millis(0),
            stall_timeout,
        };
        DownloadWorker::spawn_pool(ctx, rx.into_pool(workers));
        Rig { hub, sub, queue }
    }

    impl Rig {
        fn submit(&self, job: DownloadJob) -> JobId {
            let id = job.id;
            self.hub.publish(ProgressEvent::start(&job));
            self.queue.enqueue(job).unwrap();
            id
        }

        async fn events_until_terminal(&mut self, job: JobId) -> Vec<ProgressEvent> {
            let mut out = vec![];
            while let Some(e) = self.sub.recv().await {
                if e.job_id != Some(job) {
                    continue;
                }
                let done = e.kind.is_terminal();
                out.push(e);
                if done {
                    break;
                }
            }
            out
        }
    }

    fn job_at(dir: &Path, name: &str, part: Option<&str>, size: u64) -> DownloadJob {
        DownloadJob::new("m1", name, part.map(String::from), dir.join("sub").join(name), size)
    }

    fn assert_lifecycle(events: &[ProgressEvent], terminal: EventKind) {
        assert_eq!(events.first().map(|e| e.kind), Some(EventKind::Start));
        assert_eq!(events.last().map(|e| e.kind), Some(terminal));
        let middle = &events[1..events.len() - 1];
        assert!(middle.iter().all(|e| e.kind == EventKind::Update));
        assert!(middle.windows(2).all(|w| w[0].bytes_downloaded <= w[1].bytes_downloaded));
    }

    #[tokio::test]
    async fn completed_transfer_lands_at_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::default().with("/p/1", Script::Chunks(vec![vec![1; 600], vec![2; 400]]));
        let mut rig = rig(source, FakeCatalog::default());

        let job = job_at(dir.path(), "a.mkv", Some("/p/1"), 1000);
        let dest = job.destination_path.clone();
        let tmp = job.temp_path();
        let id = rig.submit(job);

        let events = rig.events_until_terminal(id).await;
        assert_lifecycle(&events, EventKind::Complete);
        assert_eq!(events.last().unwrap().bytes_downloaded, 1000);
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::Complete).count(), 1);

        assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 1000);
        assert!(tokio::fs::metadata(&tmp).await.is_err());
    }

    #[tokio::test]
    async fn mid_stream_failure_leaves_nothing_and_worker_continues() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::default()
            .with("/p/bad", Script::FailAfter(vec![vec![0; 100]]))
            .with("/p/good", Script::Chunks(vec![vec![0; 50]]));
        let mut rig = rig(source, FakeCatalog::default());

        let bad = job_at(dir.path(), "bad.mkv", Some("/p/bad"), 500);
        let bad_dest = bad.destination_path.clone();
        let bad_tmp = bad.temp_path();
        let good = job_at(dir.path(), "good.mkv", Some("/p/good"), 50);
        let good_dest = good.destination_path.clone();

        let bad_id = rig.submit(bad);
        let good_id = rig.submit(good);

        let events = rig.events_until_terminal(bad_id).await;
        assert_lifecycle(&events, EventKind::Failed);
        assert!(events.last().unwrap().message.is_some());
        assert!(tokio::fs::metadata(&bad_dest).await.is_err());
        assert!(tokio::fs::metadata(&bad_tmp).await.is_err());

        let events = rig.events_until_terminal(good_id).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
        assert_eq!(tokio::fs::read(&good_dest).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn short_body_is_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::default().with("/p/1", Script::Chunks(vec![vec![0; 10]]));
        let mut rig = rig(source, FakeCatalog::default());

        let job = job_at(dir.path(), "short.mkv", Some("/p/1"), 20);
        let dest = job.destination_path.clone();
        let id = rig.submit(job);

        let events = rig.events_until_terminal(id).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Failed);
        assert!(last.message.as_deref().unwrap().contains("size mismatch"));
        assert!(tokio::fs::metadata(&dest).await.is_err());
    }

    #[tokio::test]
    async fn unresolved_job_is_resolved_through_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::default().with("m1", vec![media_item("m1", "Heat", &[("/p/heat", "/movies/heat.mkv", 30)])]);
        let source = MemorySource::default().with("/p/heat", Script::Chunks(vec![vec![0; 30]]));
        let mut rig = rig(source, catalog);

        let id = rig.submit(job_at(dir.path(), "heat.mkv", None, 0));
        let events = rig.events_until_terminal(id).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Complete);
        assert_eq!(last.total_bytes, 30);
    }

    #[tokio::test]
    async fn concurrent_duplicate_jobs_both_land_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let slow = Script::Slow(vec![vec![3; 100]; 10], Duration::from_millis(20));
        let source = MemorySource::default().with("/p/1", slow);
        let mut rig = rig_with(source, FakeCatalog::default(), 2, Duration::from_secs(5));

        let a = job_at(dir.path(), "dup.mkv", Some("/p/1"), 1000);
        let b = job_at(dir.path(), "dup.mkv", Some("/p/1"), 1000);
        assert_ne!(a.temp_path(), b.temp_path());
        let dest = a.destination_path.clone();
        let first = rig.submit(a);
        let second = rig.submit(b);
        assert_ne!(first, second);

        assert_eq!(rig.events_until_terminal(first).await.last().unwrap().kind, EventKind::Complete);
        assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 1000);
        assert_eq!(rig.events_until_terminal(second).await.last().unwrap().kind, EventKind::Complete);
        assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 1000);

        let mut entries = tokio::fs::read_dir(dest.parent().unwrap()).await.unwrap();
        let mut names = vec![];
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("dup.mkv")]);
    }

    #[tokio::test]
    async fn stalled_stream_fails_and_frees_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::default()
            .with("/p/stuck", Script::Stall(vec![vec![0; 10]]))
            .with("/p/next", Script::Chunks(vec![vec![0; 20]]));
        let mut rig = rig_with(source, FakeCatalog::default(), 1, Duration::from_millis(100));

        let stuck = job_at(dir.path(), "stuck.mkv", Some("/p/stuck"), 100);
        let stuck_tmp = stuck.temp_path();
        let next = job_at(dir.path(), "next.mkv", Some("/p/next"), 20);
        let next_dest = next.destination_path.clone();
        let stuck_id = rig.submit(stuck);
        let next_id = rig.submit(next);

        let events = rig.events_until_terminal(stuck_id).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Failed);
        assert!(last.message.as_deref().unwrap().contains("stalled"));
        assert!(tokio::fs::metadata(&stuck_tmp).await.is_err());

        let events = rig.events_until_terminal(next_id).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
        assert_eq!(tokio::fs::metadata(&next_dest).await.unwrap().len(), 20);
    }
}
