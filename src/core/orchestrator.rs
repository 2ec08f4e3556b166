use crate::core::events::ProgressEvent;
use crate::core::hub::{HubHandle, Subscription};
use crate::core::model::{DownloadJob, EventKind, JobId};
use crate::core::queue::{DownloadQueue, QueueClosed};
use crate::core::media::Metadata;
use crate::plugins::registry::MediaCatalog;
use anyhow::Context;
use sanitize_filename::sanitize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Entry point for the API and the webhook loop: builds jobs, announces them,
/// and hands them to the queue.
#[derive(Clone)]
pub struct Orchestrator {
    queue: DownloadQueue,
    hub: HubHandle,
    catalog: Arc<dyn MediaCatalog>,
    dest_root: PathBuf,
}

impl Orchestrator {
    pub fn new(queue: DownloadQueue, hub: HubHandle, catalog: Arc<dyn MediaCatalog>, dest_root: PathBuf) -> Self {
        Self { queue, hub, catalog, dest_root }
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn catalog(&self) -> &Arc<dyn MediaCatalog> {
        &self.catalog
    }

    /// Publishes `start` and queues the job. Identical jobs are not coalesced.
    pub fn enqueue(&self, job: DownloadJob) -> Result<JobId, QueueClosed> {
        let id = job.id;
        self.hub.publish(ProgressEvent::start(&job));
        match self.queue.enqueue(job) {
            Ok(()) => {
                info!(job = %id, "job queued");
                Ok(id)
            }
            Err(QueueClosed(job)) => {
                // keep the per-job lifecycle closed even when nothing will run it
                self.hub.publish(
                    ProgressEvent::for_job(EventKind::Failed, id, &job.display_title, 0, job.expected_size)
                        .with_message("download queue is closed"),
                );
                Err(QueueClosed(job))
            }
        }
    }

    /// Resolves every part under `media_key` and queues one job per part.
    pub async fn enqueue_media(&self, media_key: &str) -> anyhow::Result<Vec<JobId>> {
        let items = self
            .catalog
            .get_metadata_with_parts(media_key)
            .await
            .with_context(|| format!("get metadata with parts for {}", media_key))?;

        let ids = self.enqueue_items(&items)?;
        info!(media = media_key, jobs = ids.len(), "queued media");
        Ok(ids)
    }

    /// Queues one job per resolvable part of each item, in catalog order.
    pub fn enqueue_items(&self, items: &[Metadata]) -> Result<Vec<JobId>, QueueClosed> {
        let mut ids = Vec::new();
        for item in items {
            for job in self.jobs_for(item) {
                ids.push(self.enqueue(job)?);
            }
        }
        Ok(ids)
    }

    pub fn jobs_for(&self, item: &Metadata) -> Vec<DownloadJob> {
        let parts: Vec<_> = item.parts().collect();
        let title = item.display_title();
        let count = parts.len();

        parts
            .into_iter()
            .enumerate()
            .filter_map(|(i, part)| {
                let Some(dest) = local_path(&self.dest_root, &part.file) else {
                    warn!(media = %item.rating_key, file = %part.file, "skipping part without a usable file path");
                    return None;
                };
                let display = if count > 1 { format!("{} (part {}/{})", title, i + 1, count) } else { title.clone() };
                Some(DownloadJob::new(item.rating_key.clone(), display, Some(part.key.clone()), dest, part.size))
            })
            .collect()
    }
}

/// Maps a server-side file path under `root`, dropping anything that could escape it.
pub fn local_path(root: &Path, remote_file: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    let mut pushed = false;
    for seg in remote_file.split(['/', '\\']) {
        if seg.is_empty() || seg == "." || seg == ".." || seg.ends_with(':') {
            continue;
        }
        let clean = sanitize(seg);
        if clean.is_empty() {
            continue;
        }
        out.push(clean);
        pushed = true;
    }
    pushed.then_some(out)
}
