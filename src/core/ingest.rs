//! Long-lived consumer of the durable webhook queue.

use crate::core::webhook::{HandleOutcome, WebhookHandler};
use crate::plugins::registry::{QueuedMessage, WebhookQueue};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// How long to wait after the n-th consecutive poll failure.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub short: Duration,
    pub long: Duration,
    /// Failures up to and including this count use `short`.
    pub short_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { short: Duration::from_secs(120), long: Duration::from_secs(1800), short_attempts: 4 }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures <= self.short_attempts {
            self.short
        } else {
            self.long
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch: usize,
    pub visibility: Duration,
    pub idle: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch: 5,
            visibility: Duration::from_secs(30),
            idle: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct WebhookIngestor {
    queue: Arc<dyn WebhookQueue>,
    handler: WebhookHandler,
    config: IngestConfig,
}

impl WebhookIngestor {
    pub fn new(queue: Arc<dyn WebhookQueue>, handler: WebhookHandler, config: IngestConfig) -> Self {
        Self { queue, handler, config }
    }

    /// Polls forever. Poll failures back off, never stop the loop.
    pub async fn run(self) {
        info!(batch = self.config.batch, "webhook ingestion started");
        let mut failures: u32 = 0;
        loop {
            match self.run_once().await {
                Ok(0) => {
                    failures = 0;
                    sleep(self.config.idle).await;
                }
                Ok(n) => {
                    failures = 0;
                    debug!(messages = n, "handled webhook batch");
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.backoff.delay_for(failures);
                    warn!(failures, "failed to poll webhook queue, pausing for {:?}: {:#}", delay, e);
                    sleep(delay).await;
                }
            }
        }
    }

    /// One poll plus handling of everything it returned.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let messages = self.queue.poll(self.config.batch, self.config.visibility).await?;
        for msg in &messages {
            self.process(msg).await;
        }
        Ok(messages.len())
    }

    async fn process(&self, msg: &QueuedMessage) {
        let id = msg.handle.message_id;
        match self.handler.handle(&msg.body).await {
            Ok(HandleOutcome::NotSubscribed) => debug!(message = id, "webhook ignored"),
            Ok(HandleOutcome::Enqueued(jobs)) => debug!(message = id, jobs = jobs.len(), "webhook queued jobs"),
            Err(e) => warn!(message = id, attempts = msg.dequeue_count, "failed to handle webhook: {}\n{}", e, msg.body),
        }
        // deleted whatever happened, a poison message must not come back
        if let Err(e) = self.queue.delete(&msg.handle).await {
            warn!(message = id, "failed to delete webhook message: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hub::Hub;
    use crate::core::model::Category;
    use crate::core::orchestrator::Orchestrator;
    use crate::core::queue::{DownloadQueue, JobReceiver};
    use crate::core::testing::{media_item, FakeCatalog, MemoryStore, ScriptedQueue};
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    const MOVIE: &str = r#"{"movie":{"title":"Heat","imdbId":"tt0113277"}}"#;

    fn handler(store: MemoryStore, catalog: FakeCatalog) -> (WebhookHandler, JobReceiver) {
        let hub = Hub::spawn(64, Duration::from_secs(3600));
        let (queue, rx) = DownloadQueue::new();
        let orch = Orchestrator::new(queue, hub, Arc::new(catalog), PathBuf::from("/data/local"));
        (WebhookHandler::new(Arc::new(store), orch), rx)
    }

    async fn wait_for_polls(rx: &mut mpsc::UnboundedReceiver<usize>, n: usize) {
        while let Some(count) = rx.recv().await {
            if count >= n {
                return;
            }
        }
    }

    fn gaps(queue: &ScriptedQueue) -> Vec<Duration> {
        let polls = queue.polls.lock().unwrap();
        polls.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn backoff_escalates_after_four_failures() {
        let p = BackoffPolicy::default();
        let delays: Vec<_> = (1..=6).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![120, 120, 120, 120, 1800, 1800]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_poll_failures_follow_backoff() {
        let (queue, mut polls) = ScriptedQueue::new(vec![], true);
        let queue = Arc::new(queue);
        let (h, _jobs) = handler(MemoryStore::default(), FakeCatalog::default());
        let ingestor = WebhookIngestor::new(queue.clone(), h, IngestConfig::default());
        let task = tokio::spawn(ingestor.run());

        wait_for_polls(&mut polls, 6).await;
        task.abort();

        let short = Duration::from_secs(120);
        let long = Duration::from_secs(1800);
        assert_eq!(gaps(&queue), vec![short, short, short, short, long]);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_resets_failures() {
        let script = vec![Err("down".to_string()), Err("down".to_string()), Ok(vec![]), Err("down".to_string())];
        let (queue, mut polls) = ScriptedQueue::new(script, false);
        let queue = Arc::new(queue);
        let (h, _jobs) = handler(MemoryStore::default(), FakeCatalog::default());
        let ingestor = WebhookIngestor::new(queue.clone(), h, IngestConfig::default());
        let task = tokio::spawn(ingestor.run());

        wait_for_polls(&mut polls, 5).await;
        task.abort();

        let (short, idle) = (Duration::from_secs(120), Duration::from_secs(5));
        assert_eq!(gaps(&queue), vec![short, short, idle, short]);
    }

    #[tokio::test]
    async fn every_message_is_deleted_whatever_the_outcome() {
        let store = MemoryStore::default().with(Category::Movie, "tt0113277", "5");
        let catalog = FakeCatalog::default().with("5", vec![media_item("5", "Heat", &[("/p/5", "/m/heat.mkv", 1)])]);
        let bodies = vec![
            "garbage".to_string(),
            MOVIE.to_string(),
            r#"{"movie":{"title":"Other","imdbId":"tt1"}}"#.to_string(),
        ];
        let (queue, _polls) = ScriptedQueue::new(vec![Ok(bodies)], false);
        let queue = Arc::new(queue);
        let (h, _jobs) = handler(store, catalog);
        let ingestor = WebhookIngestor::new(queue.clone(), h, IngestConfig::default());

        assert_eq!(ingestor.run_once().await.unwrap(), 3);
        assert_eq!(queue.deleted_ids(), vec![1, 2, 3]);
        assert_eq!(ingestor.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn poll_error_surfaces_from_run_once() {
        let (queue, _polls) = ScriptedQueue::new(vec![Err("unreachable".to_string())], false);
        let (h, _jobs) = handler(MemoryStore::default(), FakeCatalog::default());
        let ingestor = WebhookIngestor::new(Arc::new(queue), h, IngestConfig::default());
        assert!(ingestor.run_once().await.is_err());
    }
}
