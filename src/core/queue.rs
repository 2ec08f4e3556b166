//! Unbounded job handoff between producers and the worker pool.
//!
//! Producers hold a cloneable [`DownloadQueue`]. A dispatcher task owns the
//! receiving end; each idle worker announces itself with a oneshot slot and
//! gets the next job in FIFO order. Jobs are never dropped for capacity
//! reasons, and nothing survives a restart.

use crate::core::model::DownloadJob;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
#[error("download queue is closed")]
pub struct QueueClosed(pub DownloadJob);

#[derive(Clone)]
pub struct DownloadQueue {
    tx: mpsc::UnboundedSender<DownloadJob>,
}

pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<DownloadJob>,
}

type Slot = oneshot::Sender<DownloadJob>;

/// A worker's end of the pool.
pub struct WorkerInbox {
    ready_tx: mpsc::Sender<Slot>,
}

impl DownloadQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobReceiver { rx })
    }

    pub fn enqueue(&self, job: DownloadJob) -> Result<(), QueueClosed> {
        self.tx.send(job).map_err(|e| QueueClosed(e.0))
    }
}

impl JobReceiver {
    /// Spawns the dispatcher and returns one inbox per worker.
    pub fn into_pool(self, workers: usize) -> Vec<WorkerInbox> {
        let workers = workers.max(1);
        let (ready_tx, ready_rx) = mpsc::channel(workers);
        tokio::spawn(dispatch(self.rx, ready_rx));
        (0..workers).map(|_| WorkerInbox { ready_tx: ready_tx.clone() }).collect()
    }
}

async fn dispatch(mut jobs: mpsc::UnboundedReceiver<DownloadJob>, mut ready: mpsc::Receiver<Slot>) {
    let mut carried: VecDeque<DownloadJob> = VecDeque::new();
    while let Some(slot) = ready.recv().await {
        let job = match carried.pop_front() {
            Some(job) => job,
            None => match jobs.recv().await {
                Some(job) => job,
                None => break,
            },
        };
        // a worker that went away hands its job to the next ready one
        if let Err(job) = slot.send(job) {
            carried.push_front(job);
        }
    }
    debug!("download queue dispatcher stopped");
}

impl WorkerInbox {
    /// Waits for the next job. `None` once every producer is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<DownloadJob> {
        let (slot, rx) = oneshot::channel();
        self.ready_tx.send(slot).await.ok()?;
        rx.await.ok()
    }
}
