//! In-process publish/subscribe for live progress.
//!
//! A single control loop owns the subscriber map. Everything else talks to it
//! through [`HubHandle`], which only ever sends commands over an unbounded
//! channel, so publishing never blocks a worker.

use crate::core::events::ProgressEvent;
use crate::core::model::SubscriberId;
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(54);

enum Command {
    Register { id: SubscriberId, tx: mpsc::Sender<ProgressEvent> },
    Unregister(SubscriberId),
    Broadcast(ProgressEvent),
    Count(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    buffer: usize,
}

pub struct Hub {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>,
    keepalive: Duration,
}

impl Hub {
    pub fn new(buffer: usize, keepalive: Duration) -> (Self, HubHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let hub = Self {
            cmd_rx,
            subscribers: HashMap::new(),
            keepalive: keepalive.max(Duration::from_millis(1)),
        };
        (hub, HubHandle { cmd_tx, buffer: buffer.max(1) })
    }

    pub fn spawn(buffer: usize, keepalive: Duration) -> HubHandle {
        let (hub, handle) = Self::new(buffer, keepalive);
        tokio::spawn(hub.run());
        handle
    }

    /// Runs until every handle (and every live subscription) is gone.
    pub async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.keepalive, self.keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = ticker.tick() => self.broadcast(ProgressEvent::ping()),
            }
        }
        debug!("status hub stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { id, tx } => {
                self.subscribers.insert(id, tx);
                info!(subscriber = %id, total = self.subscribers.len(), "subscriber registered");
            }
            Command::Unregister(id) => {
                if self.subscribers.remove(&id).is_some() {
                    info!(subscriber = %id, total = self.subscribers.len(), "subscriber unregistered");
                }
            }
            Command::Broadcast(evt) => self.broadcast(evt),
            Command::Count(reply) => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn broadcast(&mut self, evt: ProgressEvent) {
        let mut evicted = Vec::new();
        for (id, tx) in &self.subscribers {
            match tx.try_send(evt.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => evicted.push((*id, "outbound buffer full")),
                Err(TrySendError::Closed(_)) => evicted.push((*id, "receiver closed")),
            }
        }
        // removing the sender closes the subscriber's channel
        for (id, reason) in evicted {
            self.subscribers.remove(&id);
            warn!(subscriber = %id, reason, "evicting subscriber");
        }
    }
}

impl HubHandle {
    pub fn publish(&self, evt: ProgressEvent) {
        if self.cmd_tx.send(Command::Broadcast(evt)).is_err() {
            debug!("status hub is gone; dropping event");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = self.cmd_tx.send(Command::Register { id, tx });
        Subscription { id, rx, hub: self.clone() }
    }

    pub fn unregister(&self, id: SubscriberId) {
        let _ = self.cmd_tx.send(Command::Unregister(id));
    }

    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// A registered receiver. Dropping it unregisters from the hub.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<ProgressEvent>,
    hub: HubHandle,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// `None` once the hub has evicted this subscriber.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
