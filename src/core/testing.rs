//! In-memory collaborators for unit tests.

use crate::core::model::{Category, SubscriptionEntry};
use crate::core::media::{Directory, Media, Metadata, Part};
use crate::plugins::registry::{
    ByteStream, DeliveryHandle, MediaCatalog, PartSource, QueuedMessage, SubscriptionStore, WebhookQueue,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub fn media_item(key: &str, title: &str, parts: &[(&str, &str, u64)]) -> Metadata {
    Metadata {
        rating_key: key.to_string(),
        kind: "episode".to_string(),
        title: title.to_string(),
        media: vec![Media {
            parts: parts
                .iter()
                .map(|(k, f, size)| Part { key: k.to_string(), file: f.to_string(), size: *size, ..Default::default() })
                .collect(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeCatalog {
    items: Mutex<HashMap<String, Vec<Metadata>>>,
}

impl FakeCatalog {
    pub fn with(self, key: &str, items: Vec<Metadata>) -> Self {
        self.items.lock().unwrap().insert(key.to_string(), items);
        self
    }
}

#[async_trait]
impl MediaCatalog for FakeCatalog {
    async fn get_libraries(&self) -> anyhow::Result<Vec<Directory>> {
        Ok(vec![Directory { key: "1".into(), kind: "movie".into(), title: "Movies".into(), ..Default::default() }])
    }

    async fn get_library_content(&self, _key: &str) -> anyhow::Result<Vec<Metadata>> {
        Ok(self.items.lock().unwrap().values().flatten().cloned().collect())
    }

    async fn get_media_metadata(&self, key: &str) -> anyhow::Result<Metadata> {
        self.items
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.first().cloned())
            .ok_or_else(|| anyhow::anyhow!("no metadata for {}", key))
    }

    async fn get_metadata_with_parts(&self, key: &str) -> anyhow::Result<Vec<Metadata>> {
        self.items
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no metadata for {}", key))
    }
}

pub enum Script {
    Chunks(Vec<Vec<u8>>),
    /// Yields the chunks, then an I/O error.
    FailAfter(Vec<Vec<u8>>),
    /// Sleeps before each chunk.
    Slow(Vec<Vec<u8>>, Duration),
    /// Yields the chunks, then never yields again.
    Stall(Vec<Vec<u8>>),
}

#[derive(Default)]
pub struct MemorySource {
    parts: Mutex<HashMap<String, Script>>,
}

impl MemorySource {
    pub fn with(self, key: &str, script: Script) -> Self {
        self.parts.lock().unwrap().insert(key.to_string(), script);
        self
    }
}

#[async_trait]
impl PartSource for MemorySource {
    async fn open(&self, part_key: &str) -> anyhow::Result<ByteStream> {
        let parts = self.parts.lock().unwrap();
        let chunks = |c: &Vec<Vec<u8>>| -> Vec<io::Result<Bytes>> { c.iter().map(|b| Ok(Bytes::from(b.clone()))).collect() };
        let stream: ByteStream = match parts.get(part_key) {
            Some(Script::Chunks(c)) => Box::pin(futures::stream::iter(chunks(c))),
            Some(Script::FailAfter(c)) => {
                let reset = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
                Box::pin(futures::stream::iter(chunks(c)).chain(futures::stream::once(async move { Err(reset) })))
            }
            Some(Script::Slow(c, gap)) => {
                let gap = *gap;
                Box::pin(futures::stream::iter(chunks(c)).then(move |chunk| async move {
                    tokio::time::sleep(gap).await;
                    chunk
                }))
            }
            Some(Script::Stall(c)) => Box::pin(futures::stream::iter(chunks(c)).chain(futures::stream::pending())),
            None => anyhow::bail!("unknown part {}", part_key),
        };
        Ok(stream)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(Category, String), SubscriptionEntry>>,
    pub unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn with(self, category: Category, external_id: &str, media_key: &str) -> Self {
        self.entries.lock().unwrap().insert(
            (category, external_id.to_string()),
            SubscriptionEntry {
                category,
                external_id: external_id.to_string(),
                media_key: media_key.to_string(),
                title: String::new(),
            },
        );
        self
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("store unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn exists(&self, category: Category, external_id: &str) -> anyhow::Result<bool> {
        self.check()?;
        Ok(self.entries.lock().unwrap().contains_key(&(category, external_id.to_string())))
    }

    async fn get(&self, category: Category, external_id: &str) -> anyhow::Result<Option<SubscriptionEntry>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(&(category, external_id.to_string())).cloned())
    }

    async fn add(&self, entry: &SubscriptionEntry) -> anyhow::Result<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap()
            .insert((entry.category, entry.external_id.clone()), entry.clone());
        Ok(())
    }

    async fn remove(&self, category: Category, external_id: &str) -> anyhow::Result<()> {
        self.check()?;
        self.entries.lock().unwrap().remove(&(category, external_id.to_string()));
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<SubscriptionEntry>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }
}

/// Replays scripted poll results, then keeps failing (`fail_when_empty`) or returns nothing.
pub struct ScriptedQueue {
    script: Mutex<VecDeque<Result<Vec<String>, String>>>,
    fail_when_empty: bool,
    next_id: Mutex<i64>,
    pub polls: Mutex<Vec<Instant>>,
    pub deleted: Mutex<Vec<DeliveryHandle>>,
    poll_tx: mpsc::UnboundedSender<usize>,
}

impl ScriptedQueue {
    pub fn new(
        script: Vec<Result<Vec<String>, String>>,
        fail_when_empty: bool,
    ) -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let q = Self {
            script: Mutex::new(script.into()),
            fail_when_empty,
            next_id: Mutex::new(0),
            polls: Mutex::new(vec![]),
            deleted: Mutex::new(vec![]),
            poll_tx,
        };
        (q, poll_rx)
    }

    pub fn deleted_ids(&self) -> Vec<i64> {
        self.deleted.lock().unwrap().iter().map(|h| h.message_id).collect()
    }
}

#[async_trait]
impl WebhookQueue for ScriptedQueue {
    async fn poll(&self, max_messages: usize, _visibility: Duration) -> anyhow::Result<Vec<QueuedMessage>> {
        let count = {
            let mut polls = self.polls.lock().unwrap();
            polls.push(Instant::now());
            polls.len()
        };
        let _ = self.poll_tx.send(count);

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(bodies)) => {
                let mut id = self.next_id.lock().unwrap();
                Ok(bodies
                    .into_iter()
                    .take(max_messages)
                    .map(|body| {
                        *id += 1;
                        QueuedMessage {
                            handle: DeliveryHandle { message_id: *id, pop_receipt: format!("r{}", id) },
                            body,
                            dequeue_count: 1,
                        }
                    })
                    .collect())
            }
            Some(Err(e)) => anyhow::bail!(e),
            None if self.fail_when_empty => anyhow::bail!("queue unreachable"),
            None => Ok(vec![]),
        }
    }

    async fn delete(&self, handle: &DeliveryHandle) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(handle.clone());
        Ok(())
    }
}
