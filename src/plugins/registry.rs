use crate::core::media::{Directory, Metadata};
use crate::core::model::{Category, SubscriptionEntry};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgMatches, Command};
use futures::Stream;
use std::io;
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Remote library: listing, metadata and part resolution.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    async fn get_libraries(&self) -> anyhow::Result<Vec<Directory>>;
    async fn get_library_content(&self, key: &str) -> anyhow::Result<Vec<Metadata>>;
    async fn get_media_metadata(&self, key: &str) -> anyhow::Result<Metadata>;

    /// Expands shows and seasons down to their episodes. Movies and episodes
    /// come back as a single entry.
    async fn get_metadata_with_parts(&self, key: &str) -> anyhow::Result<Vec<Metadata>>;
}

/// Opens the byte stream of one remote part.
#[async_trait]
pub trait PartSource: Send + Sync {
    async fn open(&self, part_key: &str) -> anyhow::Result<ByteStream>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn exists(&self, category: Category, external_id: &str) -> anyhow::Result<bool>;
    async fn get(&self, category: Category, external_id: &str) -> anyhow::Result<Option<SubscriptionEntry>>;
    async fn add(&self, entry: &SubscriptionEntry) -> anyhow::Result<()>;
    async fn remove(&self, category: Category, external_id: &str) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<SubscriptionEntry>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub message_id: i64,
    pub pop_receipt: String,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub handle: DeliveryHandle,
    pub body: String,
    pub dequeue_count: i64,
}

/// Durable at-least-once queue the webhook intake writes into.
#[async_trait]
pub trait WebhookQueue: Send + Sync {
    async fn poll(&self, max_messages: usize, visibility: std::time::Duration) -> anyhow::Result<Vec<QueuedMessage>>;
    async fn delete(&self, handle: &DeliveryHandle) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PlexContext {
    pub url: String,
    pub token: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PlexContext {
    fn default() -> Self {
        Self {
            url: "http://localhost:32400".to_string(),
            token: String::new(),
            user_agent: concat!("plex-local-dl/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub plex: PlexContext,
    pub listen: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { plex: PlexContext::default(), listen: "0.0.0.0:8080".to_string() }
    }
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies_to(&self, subcommand: &str) -> bool;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServiceConfig) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };
        reg.cli_plugins.push(Box::new(crate::plugins::plex::cli::PlexCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::api::cli::ApiCliPlugin::new()));
        reg
    }

    pub fn augment_command(&self, subcommand: &str, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .filter(|p| p.applies_to(subcommand))
            .fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, subcommand: &str, matches: &ArgMatches, cfg: &mut ServiceConfig) -> anyhow::Result<()> {
        for p in self.cli_plugins.iter().filter(|p| p.applies_to(subcommand)) {
            p.apply_matches(matches, cfg)
                .map_err(|e| e.context(format!("plugin {}", p.name())))?;
        }
        Ok(())
    }
}
