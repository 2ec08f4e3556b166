//! Radarr/Sonarr "on import" notifications and what to do with them.

use crate::core::model::{Category, JobId};
use crate::core::orchestrator::Orchestrator;
use crate::core::queue::QueueClosed;
use crate::plugins::registry::SubscriptionStore;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("malformed webhook message: {0}")]
    Malformed(String),

    #[error("subscription store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    #[error("catalog lookup for {media_key} failed: {error:#}")]
    Catalog { media_key: String, error: anyhow::Error },

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieInfo {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub tmdb_id: Option<i64>,
    pub imdb_id: String,
    #[serde(default)]
    pub folder_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieFile {
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieEvent {
    pub movie: MovieInfo,
    #[serde(default)]
    pub movie_file: Option<MovieFile>,
    #[serde(default)]
    pub is_upgrade: bool,
    #[serde(default)]
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesInfo {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub tvdb_id: u64,
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    #[serde(default)]
    pub season_number: u32,
    #[serde(default)]
    pub episode_number: u32,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesEvent {
    pub series: SeriesInfo,
    #[serde(default)]
    pub episodes: Vec<Episode>,
    #[serde(default)]
    pub is_upgrade: bool,
    #[serde(default)]
    pub event_type: Option<String>,
}

#[derive(Debug, Clone)]
pub enum WebhookMessage {
    Movie(MovieEvent),
    Series(SeriesEvent),
}

impl WebhookMessage {
    /// Picks the variant by the first non-null `movie` or `series` key, then
    /// parses strictly against it.
    pub fn parse(body: &str) -> Result<Self, IngestError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| IngestError::Malformed(format!("invalid json: {}", e)))?;

        let present = |key: &str| value.get(key).is_some_and(|v| !v.is_null());
        if present("movie") {
            return serde_json::from_value(value)
                .map(WebhookMessage::Movie)
                .map_err(|e| IngestError::Malformed(format!("movie: {}", e)));
        }
        if present("series") {
            return serde_json::from_value(value)
                .map(WebhookMessage::Series)
                .map_err(|e| IngestError::Malformed(format!("series: {}", e)));
        }
        Err(IngestError::Malformed("neither movie nor series present".into()))
    }

    pub fn subscription_key(&self) -> (Category, String) {
        match self {
            WebhookMessage::Movie(m) => (Category::Movie, m.movie.imdb_id.clone()),
            WebhookMessage::Series(s) => (Category::Series, s.series.tvdb_id.to_string()),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            WebhookMessage::Movie(m) => &m.movie.title,
            WebhookMessage::Series(s) => &s.series.title,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    NotSubscribed,
    Enqueued(Vec<JobId>),
}

/// Turns one webhook body into zero or more queued jobs.
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn SubscriptionStore>,
    orchestrator: Orchestrator,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn SubscriptionStore>, orchestrator: Orchestrator) -> Self {
        Self { store, orchestrator }
    }

    pub async fn handle(&self, body: &str) -> Result<HandleOutcome, IngestError> {
        let msg = WebhookMessage::parse(body)?;
        let (category, external_id) = msg.subscription_key();
        info!(%category, id = %external_id, "webhook for {}", msg.title());

        let entry = self
            .store
            .get(category, &external_id)
            .await
            .map_err(IngestError::StoreUnavailable)?;
        let Some(entry) = entry else {
            info!(%category, id = %external_id, "{} is not subscribed, ignoring", msg.title());
            return Ok(HandleOutcome::NotSubscribed);
        };

        // a series refresh re-queues every episode, not only the new ones
        let items = self
            .orchestrator
            .catalog()
            .get_metadata_with_parts(&entry.media_key)
            .await
            .map_err(|error| IngestError::Catalog { media_key: entry.media_key.clone(), error })?;

        let ids = self.orchestrator.enqueue_items(&items)?;
        info!(%category, id = %external_id, jobs = ids.len(), "queued downloads for {}", msg.title());
        Ok(HandleOutcome::Enqueued(ids))
    }
}
