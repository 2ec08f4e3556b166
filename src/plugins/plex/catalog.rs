use crate::core::media::{Directory, Metadata};
use crate::plugins::plex::types::ResponseRoot;
use crate::plugins::registry::{MediaCatalog, PlexContext};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum PlexError {
    #[error("plex returned {status} for {path}")]
    Status { status: StatusCode, path: String },

    #[error("plex returned no metadata for key {0}")]
    NotFound(String),

    #[error("unhandled metadata type: {0}")]
    UnhandledType(String),
}

pub struct PlexClient {
    pub(crate) client: reqwest::Client,
    pub(crate) ctx: PlexContext,
}

impl PlexClient {
    pub fn new(ctx: PlexContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(ctx.timeout_secs))
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, ctx })
    }

    pub(crate) fn url_for(&self, path: &str) -> anyhow::Result<Url> {
        let raw = format!("{}{}", self.ctx.url.trim_end_matches('/'), path);
        let mut url = Url::parse(&raw).with_context(|| format!("invalid plex url {}", raw))?;
        if !self.ctx.token.is_empty() {
            url.query_pairs_mut().append_pair("X-Plex-Token", &self.ctx.token);
        }
        Ok(url)
    }

    pub(crate) fn build_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&self.ctx.user_agent)?);
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let ms = base.saturating_mul(1u64 << shift).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }

    async fn execute_get(&self, path: &str) -> anyhow::Result<ResponseRoot> {
        let url = self.url_for(path)?;
        let headers = self.build_headers()?;
        debug!(path, "plex GET");

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                self.sleep_backoff(attempt - 1).await;
            }

            let resp = match self
                .client
                .get(url.clone())
                .headers(headers.clone())
                .timeout(Duration::from_secs(self.ctx.timeout_secs))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(anyhow::Error::new(e).context(format!("GET {}", path)));
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return resp
                    .json::<ResponseRoot>()
                    .await
                    .with_context(|| format!("decode plex response for {}", path));
            }
            let err = PlexError::Status { status, path: path.to_string() };
            if Self::should_retry_status(status) {
                last_err = Some(err.into());
                continue;
            }
            return Err(err.into());
        }

        Err(last_err.unwrap_or_else(|| {
            PlexError::Status { status: StatusCode::REQUEST_TIMEOUT, path: path.to_string() }.into()
        }))
    }

    async fn get_children(&self, key: &str) -> anyhow::Result<Vec<Metadata>> {
        let root = self.execute_get(&format!("/library/metadata/{}/children", key)).await?;
        Ok(root.media_container.metadata)
    }
}

#[async_trait]
impl MediaCatalog for PlexClient {
    async fn get_libraries(&self) -> anyhow::Result<Vec<Directory>> {
        let root = self.execute_get("/library/sections").await?;
        Ok(root.media_container.directory)
    }

    async fn get_library_content(&self, key: &str) -> anyhow::Result<Vec<Metadata>> {
        let root = self.execute_get(&format!("/library/sections/{}/all", key)).await?;
        Ok(root.media_container.metadata)
    }

    async fn get_media_metadata(&self, key: &str) -> anyhow::Result<Metadata> {
        let root = self.execute_get(&format!("/library/metadata/{}", key)).await?;
        root.media_container
            .metadata
            .into_iter()
            .next()
            .ok_or_else(|| PlexError::NotFound(key.to_string()).into())
    }

    async fn get_metadata_with_parts(&self, key: &str) -> anyhow::Result<Vec<Metadata>> {
        let m = self.get_media_metadata(key).await?;

        let seasons = match m.kind.as_str() {
            "movie" | "episode" => return Ok(vec![m]),
            "show" => self
                .get_children(key)
                .await
                .with_context(|| format!("children of show {}", key))?,
            "season" => vec![m],
            other => return Err(PlexError::UnhandledType(other.to_string()).into()),
        };

        let mut episodes = Vec::new();
        for season in seasons {
            let children = self
                .get_children(&season.rating_key)
                .await
                .with_context(|| format!("children of season {}", season.rating_key))?;
            episodes.extend(children);
        }
        Ok(episodes)
    }
}
