use crate::core::media::{Directory, Metadata};
use crate::core::model::{Category, JobId, SubscriptionEntry};
use crate::core::orchestrator::Orchestrator;
use crate::core::store::{SqliteStore, StoreError};
use crate::plugins::api::ws;
use crate::plugins::plex::catalog::PlexError;
use crate::plugins::registry::SubscriptionStore;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub store: SqliteStore,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        let status = match (e.downcast_ref::<StoreError>(), e.downcast_ref::<PlexError>()) {
            (Some(StoreError::Duplicate { .. }), _) => StatusCode::CONFLICT,
            (_, Some(PlexError::NotFound(_))) => StatusCode::NOT_FOUND,
            (_, Some(PlexError::UnhandledType(_))) => StatusCode::UNPROCESSABLE_ENTITY,
            (_, Some(PlexError::Status { .. })) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, format!("{:#}", e))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        anyhow::Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = self.status.as_u16(), "request failed: {}", self.message);
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct Queued {
    pub jobs: Vec<JobId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub subscribers: usize,
    pub pending_webhooks: i64,
}

/// Body of `POST /subscriptions`. Without `externalId` the id is read from
/// the item's Plex guids.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub category: Category,
    pub media_key: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/library", get(libraries))
        .route("/library/:section/media", get(library_media))
        .route("/media/:key", get(media_metadata))
        .route("/media/:key/download", post(download_media))
        .route("/subscriptions", get(list_subscriptions).post(add_subscription))
        .route("/subscriptions/:category/:id", delete(remove_subscription))
        .route("/webhook", post(push_webhook))
        .route("/status", get(status))
        .route("/ws", get(ws::upgrade));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

pub async fn serve<F>(listen: &str, state: ApiState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {}", listen))?;
    info!("api listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("api server")
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();
    debug!(%method, %uri, "request received");

    let res = next.run(req).await;
    info!(
        %method,
        %uri,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    res
}

async fn libraries(State(s): State<ApiState>) -> ApiResult<Json<Vec<Directory>>> {
    Ok(Json(s.orchestrator.catalog().get_libraries().await?))
}

async fn library_media(State(s): State<ApiState>, Path(section): Path<String>) -> ApiResult<Json<Vec<Metadata>>> {
    Ok(Json(s.orchestrator.catalog().get_library_content(&section).await?))
}

async fn media_metadata(State(s): State<ApiState>, Path(key): Path<String>) -> ApiResult<Json<Metadata>> {
    Ok(Json(s.orchestrator.catalog().get_media_metadata(&key).await?))
}

async fn download_media(State(s): State<ApiState>, Path(key): Path<String>) -> ApiResult<(StatusCode, Json<Queued>)> {
    let jobs = s.orchestrator.enqueue_media(&key).await?;
    Ok((StatusCode::ACCEPTED, Json(Queued { jobs })))
}

async fn list_subscriptions(State(s): State<ApiState>) -> ApiResult<Json<Vec<SubscriptionEntry>>> {
    Ok(Json(s.store.list().await?))
}

async fn add_subscription(
    State(s): State<ApiState>,
    Json(req): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<SubscriptionEntry>)> {
    // skip the plex round trip for an id we already hold
    if let Some(id) = &req.external_id {
        if s.store.exists(req.category, id).await? {
            return Err(ApiError::new(StatusCode::CONFLICT, format!("already subscribed to {} {}", req.category, id)));
        }
    }

    let (external_id, title) = match (req.external_id, req.title) {
        (Some(id), Some(title)) => (id, title),
        (id, title) => {
            let meta = s.orchestrator.catalog().get_media_metadata(&req.media_key).await?;
            let id = match id.or_else(|| meta.external_id(req.category)) {
                Some(id) => id,
                None => {
                    return Err(ApiError::new(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        format!("no {} id found for media {}", req.category, req.media_key),
                    ))
                }
            };
            (id, title.unwrap_or_else(|| meta.display_title()))
        }
    };

    let entry = SubscriptionEntry { category: req.category, external_id, media_key: req.media_key, title };
    s.store.add(&entry).await?;
    info!(category = %entry.category, id = %entry.external_id, "subscribed to {}", entry.title);
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_subscription(
    State(s): State<ApiState>,
    Path((category, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let category: Category = category
        .parse()
        .map_err(|e: anyhow::Error| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    s.store.remove(category, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn push_webhook(State(s): State<ApiState>, body: String) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let id = s.store.push(&body).await?;
    debug!(message = id, bytes = body.len(), "webhook stored");
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id }))))
}

async fn status(State(s): State<ApiState>) -> ApiResult<Json<Status>> {
    Ok(Json(Status {
        subscribers: s.orchestrator.hub().subscriber_count().await,
        pending_webhooks: s.store.pending_messages().await?,
    }))
}
