//! Endpoint handlers for the orchestration facade.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::context::AppContext;
use crate::models::{validate_company_key, EnqueueOutcome, QueueKind};
use crate::scrapers::{FetchError, ScrapeError};
use crate::search::{SearchError, SearchQuery};

/// Uniform JSON error response.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn check_key(key: &str) -> Result<(), ApiError> {
    if validate_company_key(key) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "company key must be 8 digits",
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub key: String,
    #[serde(flatten)]
    pub query: SearchQuery,
}

/// POST /v2/serper — synchronous search stage.
pub async fn run_search(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, ApiError> {
    check_key(&request.key)?;

    if ctx
        .gate
        .acquire("serper", "search", 1.0, std::time::Duration::from_secs(10))
        .await
        .is_err()
    {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "search rate budget exhausted",
        ));
    }

    let query = request.query.build();
    let hits = ctx.search.search(&query).await.map_err(|e| match e {
        SearchError::Unreachable(detail) => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, detail)
        }
        SearchError::Api(detail) | SearchError::Parse(detail) => {
            ApiError::new(StatusCode::BAD_GATEWAY, detail)
        }
    })?;

    let search_id = ctx
        .companies
        .save_search(&request.key, &query, &hits)
        .await
        .map_err(|e| ApiError::internal("save search", e))?;

    Ok(Json(json!({
        "ok": true,
        "search_id": search_id,
        "result_count": hits.len(),
        "query_used": query,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

/// POST /v2/encontrar_site — enqueue the discovery stage.
pub async fn request_discovery(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<KeyRequest>,
) -> Result<Response, ApiError> {
    check_key(&request.key)?;

    let search = ctx
        .companies
        .latest_search(&request.key)
        .await
        .map_err(|e| ApiError::internal("read search", e))?;
    if search.is_none() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no search result for key",
        ));
    }

    ctx.discovery_queue
        .enqueue(&request.key)
        .await
        .map_err(|e| ApiError::internal("enqueue discovery", e))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "enqueued": true }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    pub key: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// POST /v2/scrape — synchronous scrape stage.
pub async fn run_scrape(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ScrapeRequest>,
) -> Result<Response, ApiError> {
    check_key(&request.key)?;

    let url = match request.url.filter(|u| !u.trim().is_empty()) {
        Some(url) => url,
        None => ctx
            .companies
            .get_discovery(&request.key)
            .await
            .map_err(|e| ApiError::internal("read discovery", e))?
            .and_then(|d| d.chosen_url)
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no url for key"))?,
    };

    let outcome = ctx
        .scraper
        .scrape(&request.key, &url)
        .await
        .map_err(scrape_error_to_api)?;

    Ok(Json(json!({
        "ok": true,
        "chunks_saved": outcome.chunks_saved,
        "tokens": outcome.tokens,
        "pages": outcome.pages_fetched,
        "pages_failed": outcome.pages_failed,
        "strategy": outcome.strategy_used,
        "ms": outcome.ms,
    }))
    .into_response())
}

fn scrape_error_to_api(e: ScrapeError) -> ApiError {
    match e {
        ScrapeError::Probe(probe) => ApiError::new(StatusCode::BAD_GATEWAY, probe.to_string()),
        ScrapeError::CircuitOpen(origin) => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("circuit open for {origin}"),
        ),
        ScrapeError::MainPageFailed(FetchError::Timeout(_)) => {
            ApiError::new(StatusCode::GATEWAY_TIMEOUT, "site timed out")
        }
        ScrapeError::MainPageFailed(fetch) => {
            ApiError::new(StatusCode::BAD_GATEWAY, fetch.to_string())
        }
        ScrapeError::NoContent => ApiError::new(StatusCode::BAD_GATEWAY, "no page yielded content"),
        ScrapeError::Chunking(chunk) => ApiError::internal("chunking", chunk),
        ScrapeError::Repository(repo) => ApiError::internal("persist chunks", repo),
    }
}

/// POST /v2/montagem_perfil — enqueue the profile stage.
pub async fn request_profile(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<KeyRequest>,
) -> Result<Response, ApiError> {
    check_key(&request.key)?;

    let chunks = ctx
        .companies
        .get_chunks(&request.key)
        .await
        .map_err(|e| ApiError::internal("read chunks", e))?;
    if chunks.is_empty() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no scraped chunks for key",
        ));
    }

    ctx.profile_queue
        .enqueue(&request.key)
        .await
        .map_err(|e| ApiError::internal("enqueue profile", e))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "enqueued": true }))).into_response())
}

/// POST /v2/queue_{kind}/enqueue
pub async fn queue_enqueue(
    ctx: Arc<AppContext>,
    kind: QueueKind,
    request: KeyRequest,
) -> Result<Response, ApiError> {
    check_key(&request.key)?;
    let outcome = ctx
        .queue(kind)
        .enqueue(&request.key)
        .await
        .map_err(|e| ApiError::internal("enqueue", e))?;

    let status = match outcome {
        EnqueueOutcome::Enqueued(_) => "enqueued",
        EnqueueOutcome::AlreadyActive => "already_active",
    };
    Ok(Json(json!({ "status": status })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub keys: Vec<String>,
}

/// POST /v2/queue_{kind}/enqueue_batch
pub async fn queue_enqueue_batch(
    ctx: Arc<AppContext>,
    kind: QueueKind,
    request: BatchRequest,
) -> Result<Response, ApiError> {
    for key in &request.keys {
        check_key(key)?;
    }
    let (enqueued, skipped) = ctx
        .queue(kind)
        .enqueue_batch(&request.keys)
        .await
        .map_err(|e| ApiError::internal("enqueue batch", e))?;
    Ok(Json(json!({ "enqueued": enqueued, "skipped": skipped })).into_response())
}

/// GET /v2/queue_{kind}/metrics
pub async fn queue_metrics(ctx: Arc<AppContext>, kind: QueueKind) -> Result<Response, ApiError> {
    let metrics = ctx
        .queue(kind)
        .metrics()
        .await
        .map_err(|e| ApiError::internal("queue metrics", e))?;
    Ok(Json(metrics).into_response())
}

/// GET /healthz — liveness only, touches no shared state.
pub async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}
