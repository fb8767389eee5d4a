//! Router configuration for the facade.

use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use super::auth;
use super::handlers::{self, ApiError, BatchRequest, KeyRequest};
use crate::context::AppContext;
use crate::models::QueueKind;

/// Create the router: stage endpoints and queue endpoints behind the
/// shared secret, liveness outside it.
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    let protected = Router::new()
        .route("/v2/serper", post(handlers::run_search))
        .route("/v2/encontrar_site", post(handlers::request_discovery))
        .route("/v2/scrape", post(handlers::run_scrape))
        .route("/v2/montagem_perfil", post(handlers::request_profile))
        .route("/v2/queue_discovery/enqueue", post(discovery_enqueue))
        .route(
            "/v2/queue_discovery/enqueue_batch",
            post(discovery_enqueue_batch),
        )
        .route("/v2/queue_discovery/metrics", get(discovery_metrics))
        .route("/v2/queue_profile/enqueue", post(profile_enqueue))
        .route(
            "/v2/queue_profile/enqueue_batch",
            post(profile_enqueue_batch),
        )
        .route("/v2/queue_profile/metrics", get(profile_metrics))
        .route_layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn discovery_enqueue(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<KeyRequest>,
) -> Result<Response, ApiError> {
    handlers::queue_enqueue(ctx, QueueKind::Discovery, request).await
}

async fn discovery_enqueue_batch(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<BatchRequest>,
) -> Result<Response, ApiError> {
    handlers::queue_enqueue_batch(ctx, QueueKind::Discovery, request).await
}

async fn discovery_metrics(State(ctx): State<Arc<AppContext>>) -> Result<Response, ApiError> {
    handlers::queue_metrics(ctx, QueueKind::Discovery).await
}

async fn profile_enqueue(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<KeyRequest>,
) -> Result<Response, ApiError> {
    handlers::queue_enqueue(ctx, QueueKind::Profile, request).await
}

async fn profile_enqueue_batch(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<BatchRequest>,
) -> Result<Response, ApiError> {
    handlers::queue_enqueue_batch(ctx, QueueKind::Profile, request).await
}

async fn profile_metrics(State(ctx): State<Arc<AppContext>>) -> Result<Response, ApiError> {
    handlers::queue_metrics(ctx, QueueKind::Profile).await
}
