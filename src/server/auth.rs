//! Shared-secret header authentication.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::context::AppContext;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests whose `x-api-key` does not match the configured token.
/// When no token is configured, auth is disabled.
pub async fn require_token(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref expected) = ctx.settings.api_access_token else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid api key" })),
        )
            .into_response()
    }
}
