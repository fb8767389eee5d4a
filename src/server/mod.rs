//! HTTP facade for the profiling pipeline.
//!
//! Synchronous stages (search, scrape) run inline; asynchronous stages
//! (discovery, profile) are acknowledged with 202 and drained by the
//! workers spawned alongside the server.

mod auth;
mod handlers;
mod routes;

pub use routes::create_router;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::context::AppContext;
use crate::services::{
    spawn_workers, DiscoveryAgent, DiscoveryHandler, ProfileExtractor, ProfileHandler,
    StageHandler,
};

/// Start the server and its workers; returns on ctrl-c after a drain.
pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handlers: Vec<(crate::repository::QueueRepository, Arc<dyn StageHandler>)> = vec![
        (
            ctx.discovery_queue.clone(),
            Arc::new(DiscoveryHandler::new(
                ctx.companies.clone(),
                DiscoveryAgent::new(ctx.caller.clone()),
            )),
        ),
        (
            ctx.profile_queue.clone(),
            Arc::new(ProfileHandler::new(
                ctx.companies.clone(),
                ProfileExtractor::new(ctx.caller.clone()),
            )),
        ),
    ];
    let workers = spawn_workers(handlers, ctx.settings.n_workers, shutdown_rx);

    let app = create_router(ctx.clone());
    let addr = ctx.settings.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Stop claiming and let in-flight entries finish.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::config::Settings;
    use crate::llm::VendorConfig;

    fn test_settings(dir: &std::path::Path, token: Option<&str>) -> Settings {
        Settings {
            database_url: dir.join("test.db").display().to_string(),
            search_key: "test-key".to_string(),
            api_access_token: token.map(|t| t.to_string()),
            n_workers: 1,
            database_pool_max_size: 4,
            llm_concurrency_hard_cap: 4,
            proxy_url: None,
            bind_addr: "127.0.0.1:0".to_string(),
            link_budget: 30,
            vendors: vec![VendorConfig {
                name: "primary".to_string(),
                endpoint: "http://127.0.0.1:9".to_string(),
                model: "test-model".to_string(),
                api_key: None,
                max_concurrent: 2,
                max_output_tokens: 4096,
                supports_schema: true,
                supports_sampling: true,
                attempts: 1,
                requests_per_sec: 10.0,
                burst: 10.0,
            }],
        }
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz_needs_no_auth() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), Some("segredo"))).unwrap();
        let app = create_router(ctx);

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_reject_bad_token() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), Some("segredo"))).unwrap();
        let app = create_router(ctx);

        let response = app
            .clone()
            .oneshot(post("/v2/queue_discovery/enqueue", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = post("/v2/queue_discovery/enqueue", r#"{"key":"12345678"}"#);
        request
            .headers_mut()
            .insert("x-api-key", "segredo".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_queue_endpoints_round_trip() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), None)).unwrap();
        let app = create_router(ctx.clone());

        let response = app
            .clone()
            .oneshot(post("/v2/queue_profile/enqueue", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Second enqueue of the same key is a no-op.
        let response = app
            .clone()
            .oneshot(post("/v2/queue_profile/enqueue", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let metrics = ctx.profile_queue.metrics().await.unwrap();
        assert_eq!(metrics.queued, 1);

        let response = app
            .oneshot(
                Request::get("/v2/queue_profile/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_batch_reports_skipped() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), None)).unwrap();
        let app = create_router(ctx.clone());

        ctx.discovery_queue.enqueue("11111111").await.unwrap();
        let response = app
            .oneshot(post(
                "/v2/queue_discovery/enqueue_batch",
                r#"{"keys":["11111111","22222222"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let metrics = ctx.discovery_queue.metrics().await.unwrap();
        assert_eq!(metrics.queued, 2);
    }

    #[tokio::test]
    async fn test_stage_endpoints_404_without_input() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), None)).unwrap();
        let app = create_router(ctx);

        // No search row yet.
        let response = app
            .clone()
            .oneshot(post("/v2/encontrar_site", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // No chunks yet.
        let response = app
            .clone()
            .oneshot(post("/v2/montagem_perfil", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // No discovered url and none provided.
        let response = app
            .oneshot(post("/v2/scrape", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_discovery_request_accepted_with_search_row() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), None)).unwrap();
        let app = create_router(ctx.clone());

        ctx.companies
            .save_search("12345678", "example site oficial", &[])
            .await
            .unwrap();

        let response = app
            .oneshot(post("/v2/encontrar_site", r#"{"key":"12345678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let metrics = ctx.discovery_queue.metrics().await.unwrap();
        assert_eq!(metrics.queued, 1);
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(test_settings(dir.path(), None)).unwrap();
        let app = create_router(ctx);

        let response = app
            .oneshot(post("/v2/montagem_perfil", r#"{"key":"12AB5678"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
