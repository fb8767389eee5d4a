//! Fornecedor - structured profiling pipeline for Brazilian B2B companies.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fornecedor::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fornecedor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
