//! Command-line interface.

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::context::AppContext;
use crate::models::QueueKind;
use crate::repository::run_all_migrations;

#[derive(Parser)]
#[command(name = "fornecedor", about = "B2B company profiling pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP facade and the stage workers.
    Serve,
    /// Create tables and indexes, then exit.
    Migrate,
    /// Print queue metrics.
    Status,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("configuration error")?;

    match cli.command {
        Command::Serve => {
            let ctx = AppContext::new(settings)?;
            crate::server::serve(ctx).await
        }
        Command::Migrate => {
            let tables = run_all_migrations(&settings.db_path())?;
            println!("migrated {} tables:", tables.len());
            for table in tables {
                println!("  {table}");
            }
            Ok(())
        }
        Command::Status => {
            let ctx = AppContext::new(settings)?;
            for kind in [QueueKind::Discovery, QueueKind::Profile] {
                let metrics = ctx.queue(kind).metrics().await?;
                println!(
                    "{:<10} queued={} processing={} done={} failed={}",
                    kind.as_str(),
                    metrics.queued,
                    metrics.processing,
                    metrics.done,
                    metrics.failed
                );
            }
            Ok(())
        }
    }
}
