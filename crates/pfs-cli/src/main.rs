use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfs_feed::FeedSource;
use pfs_sync::{Scheduler, SyncConfig};
use pfs_web::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pfs-cli")]
#[command(about = "Property feed to WordPress importer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the daily scheduler (default).
    Serve,
    /// Run one import now and print its summary.
    Sync,
    /// Fetch and parse the feed without touching the backend.
    Preview {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let orchestrator = Arc::new(config.build_orchestrator()?);
            let scheduler = Arc::new(Scheduler::new(orchestrator));
            if config.scheduler_enabled {
                scheduler.start().await;
            } else {
                tracing::info!("daily scheduler disabled");
            }
            let state = AppState::new(scheduler)
                .with_trigger_secret(config.trigger_secret.clone())
                .with_ping_message(
                    std::env::var("PING_MESSAGE").unwrap_or_else(|_| "ping".to_string()),
                );
            pfs_web::serve(state, pfs_web::port_from_env()).await?;
        }
        Commands::Sync => {
            let orchestrator = config.build_orchestrator()?;
            let summary = orchestrator
                .run_to_completion()
                .await
                .context("import run failed")?;
            println!(
                "sync complete: run_id={} records={} imported={} updated={} errors={} archived={}",
                summary.run_id,
                summary.total_records,
                summary.imported,
                summary.updated,
                summary.errors,
                summary.archived
            );
        }
        Commands::Preview { limit } => {
            let feed = config.feed_source()?;
            let mut records = feed
                .fetch_records()
                .await
                .with_context(|| format!("reading feed {}", feed.location()))?;
            if let Some(limit) = limit {
                records.truncate(limit);
            }
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
