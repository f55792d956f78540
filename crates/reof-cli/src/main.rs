use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reof_storage::PgStore;
use reof_sync::{report_runs, SyncConfig, SyncPipeline, SyncRunSummary};
use reof_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "reof-cli")]
#[command(about = "Real Estate Opportunity Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan every configured (source, city) pair once and write run reports.
    Scan {
        /// Read pages from fixtures/ instead of the live portals.
        #[arg(long)]
        fixtures: bool,
    },
    /// Summarize the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Serve the JSON reporting API.
    Serve {
        /// Run one scan into the store before serving.
        #[arg(long)]
        scan: bool,
        #[arg(long)]
        fixtures: bool,
    },
    /// Run scans on the SYNC_CRON_1/SYNC_CRON_2 schedule and serve the API alongside.
    Schedule {
        #[arg(long)]
        fixtures: bool,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reof_adapters=debug,reof_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "scan complete: run_id={} scans={} failed={} candidates={} found={} inserted={} skipped={} reports={}",
        summary.run_id,
        summary.scans,
        summary.failed_scans,
        summary.total_candidates,
        summary.opportunities_found,
        summary.inserted,
        summary.skipped,
        summary.reports_dir
    );
}

async fn pipeline(fixtures: bool) -> Result<(SyncConfig, Arc<SyncPipeline>)> {
    let mut config = SyncConfig::from_env()?;
    config.force_fixtures |= fixtures;
    let pipeline = SyncPipeline::from_config(config.clone()).await?;
    Ok((config, Arc::new(pipeline)))
}

fn app_state(pipeline: &SyncPipeline) -> AppState {
    AppState::new(pipeline.store(), pipeline.registry())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scan { fixtures: false }) {
        Commands::Scan { fixtures } => {
            let summary = reof_sync::run_sync_once_from_env(fixtures).await?;
            print_summary(&summary);
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env()?;
            println!("{}", report_runs(&config.reports_dir(), runs)?);
        }
        Commands::Serve { scan, fixtures } => {
            if !scan {
                return reof_web::serve_from_env().await;
            }
            let (config, pipeline) = pipeline(fixtures).await?;
            print_summary(&pipeline.run_once().await?);
            reof_web::serve(app_state(&pipeline), config.web_port).await?;
        }
        Commands::Schedule { fixtures } => {
            let (config, pipeline) = pipeline(fixtures).await?;
            let scheduler = pipeline
                .clone()
                .build_scheduler()
                .await?
                .context("REOF_SCHEDULER_ENABLED is not set")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler started");
            reof_web::serve(app_state(&pipeline), config.web_port).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            PgStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
