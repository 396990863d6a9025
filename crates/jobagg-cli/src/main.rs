use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobagg_core::AggregationRun;
use jobagg_storage::ListingStore;
use jobagg_sync::{AggregationPipeline, AggregatorSettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobagg-cli")]
#[command(about = "Canadian job listing aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation pass over every enabled source.
    Run {
        #[arg(long)]
        json: bool,
    },
    /// Show the most recently scraped listings.
    Recent {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Listing totals, overall and per source.
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Run once, then keep aggregating on the configured cron schedule.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,jobagg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = AggregatorSettings::from_env();

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let pipeline = AggregationPipeline::from_settings(settings).await?;
            let run = pipeline.run_once_with_cancel(cancel_on_ctrl_c()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
        }
        Commands::Recent { limit, json } => {
            let pipeline = AggregationPipeline::from_settings(settings).await?;
            let listings = pipeline.store().query_recent(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else {
                for listing in &listings {
                    println!(
                        "{} | {} | {} | {} | {} | {}",
                        listing.scraped_at.format("%Y-%m-%d %H:%M"),
                        listing.source_name,
                        listing.title,
                        listing.company,
                        listing.location,
                        listing.url
                    );
                }
            }
        }
        Commands::Stats { json } => {
            let pipeline = AggregationPipeline::from_settings(settings).await?;
            let store = pipeline.store();
            let total = store.count_all().await?;
            let by_source = store.count_by_source().await?;
            if json {
                let value = serde_json::json!({ "total": total, "by_source": by_source });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("total listings: {total}");
                for (source, count) in &by_source {
                    println!("  {source}: {count}");
                }
            }
        }
        Commands::Watch => {
            let settings = AggregatorSettings {
                scheduler_enabled: true,
                ..settings
            };
            let pipeline = Arc::new(AggregationPipeline::from_settings(settings).await?);

            let run = pipeline.run_once().await?;
            print_run(&run);

            let Some(mut sched) = pipeline.clone().maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.settings().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing with what has been collected");
            trigger.cancel();
        }
    });
    cancel
}

fn print_run(run: &AggregationRun) {
    println!(
        "run {} complete: queries={} skipped={} candidates={} rejected={} duplicates={} supplements={} stored={} cancelled={}",
        run.run_id,
        run.queries_attempted.len(),
        run.queries_skipped.len(),
        run.candidates_seen,
        run.rejected_candidates,
        run.duplicate_listings,
        run.supplements_added,
        run.newly_persisted,
        run.cancelled
    );
    for failure in &run.failures {
        println!(
            "  failed: {} [{}] {}",
            failure.source_id,
            failure.query.as_deref().unwrap_or("-"),
            failure.reason
        );
    }
}
