mod config;
mod day;
mod export;
mod fetch;
mod journal;
mod metadata;
mod periodic;
mod pipeline;
mod storage;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use day::Day;
use fetch::LocalArchiveFetcher;
use periodic::Interval;
use pipeline::{BacklogOptions, Etl, PipelineError};
use storage::{FsObjectStore, StorageClient};

#[derive(Parser)]
#[command(name = "tripledger")]
#[command(about = "Daily ETL pipeline reconstructing per-trip subway histories from GTFS-RT archives")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for a single day
    Run {
        /// Day to process (YYYY-MM-DD)
        day: String,
    },
    /// Run the pipeline for every day that is not up to date, newest first
    Backlog {
        /// Maximum number of days to process
        #[arg(short, long)]
        limit: Option<usize>,
        /// Number of days to run concurrently
        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,
        /// Only log the days that would be processed
        #[arg(short, long)]
        dry_run: bool,
        /// Maximum time to run for (HH:MM:SS); in-flight days drain when it
        /// expires
        #[arg(short, long)]
        timeout: Option<String>,
    },
    /// Delete processed days from the metadata catalog
    Delete {
        /// Day to delete (YYYY-MM-DD, repeatable)
        #[arg(long = "day", required = true)]
        days: Vec<String>,
        /// Perform the deletions instead of just printing them
        #[arg(long)]
        yes: bool,
    },
    /// Run the backlog inside the given local-time windows each day
    Periodic {
        /// Windows in the form HH:MM:SS-HH:MM:SS
        #[arg(required = true)]
        intervals: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).expect("Failed to load config");
    tracing::info!(feeds = config.feeds.len(), timezone = %config.timezone, "Loaded configuration");

    let fetcher = Arc::new(LocalArchiveFetcher::new(&config.archive_dir));
    let storage = Arc::new(StorageClient::new(
        Box::new(FsObjectStore::new(&config.storage.root)),
        config.metadata_path.clone(),
    ));
    let etl = Arc::new(Etl::new(config, fetcher, storage).expect("Failed to initialize pipeline"));

    let result = match cli.command {
        Command::Run { day } => {
            let day: Day = parse_or_exit(&day, "day");
            let feed_ids = etl.feeds_valid_on(day);
            if feed_ids.is_empty() {
                tracing::error!(%day, "no configured feed covers this day");
                std::process::exit(2);
            }
            etl.run_day(day, &feed_ids).await
        }
        Command::Backlog {
            limit,
            concurrency,
            dry_run,
            timeout,
        } => {
            let timeout = timeout.map(|t| {
                periodic::parse_offset(&t).unwrap_or_else(|| {
                    tracing::error!(timeout = %t, "timeout not in the form HH:MM:SS");
                    std::process::exit(2);
                })
            });
            let shutdown = shutdown_signal(timeout);
            Arc::clone(&etl)
                .backlog(
                    BacklogOptions {
                        limit,
                        dry_run,
                        concurrency,
                    },
                    shutdown,
                )
                .await
        }
        Command::Delete { days, yes } => {
            let days: Vec<Day> = days.iter().map(|d| parse_or_exit(d, "day")).collect();
            etl.delete_days(&days, !yes).await
        }
        Command::Periodic { intervals } => {
            let intervals: Vec<Interval> = intervals
                .iter()
                .map(|i| parse_or_exit(i, "interval"))
                .collect();
            let shutdown = shutdown_signal(None);
            periodic::run(etl, &intervals, shutdown).await;
            Ok::<(), PipelineError>(())
        }
    };

    if let Err(err) = result {
        tracing::error!(%err, "command failed");
        std::process::exit(1);
    }
}

/// A shutdown flag tripped by Ctrl-C, and optionally by a wall-time budget.
fn shutdown_signal(timeout: Option<chrono::Duration>) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let budget = async {
            match timeout.and_then(|t| t.to_std().ok()) {
                Some(budget) => tokio::time::sleep(budget).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, letting in-flight work drain");
            }
            _ = budget => {
                tracing::info!("time budget exhausted, letting in-flight work drain");
            }
        }
        let _ = tx.send(true);
    });
    rx
}

fn parse_or_exit<T: FromStr>(s: &str, what: &str) -> T
where
    T::Err: std::fmt::Display,
{
    s.parse().unwrap_or_else(|err| {
        tracing::error!(%err, "invalid {}", what);
        std::process::exit(2);
    })
}
