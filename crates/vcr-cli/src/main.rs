use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use vcr_cache::{FreshnessPolicy, SnapshotStore};
use vcr_core::RefreshRunSummary;
use vcr_sched::{Cadence, JobError, Scheduler};
use vcr_sources::FixtureSource;
use vcr_store::PgCatalogStore;
use vcr_sync::{PlatformRegistry, RefreshConfig, RefreshPipeline};

#[derive(Debug, Parser)]
#[command(name = "vcr")]
#[command(about = "VOD catalog refresher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh one platform, or every enabled platform, once.
    Refresh {
        #[arg(long)]
        platform: Option<String>,
    },
    /// Print snapshot statistics per platform.
    Stats,
    /// Clear one platform's snapshot, or all snapshots.
    Clear {
        #[arg(long)]
        platform: Option<String>,
    },
    /// Run the scheduler loop until ctrl-c.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RefreshConfig::from_env();
    let cache = SnapshotStore::new(
        config.cache_dir.clone(),
        FreshnessPolicy::with_ttl_hours(config.cache_ttl_hours),
    );

    match cli.command.unwrap_or(Commands::Refresh { platform: None }) {
        Commands::Refresh { platform } => {
            let pipeline = build_pipeline(&config, cache).await?;
            match platform {
                Some(key) => {
                    let summary = pipeline.refresh_platform(&key).await?;
                    println!(
                        "{}: cache_hit={} records={} inserted={} updated={} skipped={} failed={}",
                        summary.platform,
                        summary.cache_hit,
                        summary.record_count,
                        summary.sync.inserted,
                        summary.sync.updated,
                        summary.sync.skipped,
                        summary.sync.failed
                    );
                }
                None => {
                    let registry = load_registry(&config).await?;
                    let summary = pipeline.run_once(&registry).await;
                    print_run_summary(&summary);
                }
            }
        }
        Commands::Stats => {
            let stats = cache.stats().await?;
            if stats.is_empty() {
                println!("no snapshots stored under {}", cache.root().display());
            }
            for (platform, entry) in stats {
                println!(
                    "{platform}: {} records, captured {}",
                    entry.record_count, entry.captured_at
                );
            }
        }
        Commands::Clear { platform } => {
            cache.clear(platform.as_deref()).await?;
            match platform {
                Some(key) => println!("cleared snapshot for {key}"),
                None => println!("cleared all snapshots"),
            }
        }
        Commands::Run => {
            let pipeline = Arc::new(build_pipeline(&config, cache.clone()).await?);
            let registry = Arc::new(load_registry(&config).await?);
            let mut scheduler = build_scheduler(&config, pipeline, registry, cache)?;

            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = stop_tx.send(true);
                }
            });

            scheduler.run(stop_rx).await;
            for job in scheduler.status() {
                println!(
                    "{} ({}): last run {}, outcome {}",
                    job.name,
                    job.cadence,
                    job.last_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    job.last_outcome
                        .map(|o| o.to_string())
                        .unwrap_or_else(|| "n/a".to_string()),
                );
            }
        }
    }

    Ok(())
}

async fn build_pipeline(config: &RefreshConfig, cache: SnapshotStore) -> Result<RefreshPipeline> {
    let store = PgCatalogStore::connect(&config.database_url)
        .await
        .context("connecting to catalog database")?;
    store
        .ensure_schema()
        .await
        .context("ensuring catalog schema")?;
    Ok(RefreshPipeline::new(
        cache,
        Arc::new(FixtureSource::new(config.fixtures_dir.clone())),
        Arc::new(store),
    ))
}

async fn load_registry(config: &RefreshConfig) -> Result<PlatformRegistry> {
    PlatformRegistry::load(config.workspace_root.join("platforms.yaml")).await
}

fn build_scheduler(
    config: &RefreshConfig,
    pipeline: Arc<RefreshPipeline>,
    registry: Arc<PlatformRegistry>,
    cache: SnapshotStore,
) -> Result<Scheduler> {
    let mut scheduler = Scheduler::new(Duration::from_secs(config.tick_secs));

    let refresh_cadence = Cadence::parse("daily", Some(&config.refresh_time))
        .context("parsing VCR_REFRESH_TIME")?;
    scheduler.schedule(
        "catalog-refresh",
        refresh_cadence,
        Box::new(move || {
            let pipeline = pipeline.clone();
            let registry = registry.clone();
            Box::pin(async move {
                let summary = pipeline.run_once(&registry).await;
                refresh_job_result(&summary)
            })
        }),
    )?;

    let cleanup_cadence = Cadence::parse("weekly", Some(&config.cleanup_time))
        .context("parsing VCR_CLEANUP_TIME")?;
    let cleanup_cache = cache.clone();
    scheduler.schedule(
        "cache-cleanup",
        cleanup_cadence,
        Box::new(move || {
            let cache = cleanup_cache.clone();
            Box::pin(async move {
                cache
                    .clear(None)
                    .await
                    .map_err(|err| JobError::Message(err.to_string()))
            })
        }),
    )?;

    scheduler.schedule(
        "cache-health",
        Cadence::Hourly,
        Box::new(move || {
            let cache = cache.clone();
            Box::pin(async move {
                let stats = cache
                    .stats()
                    .await
                    .map_err(|err| JobError::Message(err.to_string()))?;
                for (platform, entry) in &stats {
                    tracing::info!(
                        platform = %platform,
                        records = entry.record_count,
                        captured_at = %entry.captured_at,
                        "snapshot health"
                    );
                }
                Ok(())
            })
        }),
    )?;

    Ok(scheduler)
}

/// A run with unreachable platforms or unreconciled records is a failed job,
/// not a silent partial success.
fn refresh_job_result(summary: &RefreshRunSummary) -> Result<(), JobError> {
    let failed_records: usize = summary.platforms.iter().map(|p| p.sync.failed).sum();
    if summary.failed_platforms.is_empty() && failed_records == 0 {
        return Ok(());
    }
    if !summary.failed_platforms.is_empty() {
        warn!(platforms = ?summary.failed_platforms, "platforms failed to refresh");
    }
    Err(JobError::Message(format!(
        "run {}: {} platform(s) failed, {} record(s) unreconciled",
        summary.run_id,
        summary.failed_platforms.len(),
        failed_records
    )))
}

fn print_run_summary(summary: &RefreshRunSummary) {
    println!(
        "run {} finished: {} platform(s), {} inserted, {} updated",
        summary.run_id,
        summary.platforms.len(),
        summary.inserted_total(),
        summary.updated_total()
    );
    for platform in &summary.platforms {
        println!(
            "  {}: cache_hit={} records={} inserted={} updated={} skipped={} failed={}",
            platform.platform,
            platform.cache_hit,
            platform.record_count,
            platform.sync.inserted,
            platform.sync.updated,
            platform.sync.skipped,
            platform.sync.failed
        );
    }
    for key in &summary.failed_platforms {
        println!("  {key}: FAILED");
    }
}
