//! `ingestctl`: operator CLI over the ingestion core (spec.md §9's
//! "outer surface" is explicitly a Non-goal for the HTTP/worker-queue
//! layer, but a thin local CLI to drive and inspect runs is the
//! smallest faithful stand-in, grounded on the teacher's logging setup
//! in `examples/logging.rs` and this crate's own `orchestrator`).

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use quantpulse_ingest::db;
use quantpulse_ingest::domain::{Id, TaskRun};
use quantpulse_ingest::orchestrator::{JobResources, TaskOrchestrator};
use quantpulse_ingest::rate_limiter::RateLimiter;
use quantpulse_ingest::upstream::{ReqwestUpstreamClient, UpstreamClient};
use quantpulse_ingest::Settings;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use time::macros::format_description;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ingestctl", about = "Operate the market-data ingestion core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check connectivity to the upstream broker API.
    Ping,
    /// Import/refresh the instrument catalog from the security master.
    CatalogImport,
    /// Backfill historical OHLCV bars over a date range.
    Backfill {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Fetch today's end-of-day OHLCV bars.
    Eod,
    /// Rebuild weekly OHLCV bars from daily bars.
    WeeklyAggregate {
        #[arg(long, default_value_t = 52)]
        weeks_back: i64,
    },
    /// Backfill sector/industry metadata by ISIN.
    SectorEnrich {
        #[arg(long)]
        force_refresh: bool,
    },
    /// Print a previously submitted task run as JSON.
    Inspect {
        task_run_id: Id,
    },
    /// Request cancellation of a running task.
    Cancel {
        task_run_id: Id,
    },
    /// Submit a new run of a previously failed/cancelled task.
    Retry {
        task_run_id: Id,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_tracing()?;

    let cli = Cli::parse();
    let settings = Settings::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.db_url)
        .await
        .context("failed to connect to the ingestion database")?;

    let upstream: Box<dyn UpstreamClient> = Box::new(ReqwestUpstreamClient::new(
        &settings.upstream_access_token,
        &settings.upstream_client_id,
        &settings.upstream_historical_url,
        &settings.upstream_eod_url,
        &settings.upstream_master_url,
        &settings.upstream_sector_url,
    )?);

    let shared_state = quantpulse_ingest::rate_limiter::RedisSharedState::connect(&settings.shared_state_url)
        .await
        .context("failed to connect to the distributed rate limiter's shared state")?;
    let limiter = RateLimiter::new(Arc::new(shared_state), settings.rate_limit_rps);

    let resources = Arc::new(JobResources {
        pool,
        upstream,
        limiter,
        settings,
    });
    let orchestrator = TaskOrchestrator::new(Arc::clone(&resources));

    match cli.command {
        Command::Ping => {
            let ok = resources.upstream.ping().await?;
            println!("{}", json!({ "reachable": ok }));
        }
        Command::CatalogImport => {
            let run = orchestrator
                .submit("catalog_import", "catalog_import", "Import security master", json!({}), None)
                .await?;
            let finished = run_with_progress(&orchestrator, &resources.pool, run.id).await?;
            print_run(&finished);
        }
        Command::Backfill { from, to } => {
            let run = orchestrator
                .submit(
                    "ohlcv_historical_backfill",
                    "ohlcv_historical_backfill",
                    "Historical OHLCV backfill",
                    json!({ "from_date": from, "to_date": to }),
                    None,
                )
                .await?;
            let finished = run_with_progress(&orchestrator, &resources.pool, run.id).await?;
            print_run(&finished);
        }
        Command::Eod => {
            let run = orchestrator
                .submit("ohlcv_daily_eod", "ohlcv_daily_eod", "Daily EOD OHLCV fetch", json!({}), None)
                .await?;
            let finished = run_with_progress(&orchestrator, &resources.pool, run.id).await?;
            print_run(&finished);
        }
        Command::WeeklyAggregate { weeks_back } => {
            let run = orchestrator
                .submit(
                    "weekly_aggregation",
                    "weekly_aggregation",
                    "Weekly OHLCV aggregation",
                    json!({ "weeks_back": weeks_back }),
                    None,
                )
                .await?;
            let finished = run_with_progress(&orchestrator, &resources.pool, run.id).await?;
            print_run(&finished);
        }
        Command::SectorEnrich { force_refresh } => {
            let run = orchestrator
                .submit(
                    "sector_enrichment",
                    "sector_enrichment",
                    "Sector/industry enrichment",
                    json!({ "force_refresh": force_refresh }),
                    None,
                )
                .await?;
            let finished = run_with_progress(&orchestrator, &resources.pool, run.id).await?;
            print_run(&finished);
        }
        Command::Inspect { task_run_id } => {
            let run = db::tasks::find(&resources.pool, task_run_id)
                .await?
                .context("task run not found")?;
            print_run(&run);
        }
        Command::Cancel { task_run_id } => {
            orchestrator.request_cancel(task_run_id).await?;
            println!("{}", json!({ "task_run_id": task_run_id, "status": "cancel requested" }));
        }
        Command::Retry { task_run_id } => {
            let retry = orchestrator.retry(task_run_id).await?;
            print_run(&retry);
        }
    }

    Ok(())
}

/// Runs a submitted task to completion while mirroring its
/// `progress_percentage` onto a terminal progress bar, polled at a
/// fixed interval from a side task (no direct line to the running
/// job's progress callbacks from here, so this reads the same
/// `task_runs` row the job itself writes through).
async fn run_with_progress(
    orchestrator: &TaskOrchestrator,
    pool: &PgPool,
    task_run_id: Id,
) -> Result<TaskRun> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
            .context("invalid progress bar template")?
            .progress_chars("=>-"),
    );

    let pool = pool.clone();
    let poll_bar = bar.clone();
    let poller = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            ticker.tick().await;
            if let Ok(Some(run)) = db::tasks::find(&pool, task_run_id).await {
                poll_bar.set_position(run.progress_percentage as u64);
                if let Some(message) = run.current_message {
                    poll_bar.set_message(message);
                }
                if run.status.is_terminal() {
                    break;
                }
            }
        }
    });

    let result = orchestrator.run(task_run_id).await;
    poller.abort();
    bar.finish_and_clear();
    Ok(result?)
}

fn print_run(run: &quantpulse_ingest::domain::TaskRun) {
    println!(
        "{}",
        json!({
            "id": run.id,
            "task_type": run.task_type,
            "status": run.status.to_string(),
            "progress_percentage": run.progress_percentage,
            "result_data": run.result_data,
            "error_message": run.error_message,
            "error_category": run.error_category,
        })
    );
}

fn init_tracing() -> Result<Option<WorkerGuard>> {
    let app_name = "ingestctl";
    let in_container = std::env::var("CONTAINER").is_ok() || Path::new("/.dockerenv").exists();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if in_container {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .init();
        info!("logging to stdout (container mode)");
        return Ok(None);
    }

    let log_dir = dirs::state_dir()
        .map(|mut p| {
            p.push(app_name);
            p.push("logs");
            p
        })
        .unwrap_or_else(|| {
            let mut home = dirs::home_dir().expect("failed to find home directory");
            home.push(format!(".local/state/{app_name}/logs"));
            home
        });
    fs::create_dir_all(&log_dir)?;

    let timestamp = time::OffsetDateTime::now_utc()
        .format(&format_description!("[year][month][day]-[hour][minute][second]"))
        .context("failed to format log file timestamp")?;
    let file_path = log_dir.join(format!("{app_name}-{timestamp}.log"));
    let file_appender = tracing_appender::rolling::never(&log_dir, file_path.file_name().unwrap());
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    info!(log_file = %file_path.display(), "logging to file (local mode)");
    Ok(Some(guard))
}
