//! Integration coverage for C10 (`orchestrator/`): drives a `TaskRun`
//! through its full lifecycle against a real Postgres instance, using
//! the static job registry exactly as `ingestctl` does.

mod common;

use std::sync::Arc;

use quantpulse_ingest::domain::TaskStatus;
use quantpulse_ingest::orchestrator::{JobResources, TaskOrchestrator};
use quantpulse_ingest::rate_limiter::{InMemorySharedState, RateLimiter};
use quantpulse_ingest::Settings;

fn resources(pool: sqlx::PgPool, upstream: common::FakeUpstreamClient) -> Arc<JobResources> {
    let mut settings = Settings::from_env();
    settings.ohlcv_chunk_size = 10;
    settings.ohlcv_bulk_insert_size = 1_000;
    settings.weekly_batch_size = 100;
    settings.weekly_max_workers = 2;

    Arc::new(JobResources {
        pool,
        upstream: Box::new(upstream),
        limiter: RateLimiter::new(Arc::new(InMemorySharedState::default()), 1_000.0),
        settings,
    })
}

#[tokio::test]
async fn catalog_import_task_runs_to_success() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let upstream = common::FakeUpstreamClient::default();
    *upstream.master.lock().unwrap() = vec![common::master_row(
        "2885",
        "RELIANCE",
        "NSE",
        "EQUITY",
        Some("INE002A01018"),
    )];

    let resources = resources(pool, upstream);
    let orchestrator = TaskOrchestrator::new(resources);

    let submitted = orchestrator
        .submit("catalog_import", "catalog_import", "Import security master", serde_json::json!({}), None)
        .await
        .expect("submit should accept a registered task_type");
    assert_eq!(submitted.status, TaskStatus::Pending);

    let finished = orchestrator.run(submitted.id).await.expect("run should complete");
    assert_eq!(finished.status, TaskStatus::Success);
    assert_eq!(finished.progress_percentage, 100);
    let result = finished.result_data.expect("success run carries a result payload");
    assert_eq!(result["securities_imported"], 1);
}

#[tokio::test]
async fn submit_rejects_unregistered_task_type() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let resources = resources(pool, common::FakeUpstreamClient::default());
    let orchestrator = TaskOrchestrator::new(resources);

    let err = orchestrator
        .submit("not_a_real_job", "bogus", "Bogus", serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not_a_real_job"));
}

#[tokio::test]
async fn retry_creates_a_new_run_linked_to_the_original() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let upstream = common::FakeUpstreamClient::default();
    *upstream.fail_historical.lock().unwrap() = false;
    let resources = resources(pool, upstream);
    let orchestrator = TaskOrchestrator::new(resources);

    let submitted = orchestrator
        .submit(
            "ohlcv_historical_backfill",
            "ohlcv_historical_backfill",
            "Historical backfill",
            serde_json::json!({ "from_date": "not-a-date", "to_date": "2026-01-05" }),
            None,
        )
        .await
        .unwrap();

    let finished = orchestrator.run(submitted.id).await;
    assert!(finished.is_err(), "an invalid date parameter should fail the run");

    let retried = orchestrator
        .retry(submitted.id)
        .await
        .expect("a failed run should be retryable");
    assert_eq!(retried.retry_of, Some(submitted.id));
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.input_parameters, submitted.input_parameters);
}
