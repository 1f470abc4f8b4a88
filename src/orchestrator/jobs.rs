//! The job function registry's bodies (spec.md §9 "register
//! `task_type → func(ctx, params) -> result` in a static map"). Each
//! function here drives one of C6-C9 explicitly through a
//! [`TaskContext`] rather than a method on an inherited base task.

use std::pin::Pin;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::Future;
use serde_json::{json, Value};

use crate::db;
use crate::domain::{FetchOperation, Timeframe};
use crate::error::OrchestratorError;
use crate::orchestrator::context::{CancelBridge, ProgressBridge};
use crate::orchestrator::{JobResources, TaskContext};
use crate::{aggregator, catalog, fetcher, sector};
use crate::domain::TaskStatus;
use crate::IngestResult;

pub type JobFuture = Pin<Box<dyn Future<Output = IngestResult<Value>> + Send>>;
pub type JobFn = fn(Arc<JobResources>, Arc<dyn TaskContext>, Value) -> JobFuture;

fn parse_date_param(params: &Value, key: &str) -> IngestResult<NaiveDate> {
    let raw = params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestratorError::InvalidParams(format!("missing string field '{key}'")))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| OrchestratorError::InvalidParams(format!("field '{key}' is not a date: {e}")).into())
}

/// `ohlcv_historical_backfill`: drives C6's historical path over every
/// instrument C5 reports pending (spec.md §4.6, §4.5).
pub fn historical_backfill(resources: Arc<JobResources>, ctx: Arc<dyn TaskContext>, params: Value) -> JobFuture {
    Box::pin(async move {
        let from_date = parse_date_param(&params, "from_date")?;
        let to_date = parse_date_param(&params, "to_date")?;
        if from_date > to_date {
            return Err(OrchestratorError::InvalidParams(format!(
                "from_date {from_date} is after to_date {to_date}"
            ))
            .into());
        }

        ctx.step("select_instruments", "Select target instruments", TaskStatus::Started, None)
            .await?;
        let instruments = db::progress::pending_for(&resources.pool, FetchOperation::Historical).await?;
        ctx.step(
            "select_instruments",
            "Select target instruments",
            TaskStatus::Success,
            Some(json!({ "count": instruments.len() })),
        )
        .await?;

        ctx.step("fetch_and_store", "Fetch and store historical bars", TaskStatus::Started, None)
            .await?;

        let progress_sink = ProgressBridge::new(Arc::clone(&ctx));
        let cancel = CancelBridge(Arc::clone(&ctx));

        let result = fetcher::run_historical_backfill(
            &resources.pool,
            resources.upstream.as_ref(),
            &resources.limiter,
            &instruments,
            from_date,
            to_date,
            resources.settings.ohlcv_chunk_size,
            resources.settings.ohlcv_bulk_insert_size,
            &progress_sink,
            &cancel,
        )
        .await?;

        let step_status = if result.was_cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Success
        };
        ctx.step(
            "fetch_and_store",
            "Fetch and store historical bars",
            step_status,
            Some(json!({
                "processed": result.processed,
                "successful": result.successful,
                "failed": result.failed,
                "records_inserted": result.records_inserted,
            })),
        )
        .await?;

        Ok(json!({
            "processed": result.processed,
            "successful": result.successful,
            "failed": result.failed,
            "records_inserted": result.records_inserted,
            "instruments_per_second": result.instruments_per_second(),
            "rows_per_second": result.rows_per_second(),
            "cancelled": result.was_cancelled,
        }))
    })
}

/// `ohlcv_daily_eod`: drives C6's single-call EOD path over every
/// instrument C5 reports pending for `daily` (spec.md §4.6, §4.5).
pub fn daily_eod(resources: Arc<JobResources>, ctx: Arc<dyn TaskContext>, _params: Value) -> JobFuture {
    Box::pin(async move {
        ctx.step("select_instruments", "Select target instruments", TaskStatus::Started, None)
            .await?;
        let instruments = db::progress::pending_for(&resources.pool, FetchOperation::Daily).await?;
        ctx.step(
            "select_instruments",
            "Select target instruments",
            TaskStatus::Success,
            Some(json!({ "count": instruments.len() })),
        )
        .await?;

        ctx.step("fetch_and_store", "Fetch and store today's EOD bars", TaskStatus::Started, None)
            .await?;
        let progress_sink = ProgressBridge::new(Arc::clone(&ctx));

        let result = fetcher::run_daily_eod(
            &resources.pool,
            resources.upstream.as_ref(),
            &resources.limiter,
            &instruments,
            resources.settings.ohlcv_bulk_insert_size,
            resources.settings.market_tz,
            &progress_sink,
        )
        .await?;

        ctx.step(
            "fetch_and_store",
            "Fetch and store today's EOD bars",
            TaskStatus::Success,
            Some(json!({
                "processed": result.processed,
                "successful": result.successful,
                "records_inserted": result.records_inserted,
            })),
        )
        .await?;

        Ok(json!({
            "processed": result.processed,
            "successful": result.successful,
            "failed": result.failed,
            "records_inserted": result.records_inserted,
        }))
    })
}

/// `weekly_aggregation`: rebuilds `timeframe=weekly` over the last
/// `weeks_back` weeks for every active STOCK/INDEX instrument (spec.md
/// §4.7).
pub fn weekly_aggregation(resources: Arc<JobResources>, ctx: Arc<dyn TaskContext>, params: Value) -> JobFuture {
    Box::pin(async move {
        let weeks_back = params.get("weeks_back").and_then(Value::as_i64).unwrap_or(52);

        ctx.step("select_instruments", "Select target instruments", TaskStatus::Started, None)
            .await?;
        let instruments = db::instruments::ohlcv_targets(&resources.pool).await?;
        ctx.step(
            "select_instruments",
            "Select target instruments",
            TaskStatus::Success,
            Some(json!({ "count": instruments.len() })),
        )
        .await?;

        ctx.step("aggregate", "Rebuild weekly bars", TaskStatus::Started, None).await?;
        let progress_sink = ProgressBridge::new(Arc::clone(&ctx));

        let rows_written = aggregator::run(
            &resources.pool,
            &instruments,
            weeks_back,
            resources.settings.weekly_batch_size,
            resources.settings.weekly_max_workers,
            resources.settings.ohlcv_bulk_insert_size,
            &progress_sink,
        )
        .await?;

        ctx.step(
            "aggregate",
            "Rebuild weekly bars",
            TaskStatus::Success,
            Some(json!({ "rows_written": rows_written })),
        )
        .await?;

        Ok(json!({
            "instruments": instruments.len(),
            "rows_written": rows_written,
            "timeframe": Timeframe::Weekly.to_string(),
        }))
    })
}

/// `catalog_import`: runs C8's full master-import sweep — import,
/// expire, roll up derivatives eligibility (spec.md §4.8).
pub fn catalog_import(resources: Arc<JobResources>, ctx: Arc<dyn TaskContext>, _params: Value) -> JobFuture {
    Box::pin(async move {
        ctx.step("import_master", "Import security master", TaskStatus::Started, None)
            .await?;
        let summary = catalog::import_from_master(&resources.pool, resources.upstream.as_ref()).await?;
        ctx.step(
            "import_master",
            "Import security master",
            TaskStatus::Success,
            Some(json!({
                "total_rows_seen": summary.total_rows_seen,
                "securities_imported": summary.securities_imported,
                "derivatives_imported": summary.derivatives_imported,
                "skipped": summary.skipped,
            })),
        )
        .await?;
        ctx.progress(50, 100, "security master imported").await?;

        ctx.step("expire_futures", "Mark expired futures inactive", TaskStatus::Started, None)
            .await?;
        let today = chrono::Utc::now().with_timezone(&resources.settings.market_tz).date_naive();
        let expired = catalog::mark_expired_inactive(&resources.pool, today).await?;
        ctx.step(
            "expire_futures",
            "Mark expired futures inactive",
            TaskStatus::Success,
            Some(json!({ "expired": expired })),
        )
        .await?;
        ctx.progress(75, 100, "expired futures marked inactive").await?;

        ctx.step(
            "derivatives_eligibility",
            "Roll up derivatives eligibility",
            TaskStatus::Started,
            None,
        )
        .await?;
        let updated = catalog::update_derivatives_eligibility(&resources.pool).await?;
        ctx.step(
            "derivatives_eligibility",
            "Roll up derivatives eligibility",
            TaskStatus::Success,
            Some(json!({ "underlyings_updated": updated })),
        )
        .await?;
        ctx.progress(100, 100, "catalog import complete").await?;

        Ok(json!({
            "total_rows_seen": summary.total_rows_seen,
            "securities_imported": summary.securities_imported,
            "derivatives_imported": summary.derivatives_imported,
            "skipped": summary.skipped,
            "futures_expired": expired,
            "underlyings_updated": updated,
        }))
    })
}

/// `sector_enrichment`: runs C9 across every active exchange (spec.md
/// §4.9).
pub fn sector_enrichment(resources: Arc<JobResources>, ctx: Arc<dyn TaskContext>, params: Value) -> JobFuture {
    Box::pin(async move {
        let force_refresh = params.get("force_refresh").and_then(Value::as_bool).unwrap_or(false);

        ctx.step("enrich_sectors", "Enrich sector/industry by ISIN", TaskStatus::Started, None)
            .await?;
        let summary = sector::run(&resources.pool, resources.upstream.as_ref(), force_refresh, 3).await?;
        ctx.step(
            "enrich_sectors",
            "Enrich sector/industry by ISIN",
            TaskStatus::Success,
            Some(json!({
                "exchanges_processed": summary.exchanges_processed,
                "candidates": summary.candidates,
                "updated": summary.updated,
            })),
        )
        .await?;
        ctx.progress(100, 100, "sector enrichment complete").await?;

        Ok(json!({
            "exchanges_processed": summary.exchanges_processed,
            "candidates": summary.candidates,
            "updated": summary.updated,
        }))
    })
}
