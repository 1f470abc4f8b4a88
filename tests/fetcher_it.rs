//! Integration coverage for C6 (`fetcher.rs`) against a real Postgres
//! instance: seeds instruments directly, drives the chunked backfill
//! and single-call EOD paths against a fake upstream, and checks the
//! resulting `ohlcv`/`fetch_progress` rows.

mod common;

use quantpulse_ingest::domain::{FetchOperation, SecurityType, Segment, Timeframe};
use quantpulse_ingest::fetcher::{self, NeverCancel};
use quantpulse_ingest::rate_limiter::{InMemorySharedState, RateLimiter};
use quantpulse_ingest::upstream::types::{EodResponse, EodQuote, HistoricalResponse, Ohlc};
use quantpulse_ingest::db;
use std::sync::Arc;

fn limiter() -> RateLimiter {
    RateLimiter::new(Arc::new(InMemorySharedState::default()), 1_000.0)
}

fn noop_progress(_pct: u8, _msg: &str) {}

#[tokio::test]
async fn historical_backfill_writes_bars_and_marks_progress() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let exchange = common::seed_exchange(&pool, "NSE").await;
    let instrument = common::seed_instrument(
        &pool,
        exchange.id,
        2885,
        "RELIANCE",
        SecurityType::Stock,
        Segment::Equity,
    )
    .await;

    let upstream = common::FakeUpstreamClient::default();
    *upstream.historical.lock().unwrap() = Some(HistoricalResponse {
        open: vec![100.0, 101.0],
        high: vec![105.0, 106.0],
        low: vec![99.0, 100.0],
        close: vec![102.0, 103.0],
        volume: vec![1000, 1100],
        timestamp: vec![1_767_225_000, 1_767_311_400], // two consecutive trading days
    });

    let from = chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let to = chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();

    let result = fetcher::run_historical_backfill(
        &pool,
        &upstream,
        &limiter(),
        std::slice::from_ref(&instrument),
        from,
        to,
        10,
        1_000,
        &noop_progress,
        &NeverCancel,
    )
    .await
    .expect("backfill should succeed");

    assert_eq!(result.processed, 1);
    assert_eq!(result.successful, 1);
    assert_eq!(result.records_inserted, 2);

    let bars = db::ohlcv::range(
        &pool,
        instrument.id,
        chrono::DateTime::from_timestamp(0, 0).unwrap(),
        chrono::Utc::now(),
        Timeframe::Daily,
        100,
    )
    .await
    .unwrap();
    assert_eq!(bars.len(), 2);

    let pending = db::progress::pending_for(&pool, FetchOperation::Historical).await.unwrap();
    assert!(
        pending.is_empty(),
        "a successfully fetched instrument should no longer be pending"
    );
}

#[tokio::test]
async fn failed_instrument_stays_pending_for_retry() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let exchange = common::seed_exchange(&pool, "NSE").await;
    let instrument =
        common::seed_instrument(&pool, exchange.id, 3045, "SBIN", SecurityType::Stock, Segment::Equity).await;

    let upstream = common::FakeUpstreamClient::default();
    *upstream.fail_historical.lock().unwrap() = true;

    let from = chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let to = chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();

    let result = fetcher::run_historical_backfill(
        &pool,
        &upstream,
        &limiter(),
        std::slice::from_ref(&instrument),
        from,
        to,
        10,
        1_000,
        &noop_progress,
        &NeverCancel,
    )
    .await
    .expect("a per-instrument failure must not fail the whole run");

    assert_eq!(result.failed, 1);
    assert_eq!(result.records_inserted, 0);

    let pending = db::progress::pending_for(&pool, FetchOperation::Historical).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn daily_eod_groups_by_exchange_segment_and_upserts() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let exchange = common::seed_exchange(&pool, "NSE").await;
    let instrument = common::seed_instrument(
        &pool,
        exchange.id,
        2885,
        "RELIANCE",
        SecurityType::Stock,
        Segment::Equity,
    )
    .await;

    let upstream = common::FakeUpstreamClient::default();
    let mut by_id = std::collections::HashMap::new();
    by_id.insert(
        "2885".to_string(),
        EodQuote {
            ohlc: Ohlc {
                open: 100.0,
                close: 103.0,
                high: 105.0,
                low: 99.0,
            },
            volume: 5000,
        },
    );
    let mut data = std::collections::HashMap::new();
    data.insert("NSE_EQ".to_string(), by_id);
    *upstream.eod.lock().unwrap() = Some(EodResponse { data });

    let result = fetcher::run_daily_eod(
        &pool,
        &upstream,
        &limiter(),
        std::slice::from_ref(&instrument),
        1_000,
        chrono_tz::Asia::Kolkata,
        &noop_progress,
    )
    .await
    .expect("EOD fetch should succeed");

    assert_eq!(result.successful, 1);
    assert_eq!(result.records_inserted, 1);
}
