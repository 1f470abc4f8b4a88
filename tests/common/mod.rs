//! Shared integration-test harness (§1.5): an in-memory fake upstream
//! plus a `sqlx::PgPool` pointed at whatever `DATABASE_URL` names,
//! grounded on `testkit_db_pool` in `mqk-db/src/lib.rs`. Every `*_it.rs`
//! test calls [`db_pool`] first and returns early when it's `None` so
//! the suite degrades to a no-op outside an environment with Postgres
//! reachable.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveTime;
use quantpulse_ingest::db;
use quantpulse_ingest::domain::{Exchange, Id, Instrument, SecurityType, Segment};
use quantpulse_ingest::error::UpstreamError;
use quantpulse_ingest::upstream::types::{EodResponse, HistoricalResponse, MasterRow, SectorResponse};
use quantpulse_ingest::upstream::UpstreamClient;
use sqlx::PgPool;

/// Connects using `DATABASE_URL` and applies migrations, mirroring
/// `mqk-db::testkit_db_pool`. Returns `None` (rather than panicking) when
/// the variable is unset so the suite is a no-op in environments with no
/// disposable Postgres instance.
pub async fn db_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = db::connect(&url).await.expect("failed to connect to test database");
    db::migrate(&pool).await.expect("failed to run migrations against test database");
    reset_schema(&pool).await;
    Some(pool)
}

/// Truncates every ingestion table so tests don't see each other's rows.
/// Cascades through `instruments`/`futures`/`ohlcv`/`fetch_progress` via
/// their foreign keys.
async fn reset_schema(pool: &PgPool) {
    sqlx::query(
        "TRUNCATE task_logs, task_steps, task_runs, fetch_progress, ohlcv, futures, instruments, exchanges CASCADE",
    )
    .execute(pool)
    .await
    .expect("failed to truncate test schema");
}

pub async fn seed_exchange(pool: &PgPool, code: &str) -> Exchange {
    db::instruments::ensure_exchange(
        pool,
        code,
        code,
        "IN",
        "Asia/Kolkata",
        "INR",
        NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
        NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
    )
    .await
    .expect("failed to seed exchange")
}

pub async fn seed_instrument(
    pool: &PgPool,
    exchange_id: Id,
    external_id: i32,
    symbol: &str,
    security_type: SecurityType,
    segment: Segment,
) -> Instrument {
    let instrument = Instrument::new(symbol, exchange_id, external_id, security_type, segment);
    db::instruments::upsert_instrument(pool, &instrument)
        .await
        .expect("failed to seed instrument")
}

/// Canned responses for [`UpstreamClient`], configured per test. Every
/// method not given a canned value returns a sensible empty default
/// rather than panicking, so a test only wires up what it exercises.
#[derive(Default)]
pub struct FakeUpstreamClient {
    pub historical: Mutex<Option<HistoricalResponse>>,
    pub eod: Mutex<Option<EodResponse>>,
    pub master: Mutex<Vec<MasterRow>>,
    pub sector: Mutex<HashMap<String, SectorResponse>>,
    pub fail_historical: Mutex<bool>,
}

#[async_trait]
impl UpstreamClient for FakeUpstreamClient {
    async fn fetch_historical(
        &self,
        _external_id: i32,
        _exchange_segment: &str,
        _instrument_kind: &str,
        _from_date: &str,
        _to_date: &str,
    ) -> Result<HistoricalResponse, UpstreamError> {
        if *self.fail_historical.lock().unwrap() {
            return Err(UpstreamError::Transient("fake failure".to_string()));
        }
        Ok(self.historical.lock().unwrap().clone().unwrap_or_default())
    }

    async fn fetch_today_eod(
        &self,
        _by_exchange_segment: &HashMap<String, Vec<i32>>,
    ) -> Result<EodResponse, UpstreamError> {
        Ok(self.eod.lock().unwrap().clone().unwrap_or_default())
    }

    async fn ping(&self) -> Result<bool, UpstreamError> {
        Ok(true)
    }

    async fn fetch_master(&self) -> Result<Vec<MasterRow>, UpstreamError> {
        Ok(self.master.lock().unwrap().clone())
    }

    async fn fetch_sector(
        &self,
        exchange_code: &str,
        _isins_csv_symbols: &str,
    ) -> Result<SectorResponse, UpstreamError> {
        Ok(self
            .sector
            .lock()
            .unwrap()
            .get(exchange_code)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn master_row(
    security_id: &str,
    symbol_name: &str,
    exch_id: &str,
    instrument_type: &str,
    isin: Option<&str>,
) -> MasterRow {
    MasterRow {
        security_id: security_id.to_string(),
        underlying_symbol: None,
        symbol_name: symbol_name.to_string(),
        display_name: None,
        exch_id: exch_id.to_string(),
        segment: "E".to_string(),
        instrument: instrument_type.to_string(),
        instrument_type: Some(instrument_type.to_string()),
        isin: isin.map(str::to_string),
        lot_size: None,
        tick_size: None,
        sm_expiry_date: None,
        underlying_security_id: None,
        strike_price: None,
        option_type: None,
    }
}
