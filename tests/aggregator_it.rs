//! Integration coverage for C7 (`aggregator.rs`): seeds daily bars
//! directly, runs the weekly rebuild against a real Postgres instance,
//! and checks the resulting `timeframe=weekly` rows.

mod common;

use chrono::{TimeZone, Utc};
use quantpulse_ingest::aggregator;
use quantpulse_ingest::db;
use quantpulse_ingest::domain::{OhlcvBar, Price, SecurityType, Segment, Timeframe, Volume};

fn daily_bar(instrument_id: quantpulse_ingest::domain::Id, day: (i32, u32, u32), close: f64) -> OhlcvBar {
    let date = chrono::NaiveDate::from_ymd_opt(day.0, day.1, day.2).unwrap();
    OhlcvBar {
        instrument_id,
        timestamp: Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()),
        timeframe: Timeframe::Daily,
        open: Price(rust_decimal::Decimal::try_from(close - 1.0).unwrap()),
        high: Price(rust_decimal::Decimal::try_from(close + 2.0).unwrap()),
        low: Price(rust_decimal::Decimal::try_from(close - 2.0).unwrap()),
        close: Price(rust_decimal::Decimal::try_from(close).unwrap()),
        adjusted_close: None,
        volume: Volume(1000),
        source: "test".to_string(),
        quality_score: 1.0,
        created_at: Utc::now(),
    }
}

fn noop_progress(_pct: u8, _msg: &str) {}

#[tokio::test]
async fn rebuilds_weekly_bars_from_daily_bars() {
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

    let daily_bars = vec![
        daily_bar(instrument.id, (2026, 1, 5), 100.0), // Monday
        daily_bar(instrument.id, (2026, 1, 6), 105.0),
        daily_bar(instrument.id, (2026, 1, 7), 98.0),
    ];
    db::ohlcv::bulk_upsert(&pool, &daily_bars, 1_000).await.unwrap();

    let rows_written = aggregator::run(&pool, std::slice::from_ref(&instrument), 52, 100, 2, 1_000, &noop_progress)
        .await
        .expect("aggregation should succeed");
    assert_eq!(rows_written, 1);

    let weekly = db::ohlcv::range(
        &pool,
        instrument.id,
        chrono::DateTime::from_timestamp(0, 0).unwrap(),
        Utc::now(),
        Timeframe::Weekly,
        10,
    )
    .await
    .unwrap();
    assert_eq!(weekly.len(), 1);
    assert_eq!(weekly[0].open.0, daily_bars[0].open.0);
    assert_eq!(weekly[0].close.0, daily_bars[2].close.0);
}
