//! Integration coverage for C8 (`catalog.rs`) against a real Postgres
//! instance, grounded on the teacher's `tests/*_it.rs` layout.

mod common;

use chrono::NaiveDate;
use quantpulse_ingest::catalog;
use quantpulse_ingest::db;
use quantpulse_ingest::domain::SecurityType;

#[tokio::test]
async fn imports_equities_index_and_linked_derivative() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let upstream = common::FakeUpstreamClient::default();
    *upstream.master.lock().unwrap() = vec![
        common::master_row("2885", "RELIANCE", "NSE", "EQUITY", Some("INE002A01018")),
        common::master_row("13", "NIFTY 50", "NSE", "INDEX", None),
        {
            let mut future = common::master_row("99926000", "RELIANCE-FUT", "NSE", "FUTSTK", None);
            future.underlying_symbol = Some("RELIANCE".to_string());
            future.sm_expiry_date = Some("2026-12-31".to_string());
            future
        },
        // Unsupported exchange should be filtered out, not imported.
        common::master_row("1", "JUNK", "LSE", "EQUITY", None),
    ];

    let summary = catalog::import_from_master(&pool, &upstream)
        .await
        .expect("import should succeed");

    assert_eq!(summary.total_rows_seen, 4);
    assert_eq!(summary.securities_imported, 2);
    assert_eq!(summary.derivatives_imported, 1);
    assert_eq!(summary.skipped, 1);

    let reliance = db::instruments::find_by_external_id(&pool, 2885)
        .await
        .unwrap()
        .expect("RELIANCE should be imported");
    assert_eq!(reliance.security_type, SecurityType::Stock);
    assert!(reliance.is_ohlcv_target());

    let updated = catalog::update_derivatives_eligibility(&pool).await.unwrap();
    assert_eq!(updated, 1);
    let reliance = db::instruments::find_by_external_id(&pool, 2885).await.unwrap().unwrap();
    assert!(reliance.has_futures);

    let expired = catalog::mark_expired_inactive(&pool, NaiveDate::from_ymd_opt(2027, 1, 1).unwrap())
        .await
        .unwrap();
    assert_eq!(expired, 1, "the future expired in 2026 should be retired by 2027");
}

#[tokio::test]
async fn duplicate_security_ids_are_imported_once() {
    let Some(pool) = common::db_pool().await else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };

    let upstream = common::FakeUpstreamClient::default();
    *upstream.master.lock().unwrap() = vec![
        common::master_row("2885", "RELIANCE", "NSE", "EQUITY", Some("INE002A01018")),
        common::master_row("2885", "RELIANCE", "NSE", "EQUITY", Some("INE002A01018")),
    ];

    let summary = catalog::import_from_master(&pool, &upstream).await.unwrap();
    assert_eq!(summary.securities_imported, 1);
}
