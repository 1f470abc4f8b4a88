//! Weekly aggregator (C7, spec.md §4.7). Rebuilds the `timeframe =
//! weekly` rows from `timeframe = daily`, grouping by ISO week (week
//! start = Monday).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc, Weekday};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::info;

use crate::db;
use crate::domain::{Id, Instrument, OhlcvBar, Timeframe};
use crate::fetcher::ProgressSink;
use crate::IngestResult;

/// Buckets `bars` (assumed to be `timeframe = daily`, already sorted
/// ascending by timestamp from [`db::ohlcv::range`]) into one row per
/// ISO week per spec.md §4.7's field derivation.
pub fn aggregate_to_weekly(instrument_id: Id, bars: &[OhlcvBar], source: &str) -> Vec<OhlcvBar> {
    let mut buckets: BTreeMap<NaiveDate, Vec<&OhlcvBar>> = BTreeMap::new();

    for bar in bars {
        let week_start = bar.timestamp.date_naive().week(Weekday::Mon).first_day();
        buckets.entry(week_start).or_default().push(bar);
    }

    let now = Utc::now();
    buckets
        .into_iter()
        .filter_map(|(week_start, mut week_bars)| {
            if week_bars.is_empty() {
                return None;
            }
            week_bars.sort_by_key(|b| b.timestamp);

            let open = week_bars.first()?.open;
            let close = week_bars.last()?.close;
            let high = week_bars.iter().map(|b| b.high).fold(open, |acc, h| if h.0 > acc.0 { h } else { acc });
            let low = week_bars.iter().map(|b| b.low).fold(open, |acc, l| if l.0 < acc.0 { l } else { acc });
            let volume = week_bars.iter().map(|b| b.volume).sum();

            let timestamp: DateTime<Utc> = Utc
                .from_utc_datetime(&week_start.and_hms_opt(0, 0, 0).expect("midnight is valid"));

            Some(OhlcvBar {
                instrument_id,
                timestamp,
                timeframe: Timeframe::Weekly,
                open,
                high,
                low,
                close,
                adjusted_close: None,
                volume,
                source: source.to_string(),
                quality_score: 1.0,
                created_at: now,
            })
        })
        .collect()
}

/// Rebuilds weekly bars for `instruments` (empty ⇒ caller must pass the
/// full universe; this module has no catalog dependency) over the last
/// `weeks_back` weeks, in fixed-size batches with bounded in-batch
/// concurrency (spec.md §4.7).
pub async fn run(
    pool: &PgPool,
    instruments: &[Instrument],
    weeks_back: i64,
    batch_size: usize,
    max_workers: usize,
    bulk_insert_size: usize,
    progress: &dyn ProgressSink,
) -> IngestResult<u64> {
    let to = Utc::now();
    let from = to - chrono::Duration::weeks(weeks_back.max(1));

    let total = instruments.len().max(1);
    let mut processed = 0usize;
    let mut total_written = 0u64;

    for batch in instruments.chunks(batch_size.max(1)) {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut handles = Vec::with_capacity(batch.len());

        for instrument in batch {
            let permit = Arc::clone(&semaphore);
            let pool = pool.clone();
            let instrument_id = instrument.id;

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                let daily = db::ohlcv::range(&pool, instrument_id, from, to, Timeframe::Daily, i64::MAX)
                    .await?;
                Ok::<Vec<OhlcvBar>, crate::error::StoreError>(aggregate_to_weekly(
                    instrument_id,
                    &daily,
                    "weekly_aggregator",
                ))
            }));
        }

        let mut batch_rows: Vec<OhlcvBar> = Vec::new();
        for handle in handles {
            let rows = handle
                .await
                .expect("aggregation task panicked")?;
            batch_rows.extend(rows);
        }

        total_written += db::ohlcv::bulk_upsert(pool, &batch_rows, bulk_insert_size).await?;

        processed += batch.len();
        let pct = ((processed as f64 / total as f64) * 100.0) as u8;
        progress.on_progress(pct.min(100), &format!("aggregated {processed}/{total} instruments"));
    }

    info!(instruments = instruments.len(), rows_written = total_written, "weekly aggregation finished");

    Ok(total_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Price, Volume};
    use rust_decimal_macros::dec;

    fn bar(day: &str, open: f64, high: f64, low: f64, close: f64, volume: i64) -> OhlcvBar {
        let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap();
        OhlcvBar {
            instrument_id: Id::new_v4(),
            timestamp: Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()),
            timeframe: Timeframe::Daily,
            open: Price(rust_decimal::Decimal::try_from(open).unwrap()),
            high: Price(rust_decimal::Decimal::try_from(high).unwrap()),
            low: Price(rust_decimal::Decimal::try_from(low).unwrap()),
            close: Price(rust_decimal::Decimal::try_from(close).unwrap()),
            adjusted_close: None,
            volume: Volume(volume),
            source: "test".to_string(),
            quality_score: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn aggregates_one_week_into_a_single_bar() {
        let id = Id::new_v4();
        let bars = vec![
            bar("2026-01-05", 100.0, 105.0, 99.0, 102.0, 1000), // Monday
            bar("2026-01-06", 102.0, 110.0, 101.0, 108.0, 1500),
            bar("2026-01-07", 108.0, 109.0, 95.0, 97.0, 2000), // lowest low of the week
        ];
        let mut weekly = aggregate_to_weekly(id, &bars, "weekly_aggregator");
        assert_eq!(weekly.len(), 1);
        let w = weekly.remove(0);
        assert_eq!(w.open.0, dec!(100));
        assert_eq!(w.close.0, dec!(97));
        assert_eq!(w.high.0, dec!(110));
        assert_eq!(w.low.0, dec!(95));
        assert_eq!(w.volume.0, 4500);
        assert_eq!(w.timeframe, Timeframe::Weekly);
    }

    #[test]
    fn separates_bars_spanning_two_weeks() {
        let id = Id::new_v4();
        let bars = vec![
            bar("2026-01-09", 100.0, 101.0, 99.0, 100.5, 500), // Friday, week 1
            bar("2026-01-12", 101.0, 103.0, 100.0, 102.0, 700), // Monday, week 2
        ];
        let weekly = aggregate_to_weekly(id, &bars, "weekly_aggregator");
        assert_eq!(weekly.len(), 2);
    }
}
