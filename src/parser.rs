//! Pure functions turning upstream responses into canonical OHLCV rows
//! (C3, spec.md §4.3). No I/O; ground truth is `data_parser.py`'s
//! `OHLCVDataParser`, including the Open-Question-preserved
//! `_validate_ohlc` flat-bar quirk (see [`crate::domain::OhlcvBar::validate_ohlc`]).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::{Id, OhlcvBar, Price, Timeframe, Volume};
use crate::error::ParseError;
use crate::upstream::types::{EodResponse, HistoricalResponse};

fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

/// Walks the parallel arrays in `response` in order, drops duplicate
/// dates (first-wins), validates each candidate bar, and emits
/// canonical daily rows (spec.md §4.3).
pub fn parse_historical(
    instrument_id: Id,
    response: &HistoricalResponse,
    source: &str,
) -> Result<Vec<OhlcvBar>, ParseError> {
    let lengths = response.array_lengths();
    if lengths.iter().any(|&l| l != lengths[0]) {
        return Err(ParseError::InconsistentArrayLengths(lengths.to_vec()));
    }

    let now = Utc::now();
    let mut rows = Vec::with_capacity(response.timestamp.len());
    let mut seen_dates: HashSet<NaiveDate> = HashSet::new();

    for i in 0..response.timestamp.len() {
        let epoch = response.timestamp[i];
        let timestamp = Utc
            .timestamp_opt(epoch, 0)
            .single()
            .ok_or(ParseError::BadTimestamp(epoch))?;
        let date_key = timestamp.date_naive();

        if !seen_dates.insert(date_key) {
            continue;
        }

        let open = decimal_from_f64(response.open[i]);
        let high = decimal_from_f64(response.high[i]);
        let low = decimal_from_f64(response.low[i]);
        let close = decimal_from_f64(response.close[i]);
        let volume = response.volume[i];

        if let Err(e) = OhlcvBar::validate_ohlc(open, high, low, close) {
            warn!(instrument_id = %instrument_id, date = %date_key, error = %e, "dropping invalid OHLC bar");
            continue;
        }
        if let Err(e) = OhlcvBar::validate_volume(volume) {
            warn!(instrument_id = %instrument_id, date = %date_key, error = %e, "dropping bar with invalid volume");
            continue;
        }

        rows.push(OhlcvBar {
            instrument_id,
            timestamp,
            timeframe: Timeframe::Daily,
            open: Price(open),
            high: Price(high),
            low: Price(low),
            close: Price(close),
            adjusted_close: None,
            volume: Volume(volume),
            source: source.to_string(),
            quality_score: 1.0,
            created_at: now,
        });
    }

    Ok(rows)
}

/// For each `(segment, external_id)` entry in `response`, looks up the
/// matching instrument id, skips unknown ids, skips all-zero OHLC
/// (market closed), validates invariants, and stamps `timestamp` at
/// today 00:00 in `market_tz` (spec.md §4.3; the "today 00:00 UTC"
/// quirk in one original code path is intentionally not carried here —
/// see spec.md §9).
pub fn parse_eod(
    response: &EodResponse,
    external_id_to_instrument: &HashMap<String, Id>,
    source: &str,
    market_tz: Tz,
) -> Vec<OhlcvBar> {
    let now = Utc::now();
    let today_market_midnight = market_tz
        .from_local_datetime(
            &Utc::now()
                .with_timezone(&market_tz)
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always a valid time"),
        )
        .single()
        .expect("midnight is not ambiguous under a fixed-offset zone");
    let timestamp: DateTime<Utc> = today_market_midnight.with_timezone(&Utc);

    let mut rows = Vec::new();

    for (segment, quotes) in &response.data {
        for (external_id, quote) in quotes {
            let Some(&instrument_id) = external_id_to_instrument.get(external_id) else {
                warn!(segment, external_id, "no instrument mapping for EOD quote, skipping");
                continue;
            };

            let open = decimal_from_f64(quote.ohlc.open);
            let high = decimal_from_f64(quote.ohlc.high);
            let low = decimal_from_f64(quote.ohlc.low);
            let close = decimal_from_f64(quote.ohlc.close);

            if open.is_zero() && high.is_zero() && low.is_zero() && close.is_zero() {
                continue;
            }

            if let Err(e) = OhlcvBar::validate_ohlc(open, high, low, close) {
                warn!(instrument_id = %instrument_id, error = %e, "dropping invalid EOD OHLC bar");
                continue;
            }
            if let Err(e) = OhlcvBar::validate_volume(quote.volume) {
                warn!(instrument_id = %instrument_id, error = %e, "dropping EOD bar with invalid volume");
                continue;
            }

            rows.push(OhlcvBar {
                instrument_id,
                timestamp,
                timeframe: Timeframe::Daily,
                open: Price(open),
                high: Price(high),
                low: Price(low),
                close: Price(close),
                adjusted_close: None,
                volume: Volume(quote.volume),
                source: source.to_string(),
                quality_score: 1.0,
                created_at: now,
            });
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::types::{EodQuote, Ohlc};

    fn historical(open: Vec<f64>, high: Vec<f64>, low: Vec<f64>, close: Vec<f64>, volume: Vec<i64>, timestamp: Vec<i64>) -> HistoricalResponse {
        HistoricalResponse { open, high, low, close, volume, timestamp }
    }

    #[test]
    fn rejects_inconsistent_array_lengths() {
        let resp = historical(vec![1.0, 2.0], vec![1.0], vec![1.0], vec![1.0], vec![1], vec![1]);
        let err = parse_historical(Id::new_v4(), &resp, "dhan_api").unwrap_err();
        assert!(matches!(err, ParseError::InconsistentArrayLengths(_)));
    }

    #[test]
    fn deduplicates_same_date_first_wins() {
        let epoch = 1_700_000_000i64;
        let resp = historical(
            vec![100.0, 999.0],
            vec![101.0, 999.0],
            vec![99.0, 999.0],
            vec![100.5, 999.0],
            vec![1000, 2000],
            vec![epoch, epoch + 10], // same UTC date
        );
        let rows = parse_historical(Id::new_v4(), &resp, "dhan_api").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].open.0, decimal_from_f64(100.0));
    }

    #[test]
    fn drops_invalid_ohlc_rows() {
        let epoch = 1_700_000_000i64;
        let resp = historical(
            vec![10.0],
            vec![9.0], // high < open: invalid
            vec![8.0],
            vec![9.5],
            vec![100],
            vec![epoch],
        );
        let rows = parse_historical(Id::new_v4(), &resp, "dhan_api").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn eod_skips_unknown_external_id_and_all_zero_quotes() {
        let mut data = HashMap::new();
        let mut segment = HashMap::new();
        segment.insert(
            "2885".to_string(),
            EodQuote { ohlc: Ohlc { open: 0.0, close: 0.0, high: 0.0, low: 0.0 }, volume: 0 },
        );
        segment.insert(
            "9999".to_string(), // unknown
            EodQuote { ohlc: Ohlc { open: 10.0, close: 11.0, high: 12.0, low: 9.0 }, volume: 500 },
        );
        data.insert("NSE_EQ".to_string(), segment);
        let response = EodResponse { data };

        let mapping = HashMap::new(); // empty: neither id maps
        let rows = parse_eod(&response, &mapping, "dhan_api", chrono_tz::Asia::Kolkata);
        assert!(rows.is_empty());
    }

    #[test]
    fn eod_emits_row_for_known_mapped_security() {
        let mut data = HashMap::new();
        let mut segment = HashMap::new();
        segment.insert(
            "2885".to_string(),
            EodQuote { ohlc: Ohlc { open: 100.0, close: 102.0, high: 103.0, low: 99.0 }, volume: 1500 },
        );
        data.insert("NSE_EQ".to_string(), segment);
        let response = EodResponse { data };

        let instrument_id = Id::new_v4();
        let mut mapping = HashMap::new();
        mapping.insert("2885".to_string(), instrument_id);

        let rows = parse_eod(&response, &mapping, "dhan_api", chrono_tz::Asia::Kolkata);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instrument_id, instrument_id);
        assert_eq!(rows[0].volume.0, 1500);
    }
}
