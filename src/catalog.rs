//! Instrument catalog service (C8, spec.md §4.8): imports and
//! maintains the `exchanges`/`instruments`/`futures` tables from the
//! upstream security master.

use std::collections::HashMap;

use chrono::NaiveDate;
use itertools::Itertools;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db;
use crate::domain::{
    ContractMonth, Exchange, Future, Instrument, SecurityType, Segment, SettlementType,
};
use crate::error::CatalogError;
use crate::upstream::types::MasterRow;
use crate::upstream::UpstreamClient;
use crate::IngestResult;

/// Instrument kinds accepted from the master (spec.md §4.8).
const ACCEPTED_INSTRUMENT_TYPES: &[&str] = &["EQUITY", "INDEX", "FUTSTK", "FUTIDX"];

/// Known index aliases between the underlying's master symbol and its
/// futures-contract underlying symbol (spec.md §4.8,
/// `securities_import_helpers.py`'s symbol-derivation intent).
const UNDERLYING_ALIASES: &[(&str, &str)] = &[("NIFTY", "NIFTY 50"), ("BANKNIFTY", "BANK NIFTY")];

pub async fn ensure_exchange(
    pool: &PgPool,
    code: &str,
    name: &str,
    country: &str,
    timezone: &str,
    currency: &str,
    trading_hours_start: chrono::NaiveTime,
    trading_hours_end: chrono::NaiveTime,
) -> IngestResult<Exchange> {
    Ok(db::instruments::ensure_exchange(
        pool,
        code,
        name,
        country,
        timezone,
        currency,
        trading_hours_start,
        trading_hours_end,
    )
    .await?)
}

fn validate_row(row: &MasterRow) -> Result<i32, CatalogError> {
    if row.security_id.trim().is_empty() {
        return Err(CatalogError::MissingField { field: "SECURITY_ID" });
    }
    if row.symbol_name.trim().is_empty() {
        return Err(CatalogError::MissingField { field: "SYMBOL_NAME" });
    }
    if row.exch_id.trim().is_empty() {
        return Err(CatalogError::MissingField { field: "EXCH_ID" });
    }
    row.security_id
        .trim()
        .parse::<i32>()
        .map_err(|_| CatalogError::NonNumericExternalId(row.security_id.clone()))
}

fn map_security_type(instrument_type: &str) -> Option<SecurityType> {
    match instrument_type {
        "EQUITY" => Some(SecurityType::Stock),
        "INDEX" => Some(SecurityType::Index),
        "FUTSTK" | "FUTIDX" => Some(SecurityType::Derivative),
        _ => None,
    }
}

fn map_segment(security_type: SecurityType) -> Segment {
    match security_type {
        SecurityType::Stock => Segment::Equity,
        SecurityType::Index => Segment::Index,
        SecurityType::Derivative => Segment::Derivative,
        SecurityType::Etf => Segment::Equity,
        SecurityType::Bond => Segment::Equity,
    }
}

/// `ImportFromMaster` (C8.2, spec.md §4.8): fetches the tabular
/// security master, filters to supported exchanges/instrument kinds,
/// validates and transforms each row, bulk-upserts securities, then
/// processes the derivative rows as a `Future` batch and rolls up
/// `has_futures`/`has_options` onto their underlyings.
pub async fn import_from_master(
    pool: &PgPool,
    upstream: &dyn UpstreamClient,
) -> IngestResult<ImportSummary> {
    let rows = upstream.fetch_master().await?;
    let total_rows_seen = rows.len();
    info!(total = total_rows_seen, "fetched security master");

    let mut exchange_ids: HashMap<String, uuid::Uuid> = HashMap::new();
    let mut securities: Vec<(Instrument, MasterRow)> = Vec::new();
    let mut derivative_rows: Vec<MasterRow> = Vec::new();
    let mut skipped = 0usize;

    for row in rows {
        if !Exchange::is_supported_code(&row.exch_id) {
            skipped += 1;
            continue;
        }
        if !ACCEPTED_INSTRUMENT_TYPES.contains(&row.instrument_type.as_deref().unwrap_or("")) {
            skipped += 1;
            continue;
        }

        let external_id = match validate_row(&row) {
            Ok(id) => id,
            Err(e) => {
                warn!(security_id = %row.security_id, error = %e, "skipping invalid master row");
                skipped += 1;
                continue;
            }
        };

        let Some(security_type) = map_security_type(row.instrument_type.as_deref().unwrap_or(""))
        else {
            skipped += 1;
            continue;
        };

        if security_type == SecurityType::Derivative {
            derivative_rows.push(row);
            continue;
        }

        let exchange_id = if let Some(&id) = exchange_ids.get(&row.exch_id) {
            id
        } else {
            let exchange = db::instruments::ensure_exchange(
                pool,
                &row.exch_id,
                &row.exch_id,
                "IN",
                "Asia/Kolkata",
                "INR",
                chrono::NaiveTime::from_hms_opt(9, 15, 0).expect("valid time"),
                chrono::NaiveTime::from_hms_opt(15, 30, 0).expect("valid time"),
            )
            .await?;
            exchange_ids.insert(row.exch_id.clone(), exchange.id);
            exchange.id
        };

        let segment = map_segment(security_type);
        let mut instrument = Instrument::new(
            row.symbol_name.trim().to_string(),
            exchange_id,
            external_id,
            security_type,
            segment,
        );
        instrument.isin = row.isin.clone().filter(|s| !s.trim().is_empty());
        instrument.lot_size = row.lot_size.as_deref().and_then(|s| s.parse().ok());
        instrument.tick_size = row.tick_size.as_deref().and_then(|s| s.parse().ok());

        securities.push((instrument, row));
    }

    // The master file occasionally repeats a SECURITY_ID across rows
    // (observed in `original_source`'s raw exports); keep the first
    // occurrence so a flaky upstream export doesn't upsert the same
    // instrument twice in one import.
    let securities = securities
        .into_iter()
        .unique_by(|(instrument, _)| instrument.external_id)
        .collect::<Vec<_>>();

    let mut imported = 0u64;
    for (instrument, _row) in &securities {
        db::instruments::upsert_instrument(pool, instrument).await?;
        imported += 1;
    }

    let futures_result = process_futures_batch(pool, &derivative_rows).await?;

    Ok(ImportSummary {
        total_rows_seen,
        securities_imported: imported,
        derivatives_imported: futures_result.futures_created,
        skipped,
    })
}

#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub total_rows_seen: usize,
    pub securities_imported: u64,
    pub derivatives_imported: u64,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FuturesBatchResult {
    pub futures_created: u64,
    pub skipped_no_underlying: u64,
    pub underlyings_touched: u64,
}

/// Resolves a derivative row's underlying instrument: (a)
/// `UNDERLYING_SECURITY_ID` if present, (b) exact symbol match, (c)
/// known index aliases (spec.md §4.8.3).
async fn resolve_underlying(
    pool: &PgPool,
    row: &MasterRow,
    exchange_id: uuid::Uuid,
) -> Result<Option<Instrument>, CatalogError> {
    if let Some(external_id_str) = &row.underlying_security_id {
        if let Ok(external_id) = external_id_str.trim().parse::<i32>() {
            if let Some(instrument) = db::instruments::find_by_external_id(pool, external_id).await? {
                return Ok(Some(instrument));
            }
        }
    }

    let underlying_symbol = row
        .underlying_symbol
        .clone()
        .unwrap_or_else(|| row.symbol_name.clone());

    if let Some(instrument) =
        db::instruments::find_by_symbol(pool, underlying_symbol.trim(), exchange_id).await?
    {
        return Ok(Some(instrument));
    }

    for (a, b) in UNDERLYING_ALIASES {
        let alias = if underlying_symbol.trim().eq_ignore_ascii_case(a) {
            Some(*b)
        } else if underlying_symbol.trim().eq_ignore_ascii_case(b) {
            Some(*a)
        } else {
            None
        };
        if let Some(candidate) = alias {
            if let Some(instrument) = db::instruments::find_by_symbol(pool, candidate, exchange_id).await? {
                return Ok(Some(instrument));
            }
        }
    }

    Ok(None)
}

/// `ProcessFuturesBatch` (C8.3, spec.md §4.8): for each derivative row,
/// resolves the underlying, upserts the DERIVATIVE `Instrument` and its
/// `Future` row. Rows with no resolvable underlying are skipped, not
/// an error.
pub async fn process_futures_batch(
    pool: &PgPool,
    rows: &[MasterRow],
) -> IngestResult<FuturesBatchResult> {
    let mut result = FuturesBatchResult::default();
    let mut has_futures: HashMap<uuid::Uuid, bool> = HashMap::new();

    for row in rows {
        let external_id = match validate_row(row) {
            Ok(id) => id,
            Err(e) => {
                warn!(security_id = %row.security_id, error = %e, "skipping invalid futures row");
                continue;
            }
        };

        let exchange = db::instruments::ensure_exchange(
            pool,
            &row.exch_id,
            &row.exch_id,
            "IN",
            "Asia/Kolkata",
            "INR",
            chrono::NaiveTime::from_hms_opt(9, 15, 0).expect("valid time"),
            chrono::NaiveTime::from_hms_opt(15, 30, 0).expect("valid time"),
        )
        .await?;

        let Some(underlying) = resolve_underlying(pool, row, exchange.id).await? else {
            result.skipped_no_underlying += 1;
            continue;
        };

        let expiration_date = match row
            .sm_expiry_date
            .as_deref()
            .and_then(parse_expiry_date)
        {
            Some(date) => date,
            None => {
                warn!(security_id = %row.security_id, "skipping futures row with unparseable expiry date");
                continue;
            }
        };

        let mut derivative = Instrument::new(
            row.symbol_name.trim().to_string(),
            exchange.id,
            external_id,
            SecurityType::Derivative,
            Segment::Derivative,
        );
        derivative.isin = row.isin.clone().filter(|s| !s.trim().is_empty());
        derivative.lot_size = row.lot_size.as_deref().and_then(|s| s.parse().ok());
        let derivative = db::instruments::upsert_instrument(pool, &derivative).await?;

        let future = Future {
            id: uuid::Uuid::new_v4(),
            instrument_id: derivative.id,
            underlying_id: underlying.id,
            expiration_date,
            contract_month: contract_month_of(expiration_date),
            settlement_type: SettlementType::Cash,
            contract_size: 1,
            lot_size: derivative.lot_size.unwrap_or(1),
            previous_contract_id: None,
            next_contract_id: None,
            is_active: true,
        };

        db::instruments::upsert_future(pool, &future).await?;
        has_futures.insert(underlying.id, true);
        result.futures_created += 1;
    }

    // The actual `has_futures` write is `update_derivatives_eligibility`
    // (C8.5), a single DB-side sweep over all active Futures rather
    // than a per-row flag here; `has_futures` above is only used to
    // size the result summary.
    result.underlyings_touched = has_futures.len() as u64;

    Ok(result)
}

fn contract_month_of(date: NaiveDate) -> ContractMonth {
    use chrono::Datelike;
    match date.month() {
        1 => ContractMonth::Jan,
        2 => ContractMonth::Feb,
        3 => ContractMonth::Mar,
        4 => ContractMonth::Apr,
        5 => ContractMonth::May,
        6 => ContractMonth::Jun,
        7 => ContractMonth::Jul,
        8 => ContractMonth::Aug,
        9 => ContractMonth::Sep,
        10 => ContractMonth::Oct,
        11 => ContractMonth::Nov,
        _ => ContractMonth::Dec,
    }
}

fn parse_expiry_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.split_whitespace().next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// `MarkExpiredInactive` (C8.4, spec.md §4.8).
pub async fn mark_expired_inactive(pool: &PgPool, today: NaiveDate) -> IngestResult<u64> {
    Ok(db::instruments::mark_expired_inactive(pool, today).await?)
}

/// `UpdateDerivativesEligibility` (C8.5, spec.md §4.8): sets
/// `has_futures=true` on every underlying referenced by an active
/// Future (spec.md "Derivative flags rule": derivatives themselves
/// never carry these flags).
pub async fn update_derivatives_eligibility(pool: &PgPool) -> IngestResult<u64> {
    Ok(db::instruments::update_derivatives_eligibility(pool).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_month_matches_expiry_month() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 25).unwrap();
        assert_eq!(contract_month_of(date), ContractMonth::Jun);
    }

    #[test]
    fn parses_expiry_with_or_without_time_component() {
        assert_eq!(
            parse_expiry_date("2026-06-25"),
            NaiveDate::from_ymd_opt(2026, 6, 25)
        );
        assert_eq!(
            parse_expiry_date("2026-06-25 00:00:00"),
            NaiveDate::from_ymd_opt(2026, 6, 25)
        );
        assert_eq!(parse_expiry_date("garbage"), None);
    }

    #[test]
    fn validate_row_rejects_non_numeric_security_id() {
        let row = MasterRow {
            security_id: "abc".to_string(),
            underlying_symbol: None,
            symbol_name: "RELIANCE".to_string(),
            display_name: None,
            exch_id: "NSE".to_string(),
            segment: "E".to_string(),
            instrument: "EQUITY".to_string(),
            instrument_type: Some("EQUITY".to_string()),
            isin: None,
            lot_size: None,
            tick_size: None,
            sm_expiry_date: None,
            underlying_security_id: None,
            strike_price: None,
            option_type: None,
        };
        assert!(matches!(
            validate_row(&row),
            Err(CatalogError::NonNumericExternalId(_))
        ));
    }
}
