use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::str::FromStr;

use crate::domain::{Exchange, Future, Id, Instrument, SecurityType, Segment};
use crate::error::{CatalogError, StoreError};

#[derive(sqlx::FromRow)]
struct ExchangeRow {
    id: Id,
    code: String,
    name: String,
    country: String,
    timezone: String,
    currency: String,
    trading_hours_start: NaiveTime,
    trading_hours_end: NaiveTime,
    is_active: bool,
}

impl From<ExchangeRow> for Exchange {
    fn from(r: ExchangeRow) -> Self {
        Exchange {
            id: r.id,
            code: r.code,
            name: r.name,
            country: r.country,
            timezone: r.timezone,
            currency: r.currency,
            trading_hours_start: r.trading_hours_start,
            trading_hours_end: r.trading_hours_end,
            is_active: r.is_active,
        }
    }
}

/// `EnsureExchange` (C8.1, spec.md §4.8): get-or-create by `code`.
pub async fn ensure_exchange(
    pool: &PgPool,
    code: &str,
    name: &str,
    country: &str,
    timezone: &str,
    currency: &str,
    trading_hours_start: NaiveTime,
    trading_hours_end: NaiveTime,
) -> Result<Exchange, StoreError> {
    if let Some(row) = sqlx::query_as::<_, ExchangeRow>("SELECT * FROM exchanges WHERE code = $1")
        .bind(code)
        .fetch_optional(pool)
        .await?
    {
        return Ok(row.into());
    }

    let row = sqlx::query_as::<_, ExchangeRow>(
        r#"
        INSERT INTO exchanges (id, code, name, country, timezone, currency, trading_hours_start, trading_hours_end, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
        ON CONFLICT (code) DO UPDATE SET code = EXCLUDED.code
        RETURNING *
        "#,
    )
    .bind(Id::new_v4())
    .bind(code)
    .bind(name)
    .bind(country)
    .bind(timezone)
    .bind(currency)
    .bind(trading_hours_start)
    .bind(trading_hours_end)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

/// Raw row shape shared with [`super::progress`], which needs to
/// `SELECT i.*` through a join.
#[derive(sqlx::FromRow)]
pub(crate) struct InstrumentRowPublic {
    id: Id,
    symbol: String,
    exchange_id: Id,
    external_id: i32,
    security_type: String,
    segment: String,
    isin: Option<String>,
    sector: Option<String>,
    industry: Option<String>,
    lot_size: Option<i32>,
    tick_size: Option<Decimal>,
    is_active: bool,
    is_tradeable: bool,
    is_derivatives_eligible: bool,
    has_options: bool,
    has_futures: bool,
}

impl TryFrom<InstrumentRowPublic> for Instrument {
    type Error = CatalogError;

    fn try_from(r: InstrumentRowPublic) -> Result<Self, Self::Error> {
        Ok(Instrument {
            id: r.id,
            symbol: r.symbol,
            exchange_id: r.exchange_id,
            external_id: r.external_id,
            security_type: SecurityType::from_str(&r.security_type)
                .map_err(|_| CatalogError::MissingField { field: "security_type" })?,
            segment: Segment::from_str(&r.segment)
                .map_err(|_| CatalogError::MissingField { field: "segment" })?,
            isin: r.isin,
            sector: r.sector,
            industry: r.industry,
            lot_size: r.lot_size,
            tick_size: r.tick_size,
            is_active: r.is_active,
            is_tradeable: r.is_tradeable,
            is_derivatives_eligible: r.is_derivatives_eligible,
            has_options: r.has_options,
            has_futures: r.has_futures,
        })
    }
}

/// Upserts on the business key (`symbol`, `exchange_id`); on conflict
/// against the alternative unique key (`external_id`) instead, retries
/// against that key (spec.md §4.8 "implementers must retry the upsert
/// against the alternative key if the first conflicts").
pub async fn upsert_instrument(pool: &PgPool, instrument: &Instrument) -> Result<Instrument, StoreError> {
    let by_symbol = sqlx::query_as::<_, InstrumentRowPublic>(
        r#"
        INSERT INTO instruments (
            id, symbol, exchange_id, external_id, security_type, segment,
            isin, sector, industry, lot_size, tick_size,
            is_active, is_tradeable, is_derivatives_eligible, has_options, has_futures,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, now(), now())
        ON CONFLICT (symbol, exchange_id) DO UPDATE SET
            external_id = EXCLUDED.external_id,
            security_type = EXCLUDED.security_type,
            segment = EXCLUDED.segment,
            is_active = EXCLUDED.is_active,
            updated_at = now()
        RETURNING *
        "#,
    )
    .bind(instrument.id)
    .bind(&instrument.symbol)
    .bind(instrument.exchange_id)
    .bind(instrument.external_id)
    .bind(instrument.security_type.to_string())
    .bind(instrument.segment.to_string())
    .bind(&instrument.isin)
    .bind(&instrument.sector)
    .bind(&instrument.industry)
    .bind(instrument.lot_size)
    .bind(instrument.tick_size)
    .bind(instrument.is_active)
    .bind(instrument.is_tradeable)
    .bind(instrument.is_derivatives_eligible)
    .bind(instrument.has_options)
    .bind(instrument.has_futures)
    .fetch_one(pool)
    .await;

    let row = match by_symbol {
        Ok(row) => row,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            sqlx::query_as::<_, InstrumentRowPublic>(
                r#"
                INSERT INTO instruments (
                    id, symbol, exchange_id, external_id, security_type, segment,
                    isin, sector, industry, lot_size, tick_size,
                    is_active, is_tradeable, is_derivatives_eligible, has_options, has_futures,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, now(), now())
                ON CONFLICT (external_id) DO UPDATE SET
                    symbol = EXCLUDED.symbol,
                    exchange_id = EXCLUDED.exchange_id,
                    security_type = EXCLUDED.security_type,
                    segment = EXCLUDED.segment,
                    is_active = EXCLUDED.is_active,
                    updated_at = now()
                RETURNING *
                "#,
            )
            .bind(instrument.id)
            .bind(&instrument.symbol)
            .bind(instrument.exchange_id)
            .bind(instrument.external_id)
            .bind(instrument.security_type.to_string())
            .bind(instrument.segment.to_string())
            .bind(&instrument.isin)
            .bind(&instrument.sector)
            .bind(&instrument.industry)
            .bind(instrument.lot_size)
            .bind(instrument.tick_size)
            .bind(instrument.is_active)
            .bind(instrument.is_tradeable)
            .bind(instrument.is_derivatives_eligible)
            .bind(instrument.has_options)
            .bind(instrument.has_futures)
            .fetch_one(pool)
            .await?
        }
        Err(e) => return Err(StoreError::Database(e)),
    };

    row.try_into().map_err(|e: CatalogError| StoreError::ConstraintViolation(e.to_string()))
}

pub async fn find_by_symbol(pool: &PgPool, symbol: &str, exchange_id: Id) -> Result<Option<Instrument>, StoreError> {
    let row = sqlx::query_as::<_, InstrumentRowPublic>(
        "SELECT * FROM instruments WHERE symbol = $1 AND exchange_id = $2",
    )
    .bind(symbol)
    .bind(exchange_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_into().map_err(|e: CatalogError| StoreError::ConstraintViolation(e.to_string())))
        .transpose()
}

pub async fn find_by_external_id(pool: &PgPool, external_id: i32) -> Result<Option<Instrument>, StoreError> {
    let row = sqlx::query_as::<_, InstrumentRowPublic>("SELECT * FROM instruments WHERE external_id = $1")
        .bind(external_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| r.try_into().map_err(|e: CatalogError| StoreError::ConstraintViolation(e.to_string())))
        .transpose()
}

/// Active STOCK/INDEX instruments, the OHLCV pipeline's target
/// universe (spec.md §4.5).
pub async fn ohlcv_targets(pool: &PgPool) -> Result<Vec<Instrument>, StoreError> {
    let rows = sqlx::query_as::<_, InstrumentRowPublic>(
        "SELECT * FROM instruments WHERE is_active AND security_type IN ('STOCK', 'INDEX')",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| r.try_into().map_err(|e: CatalogError| StoreError::ConstraintViolation(e.to_string())))
        .collect()
}

/// Active EQUITY instruments with a non-null ISIN eligible for sector
/// enrichment (C9, spec.md §4.9), scoped to one exchange so the caller
/// can fan out per-exchange workers. `force_refresh` drops the
/// "missing sector" filter and includes every matching equity.
pub async fn equities_needing_sector(
    pool: &PgPool,
    exchange_id: Id,
    force_refresh: bool,
) -> Result<Vec<Instrument>, StoreError> {
    let rows = if force_refresh {
        sqlx::query_as::<_, InstrumentRowPublic>(
            r#"
            SELECT * FROM instruments
            WHERE is_active AND segment = 'EQUITY' AND exchange_id = $1 AND isin IS NOT NULL
            "#,
        )
        .bind(exchange_id)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, InstrumentRowPublic>(
            r#"
            SELECT * FROM instruments
            WHERE is_active AND segment = 'EQUITY' AND exchange_id = $1
            AND isin IS NOT NULL AND sector IS NULL
            "#,
        )
        .bind(exchange_id)
        .fetch_all(pool)
        .await?
    };

    rows.into_iter()
        .map(|r| r.try_into().map_err(|e: CatalogError| StoreError::ConstraintViolation(e.to_string())))
        .collect()
}

pub async fn list_active_exchanges(pool: &PgPool) -> Result<Vec<Exchange>, StoreError> {
    let rows = sqlx::query_as::<_, ExchangeRow>("SELECT * FROM exchanges WHERE is_active")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Updates `sector`/`industry` for one instrument, matched by ISIN as
/// the stable cross-reference key (spec.md §4.9 "Match returned rows by
/// ISIN (not symbol, not name)"). A lock-free single-row `UPDATE`
/// stands in for the source's per-row lock: Postgres already
/// serializes concurrent writers to the same row.
pub async fn update_sector_by_isin(
    pool: &PgPool,
    isin: &str,
    sector: Option<&str>,
    industry: Option<&str>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE instruments SET sector = $2, industry = $3, updated_at = now()
        WHERE isin = $1
        "#,
    )
    .bind(isin)
    .bind(sector)
    .bind(industry)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[derive(sqlx::FromRow)]
struct FutureRow {
    id: Id,
    instrument_id: Id,
    underlying_id: Id,
    expiration_date: NaiveDate,
    contract_month: String,
    settlement_type: String,
    contract_size: i32,
    lot_size: i32,
    previous_contract_id: Option<Id>,
    next_contract_id: Option<Id>,
    is_active: bool,
}

impl TryFrom<FutureRow> for Future {
    type Error = CatalogError;

    fn try_from(r: FutureRow) -> Result<Self, Self::Error> {
        Ok(Future {
            id: r.id,
            instrument_id: r.instrument_id,
            underlying_id: r.underlying_id,
            expiration_date: r.expiration_date,
            contract_month: r.contract_month.parse().map_err(|_| CatalogError::MissingField { field: "contract_month" })?,
            settlement_type: r.settlement_type.parse().map_err(|_| CatalogError::MissingField { field: "settlement_type" })?,
            contract_size: r.contract_size,
            lot_size: r.lot_size,
            previous_contract_id: r.previous_contract_id,
            next_contract_id: r.next_contract_id,
            is_active: r.is_active,
        })
    }
}

/// Upserts a `Future` keyed on its natural key (spec.md §4.8.3).
pub async fn upsert_future(pool: &PgPool, future: &Future) -> Result<Future, StoreError> {
    let row = sqlx::query_as::<_, FutureRow>(
        r#"
        INSERT INTO futures (
            id, instrument_id, underlying_id, expiration_date, contract_month,
            settlement_type, contract_size, lot_size, previous_contract_id, next_contract_id, is_active
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (underlying_id, contract_month, expiration_date, settlement_type) DO UPDATE SET
            instrument_id = EXCLUDED.instrument_id,
            contract_size = EXCLUDED.contract_size,
            lot_size = EXCLUDED.lot_size,
            is_active = EXCLUDED.is_active
        RETURNING *
        "#,
    )
    .bind(future.id)
    .bind(future.instrument_id)
    .bind(future.underlying_id)
    .bind(future.expiration_date)
    .bind(future.contract_month.to_string())
    .bind(future.settlement_type.to_string())
    .bind(future.contract_size)
    .bind(future.lot_size)
    .bind(future.previous_contract_id)
    .bind(future.next_contract_id)
    .bind(future.is_active)
    .fetch_one(pool)
    .await?;

    row.try_into().map_err(|e: CatalogError| StoreError::ConstraintViolation(e.to_string()))
}

/// `MarkExpiredInactive` (C8.4, spec.md §4.8).
pub async fn mark_expired_inactive(pool: &PgPool, today: NaiveDate) -> Result<u64, StoreError> {
    let result = sqlx::query("UPDATE futures SET is_active = FALSE WHERE expiration_date < $1 AND is_active")
        .bind(today)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// `UpdateDerivativesEligibility` (C8.5, spec.md §4.8): sets
/// `has_futures=true` on every underlying referenced by an active
/// Future.
pub async fn update_derivatives_eligibility(pool: &PgPool) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE instruments SET has_futures = TRUE, updated_at = now()
        WHERE id IN (SELECT DISTINCT underlying_id FROM futures WHERE is_active)
        AND NOT has_futures
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
