use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::{Id, OhlcvBar, Price, Timeframe, Volume};
use crate::error::StoreError;

#[derive(sqlx::FromRow)]
struct OhlcvRow {
    instrument_id: Id,
    timestamp: DateTime<Utc>,
    timeframe: String,
    open: rust_decimal::Decimal,
    high: rust_decimal::Decimal,
    low: rust_decimal::Decimal,
    close: rust_decimal::Decimal,
    adjusted_close: Option<rust_decimal::Decimal>,
    volume: i64,
    source: String,
    quality_score: f32,
    created_at: DateTime<Utc>,
}

impl From<OhlcvRow> for OhlcvBar {
    fn from(r: OhlcvRow) -> Self {
        OhlcvBar {
            instrument_id: r.instrument_id,
            timestamp: r.timestamp,
            timeframe: r.timeframe.parse().unwrap_or(Timeframe::Daily),
            open: Price(r.open),
            high: Price(r.high),
            low: Price(r.low),
            close: Price(r.close),
            adjusted_close: r.adjusted_close.map(Price),
            volume: Volume(r.volume),
            source: r.source,
            quality_score: r.quality_score,
            created_at: r.created_at,
        }
    }
}

/// **BulkUpsert** (C4, spec.md §4.4). `rows` is chunked at
/// `batch_size` (default `OHLCV_BULK_INSERT_SIZE`); each chunk is one
/// multi-row `INSERT .. ON CONFLICT .. DO UPDATE` inside its own
/// transaction — partial batches are never committed halfway.
pub async fn bulk_upsert(pool: &PgPool, rows: &[OhlcvBar], batch_size: usize) -> Result<u64, StoreError> {
    let mut total = 0u64;

    for chunk in rows.chunks(batch_size.max(1)) {
        if chunk.is_empty() {
            continue;
        }

        let mut tx = pool.begin().await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ohlcv (instrument_id, \"timestamp\", timeframe, open, high, low, close, adjusted_close, volume, source, quality_score, created_at) ",
        );

        builder.push_values(chunk, |mut b, bar| {
            b.push_bind(bar.instrument_id)
                .push_bind(bar.timestamp)
                .push_bind(bar.timeframe.to_string())
                .push_bind(bar.open.0)
                .push_bind(bar.high.0)
                .push_bind(bar.low.0)
                .push_bind(bar.close.0)
                .push_bind(bar.adjusted_close.map(|p| p.0))
                .push_bind(bar.volume.0)
                .push_bind(&bar.source)
                .push_bind(bar.quality_score)
                .push_bind(bar.created_at);
        });

        builder.push(
            r#"
            ON CONFLICT (instrument_id, "timestamp", timeframe) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                adjusted_close = EXCLUDED.adjusted_close,
                volume = EXCLUDED.volume,
                source = EXCLUDED.source,
                quality_score = EXCLUDED.quality_score
            "#,
        );

        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        total += result.rows_affected();
    }

    Ok(total)
}

/// **Range** (C4, spec.md §4.4): ascending by timestamp.
pub async fn range(
    pool: &PgPool,
    instrument_id: Id,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    timeframe: Timeframe,
    limit: i64,
) -> Result<Vec<OhlcvBar>, StoreError> {
    let rows = sqlx::query_as::<_, OhlcvRow>(
        r#"
        SELECT * FROM ohlcv
        WHERE instrument_id = $1 AND timeframe = $2 AND "timestamp" >= $3 AND "timestamp" <= $4
        ORDER BY "timestamp" ASC
        LIMIT $5
        "#,
    )
    .bind(instrument_id)
    .bind(timeframe.to_string())
    .bind(from)
    .bind(to)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn earliest_date(pool: &PgPool, instrument_id: Id, timeframe: Timeframe) -> Result<Option<NaiveDate>, StoreError> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"SELECT MIN("timestamp") FROM ohlcv WHERE instrument_id = $1 AND timeframe = $2"#,
    )
    .bind(instrument_id)
    .bind(timeframe.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(ts,)| ts.date_naive()))
}

pub async fn latest_date(pool: &PgPool, instrument_id: Id, timeframe: Timeframe) -> Result<Option<NaiveDate>, StoreError> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"SELECT MAX("timestamp") FROM ohlcv WHERE instrument_id = $1 AND timeframe = $2"#,
    )
    .bind(instrument_id)
    .bind(timeframe.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(ts,)| ts.date_naive()))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CoverageStats {
    pub instrument_id: Id,
    pub row_count: i64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

pub async fn coverage_stats(pool: &PgPool, timeframe: Timeframe) -> Result<Vec<CoverageStats>, StoreError> {
    let rows = sqlx::query_as::<_, CoverageStats>(
        r#"
        SELECT instrument_id, COUNT(*) AS row_count, MIN("timestamp") AS earliest, MAX("timestamp") AS latest
        FROM ohlcv
        WHERE timeframe = $1
        GROUP BY instrument_id
        "#,
    )
    .bind(timeframe.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Instruments with zero rows in `[from, to]` for `timeframe` — used to
/// spot gaps outside the per-instrument `FetchProgress` bookkeeping.
pub async fn missing_instruments(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    timeframe: Timeframe,
) -> Result<Vec<Id>, StoreError> {
    let rows: Vec<(Id,)> = sqlx::query_as(
        r#"
        SELECT i.id FROM instruments i
        WHERE i.is_active AND i.security_type IN ('STOCK', 'INDEX')
        AND NOT EXISTS (
            SELECT 1 FROM ohlcv o
            WHERE o.instrument_id = i.id AND o.timeframe = $1
              AND o."timestamp" >= $2 AND o."timestamp" <= $3
        )
        "#,
    )
    .bind(timeframe.to_string())
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Soft delete: zeroes out `quality_score` rather than removing rows,
/// the operationally safe default (spec.md §4.4).
pub async fn soft_delete(
    pool: &PgPool,
    instrument_id: Id,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    timeframe: Timeframe,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"UPDATE ohlcv SET quality_score = 0.0 WHERE instrument_id = $1 AND timeframe = $2 AND "timestamp" >= $3 AND "timestamp" <= $4"#,
    )
    .bind(instrument_id)
    .bind(timeframe.to_string())
    .bind(from)
    .bind(to)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn hard_delete(
    pool: &PgPool,
    instrument_id: Id,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    timeframe: Timeframe,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"DELETE FROM ohlcv WHERE instrument_id = $1 AND timeframe = $2 AND "timestamp" >= $3 AND "timestamp" <= $4"#,
    )
    .bind(instrument_id)
    .bind(timeframe.to_string())
    .bind(from)
    .bind(to)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
