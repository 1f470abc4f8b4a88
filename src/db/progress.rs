use chrono::{NaiveDate, Utc};
use sqlx::PgPool;

use crate::domain::{FetchOperation, FetchProgress, Id, Instrument};
use crate::error::StoreError;

use super::instruments::InstrumentRowPublic;

/// `MarkSuccess` (C5, spec.md §4.5): idempotent upsert resetting
/// `retry_count=0, error_message=null` for every id in `instrument_ids`
/// in one statement (spec.md §4.6 "single-writer progress updates").
pub async fn mark_success(
    pool: &PgPool,
    instrument_ids: &[Id],
    operation: FetchOperation,
    as_of_date: NaiveDate,
) -> Result<u64, StoreError> {
    if instrument_ids.is_empty() {
        return Ok(0);
    }

    let column = match operation {
        FetchOperation::Historical => "last_historical_fetch",
        FetchOperation::Daily => "last_daily_fetch",
    };

    let query = format!(
        r#"
        INSERT INTO fetch_progress (instrument_id, {column}, status, retry_count, error_message, updated_at)
        SELECT id, $2, 'success', 0, NULL, now() FROM UNNEST($1::uuid[]) AS id
        ON CONFLICT (instrument_id) DO UPDATE SET
            {column} = EXCLUDED.{column},
            status = 'success',
            retry_count = 0,
            error_message = NULL,
            updated_at = now()
        "#,
    );

    let result = sqlx::query(&query)
        .bind(instrument_ids)
        .bind(as_of_date)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// `MarkFailed` (C5, spec.md §4.5): idempotent upsert incrementing
/// `retry_count` and storing the (truncated) error.
pub async fn mark_failed(pool: &PgPool, instrument_id: Id, error_message: &str) -> Result<(), StoreError> {
    let truncated = FetchProgress::truncate_error(error_message);

    sqlx::query(
        r#"
        INSERT INTO fetch_progress (instrument_id, status, retry_count, error_message, updated_at)
        VALUES ($1, 'failed', 1, $2, now())
        ON CONFLICT (instrument_id) DO UPDATE SET
            status = 'failed',
            retry_count = fetch_progress.retry_count + 1,
            error_message = EXCLUDED.error_message,
            updated_at = now()
        "#,
    )
    .bind(instrument_id)
    .bind(truncated)
    .execute(pool)
    .await?;

    Ok(())
}

/// `PendingFor(operation)` (C5, spec.md §4.5). `historical`: active
/// STOCK/INDEX instruments whose progress row is missing or
/// `status=failed`. `daily`: same filter, additionally matched against
/// `last_daily_fetch < today OR missing`.
pub async fn pending_for(pool: &PgPool, operation: FetchOperation) -> Result<Vec<Instrument>, StoreError> {
    let rows: Vec<InstrumentRowPublic> = match operation {
        FetchOperation::Historical => {
            sqlx::query_as(
                r#"
                SELECT i.* FROM instruments i
                LEFT JOIN fetch_progress fp ON fp.instrument_id = i.id
                WHERE i.is_active AND i.security_type IN ('STOCK', 'INDEX')
                AND (fp.instrument_id IS NULL OR fp.status = 'failed')
                "#,
            )
            .fetch_all(pool)
            .await?
        }
        FetchOperation::Daily => {
            sqlx::query_as(
                r#"
                SELECT i.* FROM instruments i
                LEFT JOIN fetch_progress fp ON fp.instrument_id = i.id
                WHERE i.is_active AND i.security_type IN ('STOCK', 'INDEX')
                AND (
                    fp.instrument_id IS NULL
                    OR fp.status = 'failed'
                    OR fp.last_daily_fetch IS NULL
                    OR fp.last_daily_fetch < $1
                )
                "#,
            )
            .bind(Utc::now().date_naive())
            .fetch_all(pool)
            .await?
        }
    };

    rows.into_iter().map(TryInto::try_into).collect::<Result<_, _>>()
}
