//! `sqlx`-backed persistence layer (§1.4). Grounded on the
//! pool/migrate/bulk-upsert shape of `mqk-db` (`examples/other_examples`):
//! a thin `connect`/`migrate` pair plus one repository module per
//! entity group.

pub mod instruments;
pub mod ohlcv;
pub mod progress;
pub mod tasks;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::StoreError;

/// Connects with the bounded pool spec.md §5 calls for ("default 20 +
/// 20 overflow"); `sqlx` has no separate overflow concept, so the cap
/// is folded into `max_connections`.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(40)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(StoreError::Database)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
