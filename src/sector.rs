//! Sector enricher (C9, spec.md §4.9): batched per-exchange ISIN
//! lookup backfilling `sector`/`industry` on active EQUITY instruments.
//! Grounded on `securities_import_helpers.py`'s sibling enrichment pass
//! in `original_source` and on [`crate::catalog`]'s DB access shape.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::db;
use crate::domain::Instrument;
use crate::upstream::UpstreamClient;
use crate::IngestResult;

/// ISINs per sector-lookup request (spec.md §4.9 "15 ISINs/request").
const BATCH_SIZE: usize = 15;

/// Per-exchange worker concurrency (spec.md §4.9 "default 2-3").
const DEFAULT_MAX_WORKERS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct EnrichmentSummary {
    pub exchanges_processed: usize,
    pub candidates: usize,
    pub updated: usize,
}

/// Runs sector enrichment across every active exchange, fanning out a
/// bounded worker pool over exchanges (spec.md §4.9 "a small worker
/// pool (default 2-3) may run different exchanges concurrently").
pub async fn run(
    pool: &PgPool,
    upstream: &dyn UpstreamClient,
    force_refresh: bool,
    max_workers: usize,
) -> IngestResult<EnrichmentSummary> {
    let exchanges = db::instruments::list_active_exchanges(pool).await?;
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1).min(DEFAULT_MAX_WORKERS.max(max_workers))));

    let mut handles = Vec::with_capacity(exchanges.len());
    for exchange in exchanges {
        let pool = pool.clone();
        let permit = Arc::clone(&semaphore);
        // `UpstreamClient` isn't `'static` here (it's a `&dyn` borrow
        // scoped to this call), so exchanges run concurrently via a
        // join set within the borrow rather than via `tokio::spawn`.
        handles.push(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore never closed");
            enrich_exchange(&pool, upstream, &exchange.code, exchange.id, force_refresh).await
        });
    }

    let results = futures::future::join_all(handles).await;

    let mut summary = EnrichmentSummary::default();
    for result in results {
        let (candidates, updated) = result?;
        summary.exchanges_processed += 1;
        summary.candidates += candidates;
        summary.updated += updated;
    }

    info!(
        exchanges = summary.exchanges_processed,
        candidates = summary.candidates,
        updated = summary.updated,
        "sector enrichment finished"
    );

    Ok(summary)
}

async fn enrich_exchange(
    pool: &PgPool,
    upstream: &dyn UpstreamClient,
    exchange_code: &str,
    exchange_id: crate::domain::Id,
    force_refresh: bool,
) -> IngestResult<(usize, usize)> {
    let candidates = db::instruments::equities_needing_sector(pool, exchange_id, force_refresh).await?;
    if candidates.is_empty() {
        return Ok((0, 0));
    }

    let mut updated = 0usize;

    for batch in candidates.chunks(BATCH_SIZE) {
        updated += enrich_batch(pool, upstream, exchange_code, batch).await?;
    }

    Ok((candidates.len(), updated))
}

/// One batched lookup for up to [`BATCH_SIZE`] instruments sharing an
/// exchange. Matches returned rows by ISIN only — the request carries
/// symbols as the upstream's selector, but the response is joined back
/// to instruments via ISIN (spec.md §9 Open Question: rows lacking
/// ISIN in the response are silently dropped, matching the source).
async fn enrich_batch(
    pool: &PgPool,
    upstream: &dyn UpstreamClient,
    exchange_code: &str,
    batch: &[Instrument],
) -> IngestResult<usize> {
    let symbols_csv = batch
        .iter()
        .map(|i| i.symbol.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let response = match upstream.fetch_sector(exchange_code, &symbols_csv).await {
        Ok(r) => r,
        Err(e) => {
            warn!(exchange_code, error = %e, "sector lookup failed for batch, skipping");
            return Ok(0);
        }
    };

    if response.code != 0 {
        warn!(exchange_code, code = response.code, "sector endpoint returned a non-zero status code");
        return Ok(0);
    }

    let mut updated = 0usize;
    for row in &response.data {
        if row.isin.trim().is_empty() {
            continue;
        }
        if row.sector.is_none() && row.sub_sector.is_none() {
            continue;
        }
        let rows_affected = db::instruments::update_sector_by_isin(
            pool,
            row.isin.trim(),
            row.sector.as_deref(),
            row.sub_sector.as_deref(),
        )
        .await?;
        updated += rows_affected as usize;
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::BATCH_SIZE;

    #[test]
    fn batch_size_matches_spec() {
        assert_eq!(BATCH_SIZE, 15);
    }
}
