//! Chunked sequential fetcher (C6, spec.md §4.6) — the throughput- and
//! memory-sensitive center of the ingestion pipeline. Every upstream
//! call is gated by [`crate::rate_limiter::RateLimiter`], so the
//! effective network concurrency is exactly `rps` regardless of how
//! many instruments are in flight.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::domain::{FetchOperation, Id, Instrument, OhlcvBar};
use crate::error::IngestError;
use crate::parser;
use crate::rate_limiter::RateLimiter;
use crate::upstream::UpstreamClient;
use crate::{db, IngestResult};

/// Flush the in-flight row buffer after it crosses this size even if
/// the current chunk hasn't finished (spec.md §4.6 "early-flush
/// guard").
const EARLY_FLUSH_ROWS: usize = 50_000;

/// Pause between chunks to let the substrate catch up (spec.md §4.6
/// "sleep briefly (~1s)").
const INTER_CHUNK_PAUSE: Duration = Duration::from_secs(1);

/// Reported to callers after each instrument and each chunk completes
/// (spec.md §4.6 "0-70% spread over instrument processing, 70-90% over
/// chunks being flushed, 100% at the end").
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percentage: u8, message: &str);
}

impl<F: Fn(u8, &str) + Send + Sync> ProgressSink for F {
    fn on_progress(&self, percentage: u8, message: &str) {
        self(percentage, message)
    }
}

/// Checked at every chunk boundary and every rate-limit acquisition
/// (spec.md §4.10 "cancellation cooperation"). Returning `true` stops
/// the fetcher after the in-flight chunk finishes flushing.
pub trait CancelSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

impl<F: Fn() -> bool + Send + Sync> CancelSignal for F {
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Never cancels; the default for callers with no cancellation surface.
pub struct NeverCancel;
impl CancelSignal for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Counts and derived rates reported back to the caller (spec.md §4.6
/// "a result object reporting counts ... wall-clock duration, and
/// derived rates").
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub records_inserted: u64,
    pub duration: Duration,
    pub was_cancelled: bool,
}

impl FetchResult {
    pub fn instruments_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.processed as f64 / secs
        }
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.records_inserted as f64 / secs
        }
    }
}

/// Runs a historical backfill over `instruments` in fixed-size chunks
/// (spec.md §4.6). Instruments are processed in the order given —
/// deterministic when callers pre-sort.
pub async fn run_historical_backfill(
    pool: &PgPool,
    upstream: &dyn UpstreamClient,
    limiter: &RateLimiter,
    instruments: &[Instrument],
    from_date: chrono::NaiveDate,
    to_date: chrono::NaiveDate,
    chunk_size: usize,
    bulk_insert_size: usize,
    progress: &dyn ProgressSink,
    cancel: &dyn CancelSignal,
) -> IngestResult<FetchResult> {
    let started = Instant::now();
    let chunk_size = chunk_size.max(1);
    let total = instruments.len();
    let from_str = from_date.format("%Y-%m-%d").to_string();
    let to_str = to_date.format("%Y-%m-%d").to_string();

    let mut result = FetchResult::default();

    'chunks: for chunk in instruments.chunks(chunk_size) {
        if cancel.is_cancelled() {
            result.was_cancelled = true;
            break;
        }

        let mut buffer: Vec<OhlcvBar> = Vec::new();
        // A chunk is `chunk_size` instruments (10 by default), so these
        // stay on the stack for the common case instead of allocating
        // per chunk.
        let mut successful_ids: SmallVec<[Id; 16]> = SmallVec::new();
        let mut failures: SmallVec<[(Id, String); 16]> = SmallVec::new();

        for instrument in chunk {
            if cancel.is_cancelled() {
                result.was_cancelled = true;
                break;
            }

            result.processed += 1;
            let classification = instrument.security_type.classify();

            if !limiter
                .acquire(Duration::from_secs(30), "fetcher:historical")
                .await?
            {
                // spec.md §4.6: "a shared-state outage in C1 is fatal".
                return Err(IngestError::RateLimiter(
                    crate::error::RateLimiterError::Timeout(Duration::from_secs(30)),
                ));
            }

            match upstream
                .fetch_historical(
                    instrument.external_id,
                    classification.exchange_segment,
                    classification.instrument_kind,
                    &from_str,
                    &to_str,
                )
                .await
            {
                Ok(response) => {
                    match parser::parse_historical(instrument.id, &response, "dhan_api") {
                        Ok(rows) => {
                            buffer.extend(rows);
                            successful_ids.push(instrument.id);
                        }
                        Err(e) => {
                            warn!(instrument_id = %instrument.id, error = %e, "dropping unparseable historical response");
                            failures.push((instrument.id, e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    warn!(instrument_id = %instrument.id, error = %e, "historical fetch failed for instrument, continuing");
                    failures.push((instrument.id, e.to_string()));
                }
            }

            if buffer.len() > EARLY_FLUSH_ROWS {
                result.records_inserted +=
                    flush_rows(pool, &mut buffer, bulk_insert_size).await?;
            }

            let pct = ((result.processed as f64 / total.max(1) as f64) * 70.0) as u8;
            progress.on_progress(pct.min(70), &format!("processed {}/{total}", result.processed));
        }

        result.records_inserted += flush_rows(pool, &mut buffer, bulk_insert_size).await?;

        db::progress::mark_success(pool, &successful_ids, FetchOperation::Historical, to_date)
            .await?;
        for (instrument_id, error_message) in &failures {
            db::progress::mark_failed(pool, *instrument_id, error_message).await?;
        }

        result.successful += successful_ids.len();
        result.failed += failures.len();

        let chunk_pct = 70 + ((result.processed as f64 / total.max(1) as f64) * 20.0) as u8;
        progress.on_progress(chunk_pct.min(90), "chunk flushed");

        if result.was_cancelled {
            break 'chunks;
        }

        // No direct analogue to a GC hint in Rust; dropping `buffer`
        // above already released the chunk's row allocations.
        tokio::time::sleep(INTER_CHUNK_PAUSE).await;
    }

    result.duration = started.elapsed();
    if !result.was_cancelled {
        progress.on_progress(100, "historical backfill complete");
    }

    info!(
        processed = result.processed,
        successful = result.successful,
        failed = result.failed,
        records_inserted = result.records_inserted,
        cancelled = result.was_cancelled,
        duration = %humantime::format_duration(result.duration),
        "historical backfill finished"
    );

    Ok(result)
}

async fn flush_rows(pool: &PgPool, buffer: &mut Vec<OhlcvBar>, bulk_insert_size: usize) -> IngestResult<u64> {
    if buffer.is_empty() {
        return Ok(0);
    }
    let rows = std::mem::take(buffer);
    let inserted = db::ohlcv::bulk_upsert(pool, &rows, bulk_insert_size).await?;
    Ok(inserted)
}

/// EOD path (spec.md §4.6 "single-call variant"): groups all target
/// instruments by exchange segment into one payload, makes one gated
/// upstream call, one parse pass, one upsert.
pub async fn run_daily_eod(
    pool: &PgPool,
    upstream: &dyn UpstreamClient,
    limiter: &RateLimiter,
    instruments: &[Instrument],
    bulk_insert_size: usize,
    market_tz: chrono_tz::Tz,
    progress: &dyn ProgressSink,
) -> IngestResult<FetchResult> {
    let started = Instant::now();
    let mut by_segment: HashMap<String, Vec<i32>> = HashMap::new();
    let mut external_id_to_instrument: HashMap<String, Id> = HashMap::new();

    for instrument in instruments {
        let classification = instrument.security_type.classify();
        by_segment
            .entry(classification.exchange_segment.to_string())
            .or_default()
            .push(instrument.external_id);
        external_id_to_instrument.insert(instrument.external_id.to_string(), instrument.id);
    }

    progress.on_progress(0, "requesting EOD quotes");

    if !limiter
        .acquire(Duration::from_secs(30), "fetcher:eod")
        .await?
    {
        return Err(IngestError::RateLimiter(
            crate::error::RateLimiterError::Timeout(Duration::from_secs(30)),
        ));
    }

    let response = upstream.fetch_today_eod(&by_segment).await?;
    progress.on_progress(70, "parsing EOD quotes");

    let rows = parser::parse_eod(&response, &external_id_to_instrument, "dhan_api", market_tz);
    let successful_ids: Vec<Id> = rows.iter().map(|r| r.instrument_id).collect();

    let records_inserted = db::ohlcv::bulk_upsert(pool, &rows, bulk_insert_size).await?;
    progress.on_progress(90, "recording progress");

    db::progress::mark_success(
        pool,
        &successful_ids,
        FetchOperation::Daily,
        chrono::Utc::now().with_timezone(&market_tz).date_naive(),
    )
    .await?;

    progress.on_progress(100, "daily EOD fetch complete");

    let result = FetchResult {
        processed: instruments.len(),
        successful: successful_ids.len(),
        failed: instruments.len().saturating_sub(successful_ids.len()),
        records_inserted,
        duration: started.elapsed(),
        was_cancelled: false,
    };

    info!(
        processed = result.processed,
        successful = result.successful,
        records_inserted = result.records_inserted,
        duration = %humantime::format_duration(result.duration),
        "daily EOD fetch finished"
    );

    Ok(result)
}
