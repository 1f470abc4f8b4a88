//! Distributed, cross-process rate limiter (C1, spec.md §4.1).
//!
//! The upstream enforces one requests-per-second ceiling shared across
//! every worker and host using the same credential, so the limiter
//! cannot keep its state per-process. It keeps exactly one shared
//! scalar — the wall-clock timestamp of the last successful acquire —
//! in Redis, and paces callers to `1/rps` spacing via a conditional
//! write. This mirrors `SimpleRedisRateLimiter` in
//! `app/services/data_fetchers/rate_limiter.py`: uniform spacing, not a
//! token bucket, because the upstream penalizes bursts as much as raw
//! rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::RateLimiterError;

/// Shared scalar state backing the limiter, abstracted so tests can
/// substitute an in-memory stand-in for Redis.
#[async_trait]
pub trait SharedState: Send + Sync {
    /// Reads the last successful-acquire timestamp, as seconds since
    /// the Unix epoch. Absent ⇒ `0.0`.
    async fn read_last(&self) -> Result<f64, RateLimiterError>;

    /// Writes `now` as the last-acquire timestamp with a 5 minute TTL,
    /// succeeding unconditionally (the race is resolved by the retry
    /// loop re-reading and re-comparing, matching the source's
    /// non-atomic `SET` — see spec.md §9's silence on stronger
    /// guarantees here).
    async fn cas_write(&self, now: f64) -> Result<(), RateLimiterError>;

    async fn incr_successful(&self) -> Result<(), RateLimiterError>;
    async fn incr_timeouts(&self) -> Result<(), RateLimiterError>;
}

const LAST_REQUEST_KEY: &str = "quantpulse_ingest:rate_limit:last_request";
const STATS_SUCCESSFUL_KEY: &str = "quantpulse_ingest:rate_limit:successful_acquisitions";
const STATS_TIMEOUTS_KEY: &str = "quantpulse_ingest:rate_limit:timeouts";
const STATE_TTL_SECS: i64 = 300;

/// Redis-backed `SharedState`, the system's actual production backing
/// store.
pub struct RedisSharedState {
    manager: redis::aio::ConnectionManager,
}

impl RedisSharedState {
    pub async fn connect(url: &str) -> Result<Self, RateLimiterError> {
        let client = redis::Client::open(url)
            .map_err(|e| RateLimiterError::Unavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| RateLimiterError::Unavailable(e.to_string()))?;
        Ok(RedisSharedState { manager })
    }
}

#[async_trait]
impl SharedState for RedisSharedState {
    async fn read_last(&self) -> Result<f64, RateLimiterError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(LAST_REQUEST_KEY)
            .await
            .map_err(|e| RateLimiterError::Unavailable(e.to_string()))?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0.0))
    }

    async fn cas_write(&self, now: f64) -> Result<(), RateLimiterError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(LAST_REQUEST_KEY, now.to_string(), STATE_TTL_SECS as u64)
            .await
            .map_err(|e| RateLimiterError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn incr_successful(&self) -> Result<(), RateLimiterError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .incr(STATS_SUCCESSFUL_KEY, 1)
            .await
            .map_err(|e| RateLimiterError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn incr_timeouts(&self) -> Result<(), RateLimiterError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .incr(STATS_TIMEOUTS_KEY, 1)
            .await
            .map_err(|e| RateLimiterError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// In-process `SharedState` for tests and single-process deployments,
/// coordinating via an atomic rather than a network round-trip.
#[derive(Default)]
pub struct InMemorySharedState {
    last_request_micros: AtomicU64,
    successful: AtomicU64,
    timeouts: AtomicU64,
}

#[async_trait]
impl SharedState for InMemorySharedState {
    async fn read_last(&self) -> Result<f64, RateLimiterError> {
        Ok(self.last_request_micros.load(Ordering::SeqCst) as f64 / 1_000_000.0)
    }

    async fn cas_write(&self, now: f64) -> Result<(), RateLimiterError> {
        self.last_request_micros
            .store((now * 1_000_000.0) as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn incr_successful(&self) -> Result<(), RateLimiterError> {
        self.successful.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn incr_timeouts(&self) -> Result<(), RateLimiterError> {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl InMemorySharedState {
    pub fn successful_acquisitions(&self) -> u64 {
        self.successful.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }
}

/// Diagnostic snapshot mirroring `get_status()` in the source.
#[derive(Debug, Clone)]
pub struct RateLimiterStatus {
    pub requests_per_second: f64,
    pub min_interval: Duration,
    pub last_request_time: f64,
}

/// One process-local limiter wrapping a [`SharedState`]; every
/// in-process caller should share a single instance so they coalesce
/// onto the same pacing decisions (spec.md §4.1 "process-local
/// singleton").
pub struct RateLimiter {
    shared: Arc<dyn SharedState>,
    requests_per_second: f64,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(shared: Arc<dyn SharedState>, requests_per_second: f64) -> Self {
        RateLimiter {
            shared,
            requests_per_second,
            min_interval: Duration::from_secs_f64(1.0 / requests_per_second),
        }
    }

    /// Blocks the caller until the shared spacing constraint is
    /// satisfied, or `timeout` elapses. Returns `Ok(true)` once
    /// acquired, `Ok(false)` on timeout, and `Err` if the shared state
    /// itself is unreachable (spec.md §4.1 "fail closed").
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn acquire(
        &self,
        timeout: Duration,
        client_id: &str,
    ) -> Result<bool, RateLimiterError> {
        let start = Instant::now();

        loop {
            let now = unix_now();
            let last = self.shared.read_last().await?;
            let time_since_last = now - last;

            if time_since_last >= self.min_interval.as_secs_f64() {
                self.shared.cas_write(now).await?;
                self.shared.incr_successful().await?;
                debug!(client_id, "acquired rate-limit token");
                return Ok(true);
            }

            if start.elapsed() >= timeout {
                warn!(client_id, elapsed = ?start.elapsed(), "rate-limit acquire timed out");
                self.shared.incr_timeouts().await?;
                return Ok(false);
            }

            let wait = (self.min_interval.as_secs_f64() - time_since_last + 0.1).max(0.1);
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    pub async fn status(&self) -> Result<RateLimiterStatus, RateLimiterError> {
        Ok(RateLimiterStatus {
            requests_per_second: self.requests_per_second,
            min_interval: self.min_interval,
            last_request_time: self.shared.read_last().await?,
        })
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64) -> RateLimiter {
        RateLimiter::new(Arc::new(InMemorySharedState::default()), rps)
    }

    #[tokio::test]
    async fn first_acquire_never_waits() {
        let rl = limiter(5.0);
        let acquired = rl.acquire(Duration::from_secs(1), "t1").await.unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn second_acquire_is_paced_to_min_interval() {
        let rl = limiter(10.0); // min_interval = 100ms
        let start = Instant::now();
        assert!(rl.acquire(Duration::from_secs(2), "t1").await.unwrap());
        assert!(rl.acquire(Duration::from_secs(2), "t1").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn times_out_when_deadline_too_short() {
        let rl = limiter(1.0); // min_interval = 1s
        assert!(rl.acquire(Duration::from_millis(50), "t1").await.unwrap());
        let acquired = rl.acquire(Duration::from_millis(10), "t2").await.unwrap();
        assert!(!acquired);
    }
}
