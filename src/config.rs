//! Environment-driven settings (spec.md §6). No config crate in the
//! corpus's stack for this shape of app, so this follows the plain
//! `std::env::var` + `FromStr` idiom used throughout `examples/other_examples`
//! (e.g. `dbrowne-alphavantage`, `N0tT1m-invest-iq` read `DATABASE_URL`
//! the same way).

use std::env;
use std::time::Duration;

use chrono_tz::Tz;

/// Typed, defaulted view over the recognized environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub upstream_access_token: String,
    pub upstream_client_id: String,
    pub upstream_historical_url: String,
    pub upstream_eod_url: String,
    pub upstream_master_url: String,
    pub upstream_sector_url: String,

    pub rate_limit_rps: f64,
    pub ohlcv_chunk_size: usize,
    pub ohlcv_bulk_insert_size: usize,
    pub weekly_batch_size: usize,
    pub weekly_max_workers: usize,

    pub db_url: String,
    pub shared_state_url: String,
    pub market_tz: Tz,
}

impl Settings {
    /// Reads settings from the process environment, falling back to
    /// spec.md §6's documented defaults for the tunables.
    pub fn from_env() -> Self {
        Settings {
            upstream_access_token: env_string("UPSTREAM_ACCESS_TOKEN", ""),
            upstream_client_id: env_string("UPSTREAM_CLIENT_ID", ""),
            upstream_historical_url: env_string(
                "UPSTREAM_HISTORICAL_URL",
                "https://api.upstream.example/charts/historical",
            ),
            upstream_eod_url: env_string(
                "UPSTREAM_EOD_URL",
                "https://api.upstream.example/marketfeed/quote",
            ),
            upstream_master_url: env_string(
                "UPSTREAM_MASTER_URL",
                "https://images.upstream.example/master/security_master.csv",
            ),
            upstream_sector_url: env_string(
                "UPSTREAM_SECTOR_URL",
                "https://api.upstream.example/customscan/fetchdt",
            ),
            rate_limit_rps: env_parsed("RATE_LIMIT_RPS", 5.0),
            ohlcv_chunk_size: env_parsed("OHLCV_CHUNK_SIZE", 10),
            ohlcv_bulk_insert_size: env_parsed("OHLCV_BULK_INSERT_SIZE", 1_000),
            weekly_batch_size: env_parsed("WEEKLY_BATCH_SIZE", 100),
            weekly_max_workers: env_parsed("WEEKLY_MAX_WORKERS", 4),
            db_url: env_string("DB_URL", "postgres://localhost/quantpulse"),
            shared_state_url: env_string("SHARED_STATE_URL", "redis://localhost:6379"),
            market_tz: env_string("MARKET_TZ", "Asia/Kolkata")
                .parse()
                .unwrap_or(chrono_tz::Asia::Kolkata),
        }
    }

    pub fn min_rate_limit_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_limit_rps)
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // SAFETY: test-only env mutation, single-threaded test.
        unsafe {
            env::remove_var("RATE_LIMIT_RPS");
            env::remove_var("OHLCV_CHUNK_SIZE");
        }
        let settings = Settings::from_env();
        assert_eq!(settings.rate_limit_rps, 5.0);
        assert_eq!(settings.ohlcv_chunk_size, 10);
        assert_eq!(settings.weekly_batch_size, 100);
        assert_eq!(settings.weekly_max_workers, 4);
        assert_eq!(settings.market_tz, chrono_tz::Asia::Kolkata);
    }

    #[test]
    fn min_interval_derives_from_rps() {
        let mut settings = Settings::from_env();
        settings.rate_limit_rps = 5.0;
        assert_eq!(settings.min_rate_limit_interval(), Duration::from_millis(200));
    }
}
