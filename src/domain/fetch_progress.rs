use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::Id;

/// Per-instrument fetch-state machine (spec.md §3 FetchProgress).
/// Created lazily on first attempt; used by the fetcher to select the
/// next work set (C5 `PendingFor`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum FetchStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

/// Which ingestion operation progress is being tracked for (C5
/// `PendingFor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOperation {
    Historical,
    Daily,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub instrument_id: Id,
    pub last_historical_fetch: Option<NaiveDate>,
    pub last_daily_fetch: Option<NaiveDate>,
    pub status: FetchStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FetchProgress {
    /// The `error_message` column is bounded (spec.md §7 "bounded
    /// retry/cancel surface"); truncate rather than fail the write.
    pub const MAX_ERROR_LEN: usize = 2_000;

    pub fn truncate_error(message: &str) -> String {
        if message.len() <= Self::MAX_ERROR_LEN {
            message.to_string()
        } else {
            let mut truncated = message.chars().take(Self::MAX_ERROR_LEN).collect::<String>();
            truncated.push_str("...(truncated)");
            truncated
        }
    }
}
