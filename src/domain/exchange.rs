use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::Id;

/// Catalog row for a tradable venue (spec.md §3 Exchange). Long-lived
/// and close to immutable; `EnsureExchange` (C8) is the only writer
/// path that creates one, and only a handful of fields are ever
/// refreshed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: Id,
    /// Unique code, e.g. "NSE".
    pub code: String,
    pub name: String,
    pub country: String,
    pub timezone: String,
    pub currency: String,
    pub trading_hours_start: NaiveTime,
    pub trading_hours_end: NaiveTime,
    pub is_active: bool,
}

impl Exchange {
    /// Exchanges supported by the Instrument Catalog Service's master
    /// import filter (spec.md §4.8 "filter to supported exchange codes").
    pub const SUPPORTED_CODES: &'static [&'static str] = &["NSE", "BSE"];

    pub fn is_supported_code(code: &str) -> bool {
        Self::SUPPORTED_CODES.contains(&code)
    }
}
