//! Trading-day calendar seam (spec.md §1 "Holiday calendars — consumed
//! as a read-only `IsTradingDay(date, exchange)` query").
//!
//! The calendar implementation itself is out of scope; the source's
//! `holiday_service.py`/`populate_holidays.py` back this dependency in
//! the original system, but C6's EOD path and C7's weekly bucketing
//! both need a concrete seam to call through, so this crate defines
//! the trait and a placeholder implementation only.

use chrono::NaiveDate;

/// Read-only dependency answering whether `date` is a trading day for
/// `exchange_code`. Implementations are expected to be backed by a
/// maintained holiday table; none is provided here.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate, exchange_code: &str) -> bool;
}

/// Stub implementation treating every day as a trading day. Exists so
/// tests and early integration have a working seam — it is not a
/// holiday calendar and must not be used in production.
pub struct AssumeAllDaysTrading;

impl TradingCalendar for AssumeAllDaysTrading {
    fn is_trading_day(&self, _date: NaiveDate, _exchange_code: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_always_reports_trading_day() {
        let cal = AssumeAllDaysTrading;
        let date = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap(); // Republic Day
        assert!(cal.is_trading_day(date, "NSE"));
    }
}
