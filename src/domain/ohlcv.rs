use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ParseError;
use crate::{impl_add_sub_mul_div_primitive, impl_display_primitive, impl_from_primitive};

use super::Id;

/// A price quoted in the instrument's traded currency. Fixed-point
/// decimal (precision 18, scale 6 at the storage boundary, per
/// spec.md §3); wrapped so a `Volume` can never silently be summed
/// into a `Price`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Price(pub Decimal);
impl_from_primitive!(Price, Decimal);
impl_add_sub_mul_div_primitive!(Price, Decimal);
impl_display_primitive!(Price);

impl Default for Price {
    fn default() -> Self {
        Price(Decimal::ZERO)
    }
}

/// Traded volume, a non-negative 64-bit integer (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Volume(pub i64);
impl_from_primitive!(Volume, i64);

impl std::ops::Add for Volume {
    type Output = Volume;
    fn add(self, rhs: Volume) -> Volume {
        Volume(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Volume {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Volume(0), |acc, v| acc + v)
    }
}

/// Bar timeframe (spec.md §3 OHLCV bar).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Timeframe {
    Daily,
    Weekly,
    Monthly,
}

/// A single OHLCV bar (spec.md §3). Primary key is
/// `(instrument_id, timestamp, timeframe)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub instrument_id: Id,
    pub timestamp: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub adjusted_close: Option<Price>,
    pub volume: Volume,
    pub source: String,
    pub quality_score: f32,
    pub created_at: DateTime<Utc>,
}

impl OhlcvBar {
    /// Validates the OHLC invariants of spec.md §3/§8:
    /// `high >= max(open, close, low)`, `low <= min(open, close, high)`,
    /// all prices strictly positive, volume non-negative.
    ///
    /// Preserves the source system's documented-but-unexplained quirk
    /// (spec.md §9 Open Questions): a perfectly flat bar
    /// (`high == low == open == close`) is allowed, but `high == low`
    /// with differing open/close is rejected even though the basic
    /// min/max inequalities would otherwise permit it. This is
    /// intentionally preserved pending upstream clarification — do not
    /// "fix" it without revisiting that open question.
    pub fn validate_ohlc(
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Result<(), ParseError> {
        let invalid = || ParseError::InvalidOhlc {
            open: open.to_string(),
            high: high.to_string(),
            low: low.to_string(),
            close: close.to_string(),
        };

        if open <= Decimal::ZERO || high <= Decimal::ZERO || low <= Decimal::ZERO || close <= Decimal::ZERO {
            return Err(invalid());
        }

        let upper = open.max(close).max(low);
        if high < upper {
            return Err(invalid());
        }
        let lower = open.min(close).min(high);
        if low > lower {
            return Err(invalid());
        }

        if high == low && high != open && high != close {
            if !(open == close && close == high) {
                return Err(invalid());
            }
        }

        Ok(())
    }

    pub fn validate_volume(volume: i64) -> Result<(), ParseError> {
        if volume < 0 {
            return Err(ParseError::InvalidVolume(volume));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_non_positive_prices() {
        assert!(OhlcvBar::validate_ohlc(dec!(0), dec!(1), dec!(0), dec!(1)).is_err());
        assert!(OhlcvBar::validate_ohlc(dec!(-1), dec!(1), dec!(-1), dec!(1)).is_err());
    }

    #[test]
    fn rejects_high_below_close() {
        assert!(OhlcvBar::validate_ohlc(dec!(10), dec!(11), dec!(9), dec!(12)).is_err());
    }

    #[test]
    fn rejects_low_above_open() {
        assert!(OhlcvBar::validate_ohlc(dec!(10), dec!(12), dec!(11), dec!(10.5)).is_err());
    }

    #[test]
    fn allows_flat_bar() {
        assert!(OhlcvBar::validate_ohlc(dec!(10), dec!(10), dec!(10), dec!(10)).is_ok());
    }

    #[test]
    fn rejects_high_equals_low_with_differing_open_close() {
        // Preserves the documented source quirk (spec.md §9 Open Questions).
        assert!(OhlcvBar::validate_ohlc(dec!(10), dec!(10), dec!(10), dec!(11)).is_err());
    }

    #[test]
    fn accepts_ordinary_bar() {
        assert!(OhlcvBar::validate_ohlc(dec!(100), dec!(105), dec!(99), dec!(102)).is_ok());
    }

    #[test]
    fn rejects_negative_volume() {
        assert!(OhlcvBar::validate_volume(-1).is_err());
        assert!(OhlcvBar::validate_volume(0).is_ok());
    }
}
