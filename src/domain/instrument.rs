use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::CatalogError;

use super::Id;

/// Broad classification of a tradable symbol (spec.md §3 Instrument).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SecurityType {
    Stock,
    Index,
    Derivative,
    Etf,
    Bond,
}

/// Market segment a security trades in (spec.md §3, §4.2).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Segment {
    Equity,
    Derivative,
    Currency,
    Commodity,
    Index,
}

/// The upstream's two-part classification derived from an instrument's
/// `security_type`, used to address `FetchHistorical`/`FetchTodayEOD`
/// (spec.md §4.2). `exchange_segment` is the broker-facing segment
/// code, `instrument_kind` the broker-facing instrument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamClassification {
    pub exchange_segment: &'static str,
    pub instrument_kind: &'static str,
}

impl SecurityType {
    /// spec.md §4.2: STOCK→(NSE_EQ, EQUITY); INDEX→(IDX_I, INDEX);
    /// DERIVATIVE→(NSE_FNO, FUTSTK).
    pub fn classify(self) -> UpstreamClassification {
        match self {
            SecurityType::Stock => UpstreamClassification {
                exchange_segment: "NSE_EQ",
                instrument_kind: "EQUITY",
            },
            SecurityType::Index => UpstreamClassification {
                exchange_segment: "IDX_I",
                instrument_kind: "INDEX",
            },
            SecurityType::Derivative => UpstreamClassification {
                exchange_segment: "NSE_FNO",
                instrument_kind: "FUTSTK",
            },
            // ETF/Bond are carried in the catalog but are not part of
            // the OHLCV ingestion pipeline's target universe.
            SecurityType::Etf | SecurityType::Bond => UpstreamClassification {
                exchange_segment: "NSE_EQ",
                instrument_kind: "EQUITY",
            },
        }
    }
}

/// A tradable symbol on one exchange (spec.md §3 Instrument).
///
/// Unique by (`symbol`, `exchange_id`) and independently by
/// `external_id`. The invariant "a DERIVATIVE instrument has exactly
/// one Future child; other types have none" is enforced by the
/// catalog service (`crate::catalog`) at write time, not by this type
/// alone — a bare struct cannot see its sibling row — but
/// [`Instrument::require_future_consistency`] gives every caller a
/// single place to check it before persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: Id,
    pub symbol: String,
    pub exchange_id: Id,
    pub external_id: i32,
    pub security_type: SecurityType,
    pub segment: Segment,

    pub isin: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub lot_size: Option<i32>,
    pub tick_size: Option<Decimal>,

    pub is_active: bool,
    pub is_tradeable: bool,
    pub is_derivatives_eligible: bool,
    pub has_options: bool,
    pub has_futures: bool,
}

impl Instrument {
    pub fn new(
        symbol: impl Into<String>,
        exchange_id: Id,
        external_id: i32,
        security_type: SecurityType,
        segment: Segment,
    ) -> Self {
        Instrument {
            id: Id::new_v4(),
            symbol: symbol.into(),
            exchange_id,
            external_id,
            security_type,
            segment,
            isin: None,
            sector: None,
            industry: None,
            lot_size: None,
            tick_size: None,
            is_active: true,
            is_tradeable: true,
            is_derivatives_eligible: false,
            has_options: false,
            has_futures: false,
        }
    }

    /// Whether this instrument is eligible for the OHLCV historical/daily
    /// pipelines (spec.md §4.5 "active STOCK/INDEX instruments").
    pub fn is_ohlcv_target(&self) -> bool {
        self.is_active
            && matches!(self.security_type, SecurityType::Stock | SecurityType::Index)
    }

    /// spec.md §3 invariant: `security_type = DERIVATIVE` requires a
    /// matching `Future` row; other types must not have one.
    pub fn require_future_consistency(&self, has_future_row: bool) -> Result<(), CatalogError> {
        let expects_future = self.security_type == SecurityType::Derivative;
        if expects_future != has_future_row {
            return Err(CatalogError::MissingField {
                field: if expects_future {
                    "futures row for DERIVATIVE instrument"
                } else {
                    "unexpected futures row for non-DERIVATIVE instrument"
                },
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_spec_table() {
        assert_eq!(
            SecurityType::Stock.classify(),
            UpstreamClassification {
                exchange_segment: "NSE_EQ",
                instrument_kind: "EQUITY"
            }
        );
        assert_eq!(
            SecurityType::Index.classify(),
            UpstreamClassification {
                exchange_segment: "IDX_I",
                instrument_kind: "INDEX"
            }
        );
        assert_eq!(
            SecurityType::Derivative.classify(),
            UpstreamClassification {
                exchange_segment: "NSE_FNO",
                instrument_kind: "FUTSTK"
            }
        );
    }

    #[test]
    fn only_active_stock_or_index_are_ohlcv_targets() {
        let exch = Id::new_v4();
        let mut stock = Instrument::new("RELIANCE", exch, 2885, SecurityType::Stock, Segment::Equity);
        assert!(stock.is_ohlcv_target());
        stock.is_active = false;
        assert!(!stock.is_ohlcv_target());

        let deriv = Instrument::new("RELIANCE-FUT", exch, 99001, SecurityType::Derivative, Segment::Derivative);
        assert!(!deriv.is_ohlcv_target());
    }

    #[test]
    fn future_consistency_invariant() {
        let exch = Id::new_v4();
        let deriv = Instrument::new("RELIANCE-FUT", exch, 99001, SecurityType::Derivative, Segment::Derivative);
        assert!(deriv.require_future_consistency(true).is_ok());
        assert!(deriv.require_future_consistency(false).is_err());

        let stock = Instrument::new("RELIANCE", exch, 2885, SecurityType::Stock, Segment::Equity);
        assert!(stock.require_future_consistency(false).is_ok());
        assert!(stock.require_future_consistency(true).is_err());
    }
}
