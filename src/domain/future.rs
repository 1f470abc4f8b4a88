use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::Id;

/// Contract month of a derivative (spec.md §3 Future).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ContractMonth {
    Jan,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SettlementType {
    Cash,
    Physical,
}

/// A derivative contract, one-to-one with an Instrument of DERIVATIVE
/// type (spec.md §3 Future).
///
/// Unique by (`underlying_id`, `contract_month`, `expiration_date`,
/// `settlement_type`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Future {
    pub id: Id,
    pub instrument_id: Id,
    /// The STOCK or INDEX instrument this contract derives from.
    pub underlying_id: Id,
    pub expiration_date: NaiveDate,
    pub contract_month: ContractMonth,
    pub settlement_type: SettlementType,
    pub contract_size: i32,
    pub lot_size: i32,
    pub previous_contract_id: Option<Id>,
    pub next_contract_id: Option<Id>,
    pub is_active: bool,
}

impl Future {
    /// spec.md §3 invariant: `is_active = false` once
    /// `expiration_date < today()`. Returns the corrected flag; callers
    /// persist it via `MarkExpiredInactive` (C8.4).
    pub fn recompute_is_active(&self, today: NaiveDate) -> bool {
        self.expiration_date >= today
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn future(expiration: NaiveDate) -> Future {
        Future {
            id: Id::new_v4(),
            instrument_id: Id::new_v4(),
            underlying_id: Id::new_v4(),
            expiration_date: expiration,
            contract_month: ContractMonth::Jan,
            settlement_type: SettlementType::Cash,
            contract_size: 1,
            lot_size: 1,
            previous_contract_id: None,
            next_contract_id: None,
            is_active: true,
        }
    }

    #[test]
    fn expired_future_recomputes_inactive() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let expired = future(NaiveDate::from_ymd_opt(2026, 1, 30).unwrap());
        assert!(!expired.recompute_is_active(today));

        let live = future(NaiveDate::from_ymd_opt(2026, 12, 31).unwrap());
        assert!(live.recompute_is_active(today));
    }
}
