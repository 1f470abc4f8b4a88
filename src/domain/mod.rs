//! Canonical data model (spec.md §3). These are plain structs shared by
//! the persistence layer (`crate::db`) and every pipeline component;
//! none of them owns a DB connection.

pub mod exchange;
pub mod fetch_progress;
pub mod future;
pub mod instrument;
pub mod ohlcv;
pub mod task;

pub use exchange::Exchange;
pub use fetch_progress::{FetchOperation, FetchProgress, FetchStatus};
pub use future::{ContractMonth, Future, SettlementType};
pub use instrument::{Instrument, Segment, SecurityType};
pub use ohlcv::{OhlcvBar, Price, Timeframe, Volume};
pub use task::{LogLevel, TaskLog, TaskRun, TaskStatus, TaskStep};

use uuid::Uuid;

/// 128-bit opaque surrogate identifier used by every catalog/ingestion
/// entity (spec.md §3: "stable surrogate identifiers (128-bit opaque
/// IDs) unless noted").
pub type Id = Uuid;
