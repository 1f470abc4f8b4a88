use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw response body of `POST /charts/historical` (spec.md §6): six
/// parallel arrays, one entry per bar. Deserialized as-is; C3 is
/// responsible for turning this into canonical rows and rejecting
/// length mismatches.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HistoricalResponse {
    #[serde(default)]
    pub open: Vec<f64>,
    #[serde(default)]
    pub high: Vec<f64>,
    #[serde(default)]
    pub low: Vec<f64>,
    #[serde(default)]
    pub close: Vec<f64>,
    #[serde(default)]
    pub volume: Vec<i64>,
    #[serde(default)]
    pub timestamp: Vec<i64>,
}

impl HistoricalResponse {
    pub fn array_lengths(&self) -> [usize; 6] {
        [
            self.open.len(),
            self.high.len(),
            self.low.len(),
            self.close.len(),
            self.volume.len(),
            self.timestamp.len(),
        ]
    }
}

/// A single upstream error envelope, returned in place of a normal
/// payload (spec.md §6 `{status:"error", errorCode, errorMessage}`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamErrorBody {
    pub status: String,
    #[serde(rename = "errorCode")]
    pub error_code: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ohlc {
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EodQuote {
    pub ohlc: Ohlc,
    pub volume: i64,
}

/// Response body of `POST /marketfeed/quote` (spec.md §6), keyed by
/// exchange segment then by the upstream's external id (as a string,
/// matching the upstream's JSON object keys).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EodResponse {
    pub data: HashMap<String, HashMap<String, EodQuote>>,
}

/// Request payload for `FetchHistorical` (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct HistoricalRequest {
    #[serde(rename = "securityId")]
    pub security_id: String,
    #[serde(rename = "exchangeSegment")]
    pub exchange_segment: String,
    pub instrument: String,
    #[serde(rename = "expiryCode")]
    pub expiry_code: u8,
    pub oi: bool,
    #[serde(rename = "fromDate")]
    pub from_date: String,
    #[serde(rename = "toDate")]
    pub to_date: String,
}

/// One row of the tabular security-master download (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterRow {
    #[serde(rename = "SECURITY_ID")]
    pub security_id: String,
    #[serde(rename = "UNDERLYING_SYMBOL")]
    pub underlying_symbol: Option<String>,
    #[serde(rename = "SYMBOL_NAME")]
    pub symbol_name: String,
    #[serde(rename = "DISPLAY_NAME")]
    pub display_name: Option<String>,
    #[serde(rename = "EXCH_ID")]
    pub exch_id: String,
    #[serde(rename = "SEGMENT")]
    pub segment: String,
    #[serde(rename = "INSTRUMENT")]
    pub instrument: String,
    #[serde(rename = "INSTRUMENT_TYPE")]
    pub instrument_type: Option<String>,
    #[serde(rename = "ISIN")]
    pub isin: Option<String>,
    #[serde(rename = "LOT_SIZE")]
    pub lot_size: Option<String>,
    #[serde(rename = "TICK_SIZE")]
    pub tick_size: Option<String>,
    #[serde(rename = "SM_EXPIRY_DATE")]
    pub sm_expiry_date: Option<String>,
    #[serde(rename = "UNDERLYING_SECURITY_ID")]
    pub underlying_security_id: Option<String>,
    #[serde(rename = "STRIKE_PRICE")]
    pub strike_price: Option<String>,
    #[serde(rename = "OPTION_TYPE")]
    pub option_type: Option<String>,
}

/// One row returned by the sector lookup endpoint (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SectorRow {
    #[serde(rename = "Isin")]
    pub isin: String,
    #[serde(rename = "Sector")]
    pub sector: Option<String>,
    #[serde(rename = "SubSector")]
    pub sub_sector: Option<String>,
    #[serde(rename = "DispSym")]
    pub display_symbol: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SectorResponse {
    pub code: i32,
    #[serde(default)]
    pub data: Vec<SectorRow>,
}
