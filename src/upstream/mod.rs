//! Typed HTTP client for the upstream broker API (C2, spec.md §4.2).

pub mod classify;
pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use tracing::{instrument, warn};

use crate::error::UpstreamError;

use types::{EodResponse, HistoricalRequest, HistoricalResponse, MasterRow, SectorResponse, UpstreamErrorBody};

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The three operations C6/C8/C9 need from the upstream, abstracted so
/// tests substitute a mock (spec.md §4.2).
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_historical(
        &self,
        external_id: i32,
        exchange_segment: &str,
        instrument_kind: &str,
        from_date: &str,
        to_date: &str,
    ) -> Result<HistoricalResponse, UpstreamError>;

    async fn fetch_today_eod(
        &self,
        by_exchange_segment: &HashMap<String, Vec<i32>>,
    ) -> Result<EodResponse, UpstreamError>;

    /// Minimal historical request used as a connection test.
    async fn ping(&self) -> Result<bool, UpstreamError>;

    async fn fetch_master(&self) -> Result<Vec<MasterRow>, UpstreamError>;

    async fn fetch_sector(
        &self,
        exchange_code: &str,
        isins_csv_symbols: &str,
    ) -> Result<SectorResponse, UpstreamError>;
}

/// `reqwest`-backed production implementation. Holds one pooled,
/// keep-alive HTTP client per process (spec.md §5 "one HTTP client
/// with connection pooling").
pub struct ReqwestUpstreamClient {
    client: Client,
    historical_url: String,
    eod_url: String,
    master_url: String,
    sector_url: String,
}

impl ReqwestUpstreamClient {
    pub fn new(
        access_token: &str,
        client_id: &str,
        historical_url: impl Into<String>,
        eod_url: impl Into<String>,
        master_url: impl Into<String>,
        sector_url: impl Into<String>,
    ) -> Result<Self, UpstreamError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "access-token",
            reqwest::header::HeaderValue::from_str(access_token)
                .map_err(|e| UpstreamError::Auth(e.to_string()))?,
        );
        headers.insert(
            "client-id",
            reqwest::header::HeaderValue::from_str(client_id)
                .map_err(|e| UpstreamError::Auth(e.to_string()))?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(ReqwestUpstreamClient {
            client,
            historical_url: historical_url.into(),
            eod_url: eod_url.into(),
            master_url: master_url.into(),
            sector_url: sector_url.into(),
        })
    }

    /// Runs `attempt` up to `MAX_ATTEMPTS` times, retrying only on
    /// `RateLimitExceeded`/`Transient` with exponential backoff plus
    /// jitter (spec.md §4.2), matching the source's
    /// `wait_exponential(multiplier=1, min=1, max=16)` policy capped at
    /// 3 attempts.
    async fn with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let mut last_err = None;
        for attempt_no in 0..MAX_ATTEMPTS {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt_no + 1 < MAX_ATTEMPTS => {
                    let backoff = backoff_with_jitter(attempt_no);
                    warn!(attempt = attempt_no + 1, ?backoff, error = %e, "retrying upstream call");
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("loop always runs at least one attempt"))
    }
}

fn backoff_with_jitter(attempt_no: u32) -> Duration {
    let base = (1u64 << attempt_no).min(16);
    let jitter_ms = rand::rng().random_range(0..250);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

async fn decode_or_classify<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, UpstreamError> {
    if let Some(err) = classify::classify_status(response.status()) {
        return Err(err);
    }

    let bytes = response.bytes().await?;

    if let Ok(error_body) = serde_json::from_slice::<UpstreamErrorBody>(&bytes) {
        if error_body.status == "error" {
            return Err(classify::classify_error_body(&error_body));
        }
    }

    serde_json::from_slice::<T>(&bytes)
        .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    #[instrument(skip(self))]
    async fn fetch_historical(
        &self,
        external_id: i32,
        exchange_segment: &str,
        instrument_kind: &str,
        from_date: &str,
        to_date: &str,
    ) -> Result<HistoricalResponse, UpstreamError> {
        let body = HistoricalRequest {
            security_id: external_id.to_string(),
            exchange_segment: exchange_segment.to_string(),
            instrument: instrument_kind.to_string(),
            expiry_code: 0,
            oi: false,
            from_date: from_date.to_string(),
            to_date: to_date.to_string(),
        };

        self.with_retry(|| async {
            let response = self
                .client
                .post(&self.historical_url)
                .json(&body)
                .send()
                .await?;
            let parsed: HistoricalResponse = decode_or_classify(response).await?;

            let lengths = parsed.array_lengths();
            if lengths.iter().any(|&l| l != lengths[0]) {
                return Err(UpstreamError::MalformedResponse(format!(
                    "inconsistent array lengths in historical response: {lengths:?}"
                )));
            }
            Ok(parsed)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn fetch_today_eod(
        &self,
        by_exchange_segment: &HashMap<String, Vec<i32>>,
    ) -> Result<EodResponse, UpstreamError> {
        let payload: HashMap<&String, Vec<String>> = by_exchange_segment
            .iter()
            .map(|(segment, ids)| (segment, ids.iter().map(|id| id.to_string()).collect()))
            .collect();

        self.with_retry(|| async {
            let response = self.client.post(&self.eod_url).json(&payload).send().await?;
            decode_or_classify(response).await
        })
        .await
    }

    async fn ping(&self) -> Result<bool, UpstreamError> {
        let mut probe = HashMap::new();
        probe.insert("NSE_EQ".to_string(), vec![1333]);
        match self.fetch_today_eod(&probe).await {
            Ok(_) => Ok(true),
            Err(UpstreamError::Auth(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_master(&self) -> Result<Vec<MasterRow>, UpstreamError> {
        let response = self.client.get(&self.master_url).send().await?;
        if let Some(err) = classify::classify_status(response.status()) {
            return Err(err);
        }
        let bytes = response.bytes().await?;
        let mut reader = csv::Reader::from_reader(bytes.as_ref());
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: MasterRow =
                record.map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;
            rows.push(row);
        }
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn fetch_sector(
        &self,
        exchange_code: &str,
        isins_csv_symbols: &str,
    ) -> Result<SectorResponse, UpstreamError> {
        let payload = serde_json::json!({
            "data": {
                "fields": ["Sector", "SubSector"],
                "params": [
                    {"field": "Exch", "val": exchange_code},
                    {"field": "Sym", "val": isins_csv_symbols},
                ]
            }
        });

        self.with_retry(|| async {
            let response = self.client.post(&self.sector_url).json(&payload).send().await?;
            decode_or_classify(response).await
        })
        .await
    }
}
