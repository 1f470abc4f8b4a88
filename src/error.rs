use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

/// Top-level error for the ingestion core. Each subsystem gets its own
/// enum so call sites can match narrowly; this aggregates them for
/// callers (the orchestrator, the CLI) that only care about the
/// `error_category` used to populate `TaskRun.error_message`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    RateLimiter(#[from] RateLimiterError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("operation was cancelled")]
    Cancelled,
}

impl IngestError {
    /// Maps to the `error_category` string stamped on a `TaskRun` per spec.md §7.
    pub fn error_category(&self) -> &'static str {
        match self {
            IngestError::Upstream(UpstreamError::Auth(_)) => "auth",
            IngestError::Upstream(_) => "upstream",
            IngestError::Parse(_) => "malformed_response",
            IngestError::Store(_) => "store",
            IngestError::RateLimiter(_) => "rate_limiter",
            IngestError::Catalog(_) => "catalog",
            IngestError::Orchestrator(OrchestratorError::LostHeartbeat) => "lost_heartbeat",
            IngestError::Orchestrator(_) => "orchestrator",
            IngestError::Cancelled => "cancelled",
        }
    }

    /// Per spec.md §7: some errors are recoverable at the call site
    /// (per-instrument / per-chunk failure) and must never fail the
    /// enclosing job outright.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Upstream(UpstreamError::Auth(_))
                | IngestError::RateLimiter(RateLimiterError::Unavailable(_))
        )
    }
}

/// Errors classifying upstream HTTP responses (spec.md §4.2, §6).
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("upstream returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("request to upstream timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to build upstream request: {0}")]
    Request(#[from] reqwest::Error),
}

impl UpstreamError {
    /// Per spec.md §7: `RateLimitExceeded` and `Transient` are retried
    /// with backoff inside the client; everything else bubbles up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimitExceeded(_) | UpstreamError::Transient(_)
        )
    }
}

/// Errors raised while validating/normalizing upstream payloads (C3).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("parallel arrays have inconsistent lengths: {0:?}")]
    InconsistentArrayLengths(Vec<usize>),

    #[error("invalid OHLC relationship: open={open} high={high} low={low} close={close}")]
    InvalidOhlc {
        open: String,
        high: String,
        low: String,
        close: String,
    },

    #[error("negative or zero volume: {0}")]
    InvalidVolume(i64),

    #[error("no security mapping for external id {0}")]
    UnknownExternalId(String),

    #[error("failed to convert epoch timestamp {0}")]
    BadTimestamp(i64),
}

/// Errors raised by the persistence layer (C4/C5/C10 repositories).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("unique constraint violated on both keys for {0}")]
    ConstraintViolation(String),

    #[error("date_from {from} is after date_to {to}")]
    InvalidRange { from: String, to: String },
}

/// Errors from the distributed rate limiter's shared-state backend.
#[derive(Debug, Error)]
pub enum RateLimiterError {
    #[error("shared rate-limit state unreachable: {0}")]
    Unavailable(String),

    #[error("acquire timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from the instrument catalog / sector enrichment services.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("master file row missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("external_id '{0}' is not numeric")]
    NonNumericExternalId(String),

    #[error("exchange code '{0}' is not supported")]
    UnsupportedExchange(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the job orchestrator's lifecycle state machine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition { from: String, to: String },

    #[error("task_type '{0}' is not registered")]
    UnknownTaskType(String),

    #[error("task run {0} not found")]
    NotFound(String),

    #[error("heartbeat for task run {0} went stale")]
    LostHeartbeat,

    #[error("invalid task parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
