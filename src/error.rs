//! Error types shared by every pipeline stage.
//!
//! Each stage talks to the outside world through its own narrow error
//! ([`FeedError`], [`BackendError`], [`StoreError`]) and converts into the
//! invocation-level [`PipelineError`] at its boundary. The invocation-level
//! variants are what operators and schedulers see in the response envelope.

use reqwest::StatusCode;
use thiserror::Error;

/// Invocation-level failure taxonomy.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A credential required by a mandatory capability is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure, timeout or DNS failure talking to an external service.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The external service answered, but with an error, an empty body,
    /// a malformed payload or a content-policy refusal.
    #[error("upstream rejected the request: {0}")]
    UpstreamRejected(String),

    /// Missing or invalid caller input.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A uniqueness constraint was violated on write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The page was fetched but no usable article text was found.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Unknown job id or trigger key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The article/job store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Stable machine-readable label used in response envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration_error",
            PipelineError::UpstreamUnavailable(_) => "upstream_unavailable",
            PipelineError::UpstreamRejected(_) => "upstream_rejected",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Conflict(_) => "conflict_error",
            PipelineError::Extraction(_) => "extraction_failure",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Storage(_) => "storage_error",
        }
    }

    /// HTTP status for the invocation surface.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::UpstreamUnavailable(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::UpstreamRejected(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Conflict(_) => StatusCode::CONFLICT,
            PipelineError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure stops a whole invocation instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Configuration(_))
    }
}

/// Outcome of fetching a single feed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("RSS feed not found (404). The URL may be wrong or the feed is no longer published.")]
    NotFound,

    #[error("Request timed out. The feed server took too long to respond; try again later.")]
    Timeout,

    #[error("Domain not found. Check that the feed URL is spelled correctly.")]
    Dns,

    #[error("The feed was read successfully but contains no articles.")]
    Empty,

    #[error("The feed server answered with HTTP {0}.")]
    Http(u16),

    #[error("Could not reach the feed server: {0}")]
    Network(String),

    #[error("The feed is not valid RSS or Atom: {0}")]
    Parse(String),

    #[error("Unknown feed id: {0}")]
    UnknownFeed(String),

    #[error("Not a valid feed URL: {0}")]
    InvalidUrl(String),
}

impl FeedError {
    /// Classify a transport error from reqwest.
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            return FeedError::Timeout;
        }
        if let Some(status) = e.status() {
            return FeedError::from_status(status);
        }
        if is_dns_failure(e) {
            return FeedError::Dns;
        }
        FeedError::Network(e.to_string())
    }

    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::NOT_FOUND {
            FeedError::NotFound
        } else {
            FeedError::Http(status.as_u16())
        }
    }
}

impl From<FeedError> for PipelineError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Timeout | FeedError::Dns | FeedError::Network(_) => {
                PipelineError::UpstreamUnavailable(e.to_string())
            }
            FeedError::UnknownFeed(_) | FeedError::InvalidUrl(_) => {
                PipelineError::Validation(e.to_string())
            }
            FeedError::NotFound | FeedError::Empty | FeedError::Http(_) | FeedError::Parse(_) => {
                PipelineError::UpstreamRejected(e.to_string())
            }
        }
    }
}

/// Transport-level failure of a generative or asset backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    #[error("backend returned an unusable response: {0}")]
    Rejected(String),

    #[error("backend refused the request under its content policy: {0}")]
    Refused(String),
}

impl BackendError {
    /// Map a reqwest failure; anything with an HTTP status is a rejection.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => BackendError::Rejected(format!("HTTP {status}")),
            None => BackendError::Unavailable(e.to_string()),
        }
    }
}

impl From<BackendError> for PipelineError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(msg) => PipelineError::UpstreamUnavailable(msg),
            BackendError::Rejected(msg) => PipelineError::UpstreamRejected(msg),
            BackendError::Refused(msg) => {
                PipelineError::UpstreamRejected(format!("refused by content policy: {msg}"))
            }
        }
    }
}

/// Failure inside an article/job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => PipelineError::Conflict(format!("duplicate {what}")),
            StoreError::NotFound(what) => PipelineError::NotFound(what),
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

/// Walk the error chain looking for resolver failures; reqwest does not
/// expose DNS errors as a dedicated kind.
fn is_dns_failure(e: &reqwest::Error) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(e);
    while let Some(err) = source {
        let text = err.to_string().to_lowercase();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
            || text.contains("no such host")
        {
            return true;
        }
        source = err.source();
    }
    false
}
