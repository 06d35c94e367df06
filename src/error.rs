use std::time::Duration;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ResilientHttpError {
    /// Invalid client, policy or breaker configuration. No request was sent.
    #[error("{0}")]
    Configuration(String),
    /// An attempt exceeded its timeout. Timeouts are never retried.
    #[error("request timed out")]
    Timeout {
        /// URL of the request that timed out.
        url: String,
    },
    /// Network-level failure, reported after the retry budget is spent.
    #[error("request failed")]
    Request {
        /// URL of the failing request.
        url: String,
        /// Message of the last observed transport error.
        message: String,
    },
    /// Non-success HTTP status code with raw response body.
    #[error("non-2xx response: {status}")]
    Http { status: u16, body: String },
    /// Response body is not valid JSON.
    #[error("decode error: {0}")]
    Decode(String),
    /// Response JSON decoded but has the wrong top-level shape.
    #[error("expected json {expected}")]
    UnexpectedShape {
        /// `"object"` or `"list"`.
        expected: &'static str,
    },
    /// The circuit breaker rejected the call without any network I/O.
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
    /// A `Link: rel="next"` relation pointed at an already fetched page.
    #[error("pagination cycle detected at {url}")]
    PaginationCycle { url: String },
    /// Replay was asked for a request after every recorded entry was used.
    #[error("cassette exhausted: no recorded entry left for {method} {url}")]
    CassetteExhausted { method: String, url: String },
    /// The next recorded entry does not describe the incoming request.
    #[error("cassette mismatch: expected {expected}, got {actual}")]
    CassetteMismatch { expected: String, actual: String },
    /// A replay finished with recorded entries left over.
    #[error("cassette not exhausted: {remaining} recorded entries unused")]
    CassetteNotExhausted { remaining: usize },
    /// Cassette file could not be read or written.
    #[error("cassette io error: {0}")]
    Io(#[from] std::io::Error),
    /// Cassette file is not a valid cassette document.
    #[error("cassette format error: {0}")]
    CassetteFormat(#[from] serde_json::Error),
}

impl ResilientHttpError {
    /// Returns `true` for the request-failure family: exhausted network
    /// retries, non-2xx statuses, malformed bodies, pagination cycles and
    /// cassette replay failures.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            Self::Request { .. }
                | Self::Http { .. }
                | Self::Decode(_)
                | Self::PaginationCycle { .. }
                | Self::CassetteExhausted { .. }
                | Self::CassetteMismatch { .. }
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
