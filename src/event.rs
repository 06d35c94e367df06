use std::{sync::Arc, time::Duration};

/// Classification of a failed attempt, as reported in
/// [`ClientEventKind::AttemptError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptErrorKind {
    /// Connection-level transport error.
    RequestError,
    Timeout,
    /// Non-2xx status.
    HttpStatus(u16),
    /// The circuit breaker rejected the attempt.
    CircuitOpen,
    /// A cassette could not satisfy the request.
    Replay,
}

impl AttemptErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestError => "request_error",
            Self::Timeout => "timeout",
            Self::HttpStatus(_) => "http_status",
            Self::CircuitOpen => "circuit_open",
            Self::Replay => "replay",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientEventKind {
    AttemptError {
        /// 0-based attempt index.
        attempt: u32,
        error: AttemptErrorKind,
    },
    Sleep {
        attempt: u32,
        duration: Duration,
    },
    Complete {
        ok: bool,
        attempts: u32,
    },
}

/// Observation emitted while a logical call runs.
///
/// Every event of one call carries the same `request_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientEvent {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub kind: ClientEventKind,
}

impl ClientEvent {
    pub fn sleep_duration(&self) -> Option<Duration> {
        match self.kind {
            ClientEventKind::Sleep { duration, .. } => Some(duration),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.kind, ClientEventKind::Complete { .. })
    }
}

/// Observer invoked synchronously for every [`ClientEvent`].
pub type EventHook = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

pub(crate) fn noop_hook() -> EventHook {
    Arc::new(|_event: &ClientEvent| {})
}

pub(crate) fn log_event(event: &ClientEvent) {
    #[cfg(feature = "tracing")]
    {
        match &event.kind {
            ClientEventKind::AttemptError { attempt, error } => tracing::warn!(
                request_id = %event.request_id,
                url = %event.url,
                attempt,
                error = error.as_str(),
                "attempt failed"
            ),
            ClientEventKind::Sleep { attempt, duration } => tracing::debug!(
                request_id = %event.request_id,
                url = %event.url,
                attempt,
                delay_ms = duration.as_millis() as u64,
                "retrying after backoff"
            ),
            ClientEventKind::Complete { ok: true, attempts } => tracing::debug!(
                request_id = %event.request_id,
                url = %event.url,
                attempts,
                "request completed"
            ),
            ClientEventKind::Complete { ok: false, attempts } => tracing::warn!(
                request_id = %event.request_id,
                url = %event.url,
                attempts,
                "request failed"
            ),
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = event;
}
