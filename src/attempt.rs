use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value as JsonValue;
use url::Url;

use crate::{
    breaker::{BreakerPermit, CircuitBreaker},
    event::{log_event, AttemptErrorKind, ClientEvent, ClientEventKind, EventHook},
    policy::{AttemptOutcome, RetryPolicy},
    transport::{HttpRequest, HttpResponse, ReplayError, TransportError},
    ResilientHttpError, Result,
};

/// Source of "now" for circuit breaker decisions.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

pub(crate) fn system_clock() -> Clock {
    Arc::new(Instant::now)
}

/// Next move of a retry loop after one attempt.
pub(crate) enum Step {
    Done(HttpResponse),
    Retry(Duration),
    Fail(ResilientHttpError),
}

/// State shared by every attempt and page of one logical call.
pub(crate) struct CallContext<'a> {
    pub(crate) request_id: String,
    headers: HeaderMap,
    timeout: Duration,
    policy: &'a RetryPolicy,
    breaker: Option<&'a CircuitBreaker>,
    hook: &'a EventHook,
    clock: &'a Clock,
}

pub(crate) struct CallSettings<'a> {
    pub(crate) default_headers: &'a HeaderMap,
    pub(crate) authorization: Option<&'a HeaderValue>,
    pub(crate) trace_header: Option<&'a str>,
    pub(crate) timeout: Duration,
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) breaker: Option<&'a CircuitBreaker>,
    pub(crate) hook: &'a EventHook,
    pub(crate) clock: &'a Clock,
}

impl<'a> CallContext<'a> {
    /// Validates the policy and prepares headers for one logical call.
    ///
    /// The caller's default headers are copied, never modified.
    pub(crate) fn new(settings: CallSettings<'a>, request_id: Option<&str>) -> Result<Self> {
        settings.policy.validate()?;

        let request_id = request_id
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut headers = settings.default_headers.clone();
        if let Some(authorization) = settings.authorization {
            headers.insert(reqwest::header::AUTHORIZATION, authorization.clone());
        }
        if let Some(name) = settings.trace_header {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ResilientHttpError::Configuration(format!("invalid trace header name '{name}'"))
            })?;
            let value = HeaderValue::from_str(&request_id).map_err(|_| {
                ResilientHttpError::Configuration(format!(
                    "request id '{request_id}' is not a valid header value"
                ))
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            request_id,
            headers,
            timeout: settings.timeout,
            policy: settings.policy,
            breaker: settings.breaker,
            hook: settings.hook,
            clock: settings.clock,
        })
    }

    pub(crate) fn request(&self, url: &Url) -> HttpRequest {
        let mut request = HttpRequest::get(url.clone(), self.timeout);
        request.headers = self.headers.clone();
        request
    }

    /// Checks the breaker before attempt `attempt`.
    pub(crate) fn admit(&self, attempt: u32, url: &Url) -> Result<Option<BreakerPermit<'a>>> {
        let Some(breaker) = self.breaker else {
            return Ok(None);
        };
        match breaker.try_acquire((self.clock)()) {
            Ok(permit) => Ok(Some(permit)),
            Err(retry_after) => {
                self.emit(
                    url,
                    ClientEventKind::AttemptError {
                        attempt,
                        error: AttemptErrorKind::CircuitOpen,
                    },
                );
                Err(ResilientHttpError::CircuitOpen { retry_after })
            }
        }
    }

    /// Classifies the outcome of attempt `attempt` and settles its permit.
    pub(crate) fn settle(
        &self,
        attempt: u32,
        url: &Url,
        permit: Option<BreakerPermit<'a>>,
        outcome: std::result::Result<HttpResponse, TransportError>,
    ) -> Step {
        let (classified, error_kind) = match &outcome {
            Ok(response) => {
                let classified = self
                    .policy
                    .classify_status(response.status, &response.headers);
                (classified, AttemptErrorKind::HttpStatus(response.status.as_u16()))
            }
            Err(err) => (self.policy.classify_transport(err), transport_error_kind(err)),
        };

        let outcome = match outcome {
            Ok(response) if classified == AttemptOutcome::Success => {
                if let Some(permit) = permit {
                    permit.record_success();
                }
                return Step::Done(response);
            }
            other => other,
        };

        if let Some(permit) = permit {
            permit.record_failure((self.clock)());
        }
        self.emit(
            url,
            ClientEventKind::AttemptError {
                attempt,
                error: error_kind,
            },
        );

        if let AttemptOutcome::Retryable { retry_after } = classified {
            if self.policy.has_budget_after(attempt) {
                let duration = retry_after.unwrap_or_else(|| self.policy.backoff_delay(attempt));
                self.emit(url, ClientEventKind::Sleep { attempt, duration });
                return Step::Retry(duration);
            }
        }

        Step::Fail(match outcome {
            Ok(response) => ResilientHttpError::Http {
                status: response.status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            },
            Err(err) => into_client_error(err, url),
        })
    }

    /// Emits the completion event for one fetch and hands back its result.
    pub(crate) fn complete<T>(&self, url: &Url, attempts: u32, result: Result<T>) -> Result<T> {
        self.emit(
            url,
            ClientEventKind::Complete {
                ok: result.is_ok(),
                attempts,
            },
        );
        result
    }

    fn emit(&self, url: &Url, kind: ClientEventKind) {
        let event = ClientEvent {
            request_id: self.request_id.clone(),
            method: "GET".to_owned(),
            url: url.to_string(),
            kind,
        };
        log_event(&event);
        (self.hook)(&event);
    }
}

fn transport_error_kind(err: &TransportError) -> AttemptErrorKind {
    match err {
        TransportError::Timeout(_) => AttemptErrorKind::Timeout,
        TransportError::Network(_) => AttemptErrorKind::RequestError,
        TransportError::Replay(_) => AttemptErrorKind::Replay,
    }
}

fn into_client_error(err: TransportError, url: &Url) -> ResilientHttpError {
    match err {
        TransportError::Timeout(_) => ResilientHttpError::Timeout {
            url: url.to_string(),
        },
        TransportError::Network(message) => ResilientHttpError::Request {
            url: url.to_string(),
            message,
        },
        TransportError::Replay(ReplayError::Exhausted { method, url }) => {
            ResilientHttpError::CassetteExhausted { method, url }
        }
        TransportError::Replay(ReplayError::Mismatch { expected, actual }) => {
            ResilientHttpError::CassetteMismatch { expected, actual }
        }
    }
}

/// Resolves a caller path against the optional base URL.
pub(crate) fn resolve_url(base: Option<&Url>, path: &str) -> Result<Url> {
    let resolved = match base {
        Some(base) => base.join(path),
        None => Url::parse(path),
    };
    resolved
        .map_err(|err| ResilientHttpError::Configuration(format!("invalid url '{path}': {err}")))
}

pub(crate) fn decode_json(response: &HttpResponse) -> Result<JsonValue> {
    serde_json::from_slice(&response.body).map_err(|err| {
        ResilientHttpError::Decode(format!(
            "invalid json response: {err}; body: {}",
            String::from_utf8_lossy(&response.body)
        ))
    })
}

pub(crate) fn expect_object(value: JsonValue) -> Result<serde_json::Map<String, JsonValue>> {
    match value {
        JsonValue::Object(map) => Ok(map),
        _ => Err(ResilientHttpError::UnexpectedShape { expected: "object" }),
    }
}

pub(crate) fn expect_list(value: JsonValue) -> Result<Vec<JsonValue>> {
    match value {
        JsonValue::Array(items) => Ok(items),
        _ => Err(ResilientHttpError::UnexpectedShape { expected: "list" }),
    }
}
