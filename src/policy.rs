use std::time::Duration;

use rand::Rng;
use reqwest::{header, header::HeaderMap, StatusCode};

use crate::{transport::TransportError, ResilientHttpError, Result};

/// Configures how many attempts a call gets and how long to wait between them.
///
/// The policy is an immutable value: build it once, share it across calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one. Must be `>= 1`.
    pub retries: u32,
    /// Delay before the first retry, in seconds.
    pub backoff_base: f64,
    /// Multiplier applied per attempt index.
    pub backoff_factor: f64,
    /// Upper bound of the uniform random jitter added to every delay, in seconds.
    pub backoff_jitter: f64,
    /// Whether `429 Too Many Requests` is retried.
    pub retry_on_429: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff_base: 0.5,
            backoff_factor: 2.0,
            backoff_jitter: 0.1,
            retry_on_429: false,
        }
    }
}

impl RetryPolicy {
    /// Policy with `retries` total attempts and default backoff.
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Sets the delay before the first retry, in seconds.
    pub fn with_backoff_base(mut self, seconds: f64) -> Self {
        self.backoff_base = seconds;
        self
    }

    /// Sets the per-attempt multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the jitter upper bound, in seconds. `0.0` disables jitter.
    pub fn with_backoff_jitter(mut self, seconds: f64) -> Self {
        self.backoff_jitter = seconds;
        self
    }

    /// Enables retrying `429 Too Many Requests`.
    pub fn with_retry_on_429(mut self, enabled: bool) -> Self {
        self.retry_on_429 = enabled;
        self
    }

    /// Rejects parameter combinations that cannot produce a sane retry loop.
    pub fn validate(&self) -> Result<()> {
        if self.retries < 1 {
            return Err(ResilientHttpError::Configuration(
                "retries must be >= 1".to_owned(),
            ));
        }
        if !self.backoff_base.is_finite() || self.backoff_base < 0.0 {
            return Err(ResilientHttpError::Configuration(
                "backoff_base must be >= 0".to_owned(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ResilientHttpError::Configuration(
                "backoff_factor must be >= 1".to_owned(),
            ));
        }
        if !self.backoff_jitter.is_finite() || self.backoff_jitter < 0.0 {
            return Err(ResilientHttpError::Configuration(
                "backoff_jitter must be >= 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Delay before retrying after attempt `attempt` (0-based):
    /// `backoff_base * backoff_factor^attempt` plus jitter in `[0, backoff_jitter]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with(attempt, &mut rand::thread_rng())
    }

    /// [`Self::backoff_delay`] with a caller-supplied random source.
    pub fn backoff_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.min(64) as i32;
        let mut seconds = self.backoff_base * self.backoff_factor.powi(exp);
        if self.backoff_jitter > 0.0 {
            seconds += rng.gen_range(0.0..=self.backoff_jitter);
        }
        seconds_to_duration(seconds)
    }

    /// Classifies a completed HTTP attempt.
    pub fn classify_status(&self, status: StatusCode, headers: &HeaderMap) -> AttemptOutcome {
        if status.is_success() {
            return AttemptOutcome::Success;
        }
        if status == StatusCode::TOO_MANY_REQUESTS && self.retry_on_429 {
            return AttemptOutcome::Retryable {
                retry_after: parse_retry_after(headers),
            };
        }
        AttemptOutcome::Terminal
    }

    /// Classifies a failed transport attempt. Only network errors are retried.
    pub fn classify_transport(&self, error: &TransportError) -> AttemptOutcome {
        match error {
            TransportError::Network(_) => AttemptOutcome::Retryable { retry_after: None },
            TransportError::Timeout(_) | TransportError::Replay(_) => AttemptOutcome::Terminal,
        }
    }

    /// Whether attempt `attempt` (0-based) leaves room for another one.
    pub fn has_budget_after(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.retries
    }
}

/// Result of classifying one attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttemptOutcome {
    Success,
    /// Worth another attempt. `retry_after` overrides the computed backoff.
    Retryable { retry_after: Option<Duration> },
    Terminal,
}

/// Parses `Retry-After` given in (possibly fractional) seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    let seconds = raw.trim().parse::<f64>().ok()?;
    seconds.is_finite().then(|| seconds_to_duration(seconds))
}

/// Negative and NaN map to zero; overflow and `+inf` saturate.
fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
