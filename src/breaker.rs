use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{ResilientHttpError, Result};

/// Observable breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the reset window elapses.
    Open,
    /// The reset window elapsed; the next call is let through as a trial.
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
///
/// One instance guards one logical upstream; share it behind an `Arc` between
/// clients that talk to the same upstream. All transitions happen under one
/// mutex, so concurrent failures are never lost. While the circuit is
/// half-open exactly one trial call is admitted at a time.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset: Duration::from_secs(30),
            state: Mutex::new(BreakerState::default()),
        }
    }
}

impl CircuitBreaker {
    /// Creates a breaker that opens after `failure_threshold` consecutive
    /// failed attempts and admits a trial call `reset` later.
    pub fn new(failure_threshold: u32, reset: Duration) -> Result<Self> {
        if failure_threshold < 1 {
            return Err(ResilientHttpError::Configuration(
                "failure_threshold must be >= 1".to_owned(),
            ));
        }
        Ok(Self {
            failure_threshold,
            reset,
            state: Mutex::new(BreakerState::default()),
        })
    }

    /// Consecutive failures that open the circuit.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Time an open circuit waits before admitting a trial.
    pub fn reset_after(&self) -> Duration {
        self.reset
    }

    /// Failures recorded since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// State as observed at `now`. Open turns half-open once `reset` has elapsed.
    pub fn state(&self, now: Instant) -> CircuitState {
        let state = self.lock();
        match state.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) if now.saturating_duration_since(opened_at) >= self.reset => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    /// Asks to perform one attempt at `now`.
    ///
    /// Returns the time left until a trial is admitted when the call must be
    /// rejected.
    pub fn try_acquire(&self, now: Instant) -> std::result::Result<BreakerPermit<'_>, Duration> {
        let mut state = self.lock();
        let Some(opened_at) = state.opened_at else {
            return Ok(BreakerPermit::new(self, false));
        };

        let elapsed = now.saturating_duration_since(opened_at);
        if elapsed < self.reset {
            return Err(self.reset - elapsed);
        }
        if state.trial_in_flight {
            return Err(Duration::ZERO);
        }

        state.trial_in_flight = true;
        #[cfg(feature = "tracing")]
        tracing::info!(
            failures = state.consecutive_failures,
            "circuit half-open, admitting trial call"
        );
        Ok(BreakerPermit::new(self, true))
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        #[cfg(feature = "tracing")]
        {
            if state.opened_at.is_some() {
                tracing::info!(trial, "circuit closed");
            }
        }
        let _ = trial;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    fn on_failure(&self, trial: bool, now: Instant) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if trial {
            state.trial_in_flight = false;
            state.opened_at = Some(now);
            #[cfg(feature = "tracing")]
            tracing::info!(
                failures = state.consecutive_failures,
                "trial call failed, circuit re-opened"
            );
        } else if state.opened_at.is_none() && state.consecutive_failures >= self.failure_threshold
        {
            state.opened_at = Some(now);
            #[cfg(feature = "tracing")]
            tracing::info!(
                failures = state.consecutive_failures,
                threshold = self.failure_threshold,
                "circuit opened"
            );
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for a single attempt; settle it with the attempt's outcome.
///
/// Dropping an unsettled trial permit (e.g. a cancelled call) frees the
/// half-open slot for the next caller without changing the counters.
#[derive(Debug)]
#[must_use = "a permit must be settled with the attempt outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.trial, now);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
