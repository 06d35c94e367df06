//! `resilient-http` is a JSON HTTP client built for flaky upstreams.
//!
//! Each logical call runs a retry loop governed by a [`RetryPolicy`]:
//! network errors are retried with exponential backoff and jitter, `429`
//! optionally honours `Retry-After`, timeouts and other statuses fail at
//! once. A shared [`CircuitBreaker`] short-circuits calls to an upstream
//! that keeps failing. Paginated endpoints are followed through
//! `Link: rel="next"` headers with cycle detection.
//!
//! Operations:
//! - [`HttpClient::get_json_dict`]
//! - [`HttpClient::get_json_list`]
//! - [`HttpClient::get_json_list_paginated`]
//!
//! The HTTP engine sits behind the [`Transport`] trait, which the
//! [`cassette`] decorators wrap to record and deterministically replay
//! traffic in tests. [`blocking::BlockingHttpClient`] offers the same
//! operations for thread-based code.

mod attempt;
mod breaker;
mod client;
mod error;
mod event;
mod options;
mod policy;

#[cfg(feature = "blocking")]
pub mod blocking;
pub mod cassette;
pub mod pagination;
pub mod transport;

pub use attempt::Clock;
pub use breaker::{BreakerPermit, CircuitBreaker, CircuitState};
pub use client::{AsyncSleep, HttpClient, SleepFuture};
pub use error::ResilientHttpError;
pub use event::{AttemptErrorKind, ClientEvent, ClientEventKind, EventHook};
pub use options::{CallOptions, ClientOptions};
pub use policy::{parse_retry_after, AttemptOutcome, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, Transport, TransportError};

pub type Result<T> = std::result::Result<T, ResilientHttpError>;
