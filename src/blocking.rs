//! Thread-blocking client with the same semantics as [`crate::HttpClient`].
//!
//! Retry sleeps block the calling thread. The per-attempt timeout is
//! enforced by the transport, which receives it in [`HttpRequest::timeout`].
//!
//! [`HttpRequest::timeout`]: crate::transport::HttpRequest::timeout

use std::{fmt, sync::Arc, time::Duration};

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Map, Value as JsonValue};
use url::Url;

use crate::{
    attempt::{
        decode_json, expect_list, expect_object, resolve_url, system_clock, CallContext,
        CallSettings, Clock, Step,
    },
    breaker::CircuitBreaker,
    client::{normalize_bearer_authorization, sensitive_header, EnvSettings},
    event::{noop_hook, ClientEvent, EventHook},
    pagination::{next_page_url, PaginationState},
    transport::{BlockingTransport, HttpResponse, ReqwestBlockingTransport},
    CallOptions, ClientOptions, Result, RetryPolicy,
};

/// Blocking sleep used between retries.
pub type BlockingSleep = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Clone)]
pub struct BlockingHttpClient<T = ReqwestBlockingTransport> {
    transport: T,
    options: ClientOptions,
    policy: RetryPolicy,
    authorization: Option<HeaderValue>,
    breaker: Option<Arc<CircuitBreaker>>,
    hook: EventHook,
    clock: Clock,
    sleep: BlockingSleep,
}

impl<T> fmt::Debug for BlockingHttpClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingHttpClient")
            .field("options", &self.options)
            .field("policy", &self.policy)
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "<redacted>"),
            )
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl BlockingHttpClient<ReqwestBlockingTransport> {
    /// Creates a client over a default `reqwest::blocking` transport.
    ///
    /// Must not be called from inside an async runtime.
    pub fn new() -> Self {
        Self::with_transport(ReqwestBlockingTransport::new())
    }

    /// Environment constructor; reads the same variables as
    /// [`crate::HttpClient::from_env`].
    pub fn from_env() -> Result<Self> {
        let settings = EnvSettings::read()?;
        let mut client = Self::new()
            .with_options(settings.options)
            .with_policy(settings.policy);
        if let Some(token) = settings.token {
            client = client.with_bearer_token(&token)?;
        }
        Ok(client)
    }
}

impl Default for BlockingHttpClient<ReqwestBlockingTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingHttpClient<T> {
    /// Creates a client over `transport` with default options and policy.
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            options: ClientOptions::default(),
            policy: RetryPolicy::default(),
            authorization: None,
            breaker: None,
            hook: noop_hook(),
            clock: system_clock(),
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Applies client options such as timeout, trace header and base URL.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shares `breaker` with this client.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sends `authorization` verbatim as the `Authorization` header.
    pub fn with_authorization(mut self, authorization: &str) -> Result<Self> {
        self.authorization = Some(sensitive_header(authorization)?);
        Ok(self)
    }

    /// Sends `token` as a bearer token. A `Bearer ` prefix is optional.
    pub fn with_bearer_token(self, token: &str) -> Result<Self> {
        let authorization = normalize_bearer_authorization(token);
        self.with_authorization(&authorization)
    }

    /// Registers a callback invoked with every event.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.hook = Arc::new(hook);
        self
    }

    /// Replaces the clock used for circuit breaker decisions.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> std::time::Instant + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Replaces the thread sleep used between retries.
    pub fn with_sleep<F>(mut self, sleep: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleep = Arc::new(sleep);
        self
    }

    /// Returns the configured client options.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Returns the configured retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn context(&self, call: &CallOptions) -> Result<CallContext<'_>> {
        CallContext::new(
            CallSettings {
                default_headers: &self.options.default_headers,
                authorization: self.authorization.as_ref(),
                trace_header: self.options.trace_header.as_deref(),
                timeout: self.options.timeout,
                policy: &self.policy,
                breaker: self.breaker.as_deref(),
                hook: &self.hook,
                clock: &self.clock,
            },
            call.request_id.as_deref(),
        )
    }
}

impl<T: BlockingTransport> BlockingHttpClient<T> {
    /// Fetches `path` and requires a JSON object.
    pub fn get_json_dict(&self, path: &str) -> Result<Map<String, JsonValue>> {
        self.get_json_dict_with(path, &CallOptions::default())
    }

    /// [`Self::get_json_dict`] with per-call overrides.
    pub fn get_json_dict_with(
        &self,
        path: &str,
        call: &CallOptions,
    ) -> Result<Map<String, JsonValue>> {
        let ctx = self.context(call)?;
        let url = resolve_url(self.options.base_url.as_ref(), path)?;
        self.fetch_json(&ctx, &url, expect_object)
            .map(|(object, _)| object)
    }

    /// Fetches `path` and requires a JSON array.
    pub fn get_json_list(&self, path: &str) -> Result<Vec<JsonValue>> {
        self.get_json_list_with(path, &CallOptions::default())
    }

    /// [`Self::get_json_list`] with per-call overrides.
    pub fn get_json_list_with(&self, path: &str, call: &CallOptions) -> Result<Vec<JsonValue>> {
        let ctx = self.context(call)?;
        let url = resolve_url(self.options.base_url.as_ref(), path)?;
        self.fetch_json(&ctx, &url, expect_list)
            .map(|(items, _)| items)
    }

    /// Fetches a JSON array and every page linked via `rel="next"`.
    pub fn get_json_list_paginated(&self, path: &str) -> Result<Vec<JsonValue>> {
        self.get_json_list_paginated_with(path, &CallOptions::default())
    }

    /// Paginated fetch with per-call overrides. All pages share one request id.
    pub fn get_json_list_paginated_with(
        &self,
        path: &str,
        call: &CallOptions,
    ) -> Result<Vec<JsonValue>> {
        let ctx = self.context(call)?;
        let mut state = PaginationState::new(call.max_pages.unwrap_or(self.options.max_pages))?;
        let mut url = resolve_url(self.options.base_url.as_ref(), path)?;
        let mut items = Vec::new();

        loop {
            if let Err(err) = state.visit(&url) {
                return ctx.complete(&url, 0, Err(err));
            }
            let (page, headers) = self.fetch_json(&ctx, &url, expect_list)?;
            items.extend(page);

            if state.limit_reached() {
                break;
            }
            match next_page_url(&url, &headers) {
                Ok(Some(next)) => url = next,
                Ok(None) => break,
                Err(err) => return ctx.complete(&url, 0, Err(err)),
            }
        }

        Ok(items)
    }

    fn fetch_json<V>(
        &self,
        ctx: &CallContext<'_>,
        url: &Url,
        shape: fn(JsonValue) -> Result<V>,
    ) -> Result<(V, HeaderMap)> {
        let (attempts, result) = self.fetch(ctx, url);
        let result = result.and_then(|response| {
            let value = shape(decode_json(&response)?)?;
            Ok((value, response.headers))
        });
        ctx.complete(url, attempts, result)
    }

    fn fetch(&self, ctx: &CallContext<'_>, url: &Url) -> (u32, Result<HttpResponse>) {
        let mut attempt = 0u32;
        loop {
            let permit = match ctx.admit(attempt, url) {
                Ok(permit) => permit,
                Err(err) => return (attempt, Err(err)),
            };

            let outcome = self.transport.send(ctx.request(url));
            match ctx.settle(attempt, url, permit, outcome) {
                Step::Done(response) => return (attempt + 1, Ok(response)),
                Step::Retry(delay) => {
                    (self.sleep)(delay);
                    attempt += 1;
                }
                Step::Fail(err) => return (attempt + 1, Err(err)),
            }
        }
    }
}
