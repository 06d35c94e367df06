use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Map, Value as JsonValue};
use url::Url;

use crate::{
    attempt::{
        decode_json, expect_list, expect_object, resolve_url, system_clock, CallContext,
        CallSettings, Clock, Step,
    },
    breaker::CircuitBreaker,
    event::{noop_hook, ClientEvent, EventHook},
    pagination::{next_page_url, PaginationState},
    transport::{HttpResponse, ReqwestTransport, Transport, TransportError},
    CallOptions, ClientOptions, ResilientHttpError, Result, RetryPolicy,
};

pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cooperative sleep used between retries.
pub type AsyncSleep = Arc<dyn Fn(Duration) -> SleepFuture + Send + Sync>;

fn tokio_sleep() -> AsyncSleep {
    Arc::new(|duration| -> SleepFuture { Box::pin(tokio::time::sleep(duration)) })
}

/// Async JSON client with retries, circuit breaking and pagination.
///
/// Retry sleeps are the only points where a call yields besides the
/// transport itself. Dropping the returned future cancels the call; no
/// error is produced for it.
#[derive(Clone)]
pub struct HttpClient<T = ReqwestTransport> {
    transport: T,
    options: ClientOptions,
    policy: RetryPolicy,
    authorization: Option<HeaderValue>,
    breaker: Option<Arc<CircuitBreaker>>,
    hook: EventHook,
    clock: Clock,
    sleep: AsyncSleep,
}

impl<T> fmt::Debug for HttpClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
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

impl HttpClient<ReqwestTransport> {
    /// Creates a client over a default `reqwest` transport.
    pub fn new() -> Self {
        Self::with_transport(ReqwestTransport::new())
    }

    /// Creates a client from environment variables.
    ///
    /// Reads:
    /// - `RESILIENT_HTTP_BASE_URL`: base URL relative paths resolve against
    /// - `RESILIENT_HTTP_TOKEN`: optional bearer token (prefix optional)
    /// - `RESILIENT_HTTP_TIMEOUT_MS`: optional per-attempt timeout
    /// - `RESILIENT_HTTP_RETRIES`: optional total attempts per call
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

impl Default for HttpClient<ReqwestTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HttpClient<T> {
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
            sleep: tokio_sleep(),
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

    /// Shares a breaker with every call of this client (and of any other
    /// client given the same `Arc`).
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sends `authorization` verbatim as the `Authorization` header.
    pub fn with_authorization(mut self, authorization: &str) -> Result<Self> {
        self.authorization = Some(sensitive_header(authorization)?);
        Ok(self)
    }

    /// Sends `Authorization: Bearer <token>`, adding the prefix when missing.
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

    /// Replaces the sleep awaited between retries.
    pub fn with_sleep<F, Fut>(mut self, sleep: F) -> Self
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.sleep = Arc::new(move |duration| -> SleepFuture { Box::pin(sleep(duration)) });
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

impl<T: Transport> HttpClient<T> {
    /// Fetches `path` and requires a JSON object.
    pub async fn get_json_dict(&self, path: &str) -> Result<Map<String, JsonValue>> {
        self.get_json_dict_with(path, &CallOptions::default()).await
    }

    /// [`Self::get_json_dict`] with per-call overrides.
    pub async fn get_json_dict_with(
        &self,
        path: &str,
        call: &CallOptions,
    ) -> Result<Map<String, JsonValue>> {
        let ctx = self.context(call)?;
        let url = resolve_url(self.options.base_url.as_ref(), path)?;
        let (object, _) = self.fetch_json(&ctx, &url, expect_object).await?;
        Ok(object)
    }

    /// Fetches `path` and requires a JSON array.
    pub async fn get_json_list(&self, path: &str) -> Result<Vec<JsonValue>> {
        self.get_json_list_with(path, &CallOptions::default()).await
    }

    /// [`Self::get_json_list`] with per-call overrides.
    pub async fn get_json_list_with(
        &self,
        path: &str,
        call: &CallOptions,
    ) -> Result<Vec<JsonValue>> {
        let ctx = self.context(call)?;
        let url = resolve_url(self.options.base_url.as_ref(), path)?;
        let (items, _) = self.fetch_json(&ctx, &url, expect_list).await?;
        Ok(items)
    }

    /// Fetches a JSON array and every page reachable via `Link: rel="next"`,
    /// concatenated in page order.
    pub async fn get_json_list_paginated(&self, path: &str) -> Result<Vec<JsonValue>> {
        self.get_json_list_paginated_with(path, &CallOptions::default())
            .await
    }

    /// Paginated fetch with per-call overrides. All pages share one request id.
    pub async fn get_json_list_paginated_with(
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
            let (page, headers) = self.fetch_json(&ctx, &url, expect_list).await?;
            items.extend(page);

            if state.limit_reached() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    request_id = %ctx.request_id,
                    pages = state.pages(),
                    "page limit reached"
                );
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

    async fn fetch_json<V>(
        &self,
        ctx: &CallContext<'_>,
        url: &Url,
        shape: fn(JsonValue) -> Result<V>,
    ) -> Result<(V, HeaderMap)> {
        let (attempts, result) = self.fetch(ctx, url).await;
        let result = result.and_then(|response| {
            let value = shape(decode_json(&response)?)?;
            Ok((value, response.headers))
        });
        ctx.complete(url, attempts, result)
    }

    /// Runs the retry loop for one URL. Returns the number of attempts sent.
    async fn fetch(&self, ctx: &CallContext<'_>, url: &Url) -> (u32, Result<HttpResponse>) {
        let mut attempt = 0u32;
        loop {
            let permit = match ctx.admit(attempt, url) {
                Ok(permit) => permit,
                Err(err) => return (attempt, Err(err)),
            };

            let request = ctx.request(url);
            let timeout = request.timeout;
            let outcome = match tokio::time::timeout(timeout, self.transport.send(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout(format!(
                    "no response within {} ms",
                    timeout.as_millis()
                ))),
            };

            match ctx.settle(attempt, url, permit, outcome) {
                Step::Done(response) => return (attempt + 1, Ok(response)),
                Step::Retry(delay) => {
                    (self.sleep)(delay).await;
                    attempt += 1;
                }
                Step::Fail(err) => return (attempt + 1, Err(err)),
            }
        }
    }
}

pub(crate) struct EnvSettings {
    pub(crate) options: ClientOptions,
    pub(crate) policy: RetryPolicy,
    pub(crate) token: Option<String>,
}

impl EnvSettings {
    pub(crate) fn read() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("RESILIENT_HTTP_BASE_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ResilientHttpError::Configuration(
                    "missing RESILIENT_HTTP_BASE_URL environment variable".to_owned(),
                )
            })?;
        let base_url = Url::parse(base_url.trim()).map_err(|err| {
            ResilientHttpError::Configuration(format!("invalid RESILIENT_HTTP_BASE_URL: {err}"))
        })?;

        let mut options = ClientOptions::default().with_base_url(base_url);
        if let Some(timeout_ms) = parse_env_number::<u64>(&lookup, "RESILIENT_HTTP_TIMEOUT_MS")? {
            options = options.with_timeout(Duration::from_millis(timeout_ms));
        }

        let mut policy = RetryPolicy::default();
        if let Some(retries) = parse_env_number::<u32>(&lookup, "RESILIENT_HTTP_RETRIES")? {
            policy.retries = retries;
        }
        policy.validate()?;

        let token = lookup("RESILIENT_HTTP_TOKEN").filter(|value| !value.trim().is_empty());
        Ok(Self {
            options,
            policy,
            token,
        })
    }
}

fn parse_env_number<N: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<N>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<N>()
            .map(Some)
            .map_err(|_| ResilientHttpError::Configuration(format!("{key} must be an integer"))),
    }
}

pub(crate) fn sensitive_header(value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        ResilientHttpError::Configuration("authorization is not a valid header value".to_owned())
    })?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
