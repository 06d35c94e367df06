use std::time::Duration;

use reqwest::header::HeaderMap;
use url::Url;

/// Configures timeouts, tracing and base URL resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Header that carries the per-call request id, e.g. `X-Request-ID`.
    pub trace_header: Option<String>,
    /// Headers added to every request. The client never mutates this map.
    pub default_headers: HeaderMap,
    /// Base URL relative paths are resolved against.
    pub base_url: Option<Url>,
    /// Page limit applied by the paginated operations unless overridden.
    pub max_pages: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            trace_header: None,
            default_headers: HeaderMap::new(),
            base_url: None,
            max_pages: 100,
        }
    }
}

impl ClientOptions {
    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends the request id in header `name` on every attempt.
    pub fn with_trace_header(mut self, name: impl Into<String>) -> Self {
        self.trace_header = Some(name.into());
        self
    }

    /// Replaces the headers sent with every request.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Resolves relative paths against `base_url`.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Sets the default page limit for paginated calls.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }
}

/// Per-call overrides.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallOptions {
    /// Request id to use instead of a generated one.
    pub request_id: Option<String>,
    /// Page limit for paginated calls.
    pub max_pages: Option<usize>,
}

impl CallOptions {
    /// Uses `request_id` instead of generating one.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Overrides the page limit for this call.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}
