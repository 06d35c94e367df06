//! Record/replay transport decorators.
//!
//! [`CassetteRecordTransport`] passes requests through to an inner transport
//! and appends every exchange to a [`Cassette`]. [`CassetteReplayTransport`]
//! answers requests from a loaded cassette, in recorded order, without any
//! network I/O.
//!
//! Requests are matched by [`RequestFingerprint`]: method, URL and body.
//! Headers never take part in matching, so a fresh trace id on every run
//! does not break replay. Response headers named in
//! [`Cassette::volatile_headers`] are rewritten on replay with the value the
//! live request carries.

use std::{
    fmt, fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    StatusCode,
};
use serde::{Deserialize, Serialize};

use crate::{
    transport::{
        BlockingTransport, HttpRequest, HttpResponse, ReplayError, Transport, TransportError,
    },
    ResilientHttpError, Result,
};

const CASSETTE_VERSION: u32 = 1;

/// Request or response body as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredBody {
    /// UTF-8 body, stored verbatim.
    Text(String),
    /// Any other body, base64 encoded.
    Base64(String),
}

impl StoredBody {
    /// Text when `bytes` is UTF-8, base64 otherwise.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Base64(STANDARD.encode(bytes)),
        }
    }

    /// Decodes back to the original bytes.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Base64(encoded) => STANDARD.decode(encoded),
        }
    }
}

/// Identity of a request for cassette matching.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<StoredBody>,
}

impl RequestFingerprint {
    /// Fingerprint of `request`. Empty bodies count as no body.
    pub fn of(request: &HttpRequest) -> Self {
        Self {
            method: request.method.as_str().to_owned(),
            url: request.url.as_str().to_owned(),
            body: request
                .body
                .as_deref()
                .filter(|body| !body.is_empty())
                .map(StoredBody::from_bytes),
        }
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        match &self.body {
            Some(StoredBody::Text(text)) => write!(f, " ({} byte body)", text.len()),
            Some(StoredBody::Base64(_)) => write!(f, " (binary body)"),
            None => Ok(()),
        }
    }
}

/// Header value as stored on disk.
///
/// Visible ASCII is kept as a plain string. Anything else, such as `obs-text`
/// bytes, is written as `{"base64": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredHeaderValue {
    Text(String),
    Base64 { base64: String },
}

impl StoredHeaderValue {
    /// Stores `value` as text when it is visible ASCII.
    pub fn from_value(value: &HeaderValue) -> Self {
        match value.to_str() {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Base64 {
                base64: STANDARD.encode(value.as_bytes()),
            },
        }
    }

    fn to_value(&self) -> std::result::Result<HeaderValue, String> {
        let value = match self {
            Self::Text(text) => HeaderValue::from_str(text),
            Self::Base64 { base64 } => {
                let bytes = STANDARD
                    .decode(base64)
                    .map_err(|err| format!("invalid stored header value: {err}"))?;
                HeaderValue::from_bytes(&bytes)
            }
        };
        value.map_err(|err| format!("invalid stored header value: {err}"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    /// Header name/value pairs in received order. Repeated names are kept.
    #[serde(default)]
    pub headers: Vec<(String, StoredHeaderValue)>,
    pub body: StoredBody,
}

impl StoredResponse {
    /// Captures status, every header value and the body of `response`.
    pub fn from_response(response: &HttpResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    StoredHeaderValue::from_value(value),
                )
            })
            .collect();
        Self {
            status: response.status.as_u16(),
            headers,
            body: StoredBody::from_bytes(&response.body),
        }
    }

    fn to_response(&self) -> std::result::Result<HttpResponse, String> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|err| format!("invalid stored status {}: {err}", self.status))?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| format!("invalid stored header name '{name}': {err}"))?;
            headers.append(name, value.to_value()?);
        }
        let body = self
            .body
            .to_bytes()
            .map_err(|err| format!("invalid stored body: {err}"))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CassetteEntry {
    pub request: RequestFingerprint,
    pub response: StoredResponse,
}

/// Ordered log of recorded exchanges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cassette {
    version: u32,
    #[serde(default)]
    volatile_headers: Vec<String>,
    #[serde(default)]
    entries: Vec<CassetteEntry>,
}

impl Default for Cassette {
    fn default() -> Self {
        Self {
            version: CASSETTE_VERSION,
            volatile_headers: Vec::new(),
            entries: Vec::new(),
        }
    }
}

impl Cassette {
    /// Empty cassette in the current format version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a header whose value changes on every run, such as a trace id.
    pub fn with_volatile_header(mut self, name: impl AsRef<str>) -> Self {
        let name = name.as_ref().to_ascii_lowercase();
        if !self.volatile_headers.contains(&name) {
            self.volatile_headers.push(name);
        }
        self
    }

    /// Lowercased names of volatile response headers.
    pub fn volatile_headers(&self) -> &[String] {
        &self.volatile_headers
    }

    /// Case-insensitive membership test for volatile header names.
    pub fn is_volatile(&self, name: &str) -> bool {
        self.volatile_headers
            .iter()
            .any(|volatile| volatile.eq_ignore_ascii_case(name))
    }

    /// Recorded exchanges in order.
    pub fn entries(&self) -> &[CassetteEntry] {
        &self.entries
    }

    /// Number of recorded exchanges.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends one exchange.
    pub fn push(&mut self, request: &HttpRequest, response: &HttpResponse) {
        self.entries.push(CassetteEntry {
            request: RequestFingerprint::of(request),
            response: StoredResponse::from_response(response),
        });
    }

    /// Pretty-printed JSON form.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses the JSON form and checks the version and every entry.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let cassette: Self = serde_json::from_str(raw)?;
        if cassette.version != CASSETTE_VERSION {
            return Err(ResilientHttpError::Decode(format!(
                "unsupported cassette version {}",
                cassette.version
            )));
        }
        for (index, entry) in cassette.entries.iter().enumerate() {
            entry.response.to_response().map_err(|err| {
                ResilientHttpError::Decode(format!("cassette entry {index}: {err}"))
            })?;
        }
        Ok(cassette)
    }

    /// Writes the JSON form to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut raw = self.to_json_string()?;
        raw.push('\n');
        fs::write(path, raw)?;
        Ok(())
    }

    /// Reads a cassette written by [`Cassette::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Builds the replayed response for `request` from entry `index`.
    fn replay_response(
        &self,
        index: usize,
        request: &HttpRequest,
    ) -> std::result::Result<HttpResponse, String> {
        let mut response = self.entries[index].response.to_response()?;
        for name in &self.volatile_headers {
            let Some(live) = request.headers.get(name.as_str()) else {
                continue;
            };
            if let Some(stored) = response.headers.get_mut(name.as_str()) {
                *stored = live.clone();
            }
        }
        Ok(response)
    }
}

/// Pass-through transport that records every exchange.
#[derive(Debug)]
pub struct CassetteRecordTransport<T> {
    inner: T,
    cassette: Mutex<Cassette>,
}

impl<T> CassetteRecordTransport<T> {
    /// Wraps `inner`, appending to `cassette`.
    pub fn new(inner: T, cassette: Cassette) -> Self {
        Self {
            inner,
            cassette: Mutex::new(cassette),
        }
    }

    /// Snapshot of everything recorded so far.
    pub fn cassette(&self) -> Cassette {
        self.lock().clone()
    }

    /// Consumes the recorder and returns the cassette.
    pub fn into_cassette(self) -> Cassette {
        self.cassette
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes everything recorded so far to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.lock().save(path)
    }

    fn record(&self, request: &HttpRequest, response: &HttpResponse) {
        self.lock().push(request, response);
    }

    fn lock(&self) -> MutexGuard<'_, Cassette> {
        self.cassette.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<T: Transport> Transport for CassetteRecordTransport<T> {
    async fn send(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let response = self.inner.send(request.clone()).await?;
        self.record(&request, &response);
        Ok(response)
    }
}

impl<T: BlockingTransport> BlockingTransport for CassetteRecordTransport<T> {
    fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let response = self.inner.send(request.clone())?;
        self.record(&request, &response);
        Ok(response)
    }
}

/// Transport that answers from a cassette in recorded order.
///
/// A mismatching request does not consume the entry it was compared with.
#[derive(Debug)]
pub struct CassetteReplayTransport {
    cassette: Arc<Cassette>,
    cursor: Mutex<usize>,
}

impl CassetteReplayTransport {
    /// Replays `cassette` from its first entry.
    pub fn new(cassette: impl Into<Arc<Cassette>>) -> Self {
        Self {
            cassette: cassette.into(),
            cursor: Mutex::new(0),
        }
    }

    /// Loads a cassette file for replay.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Cassette::load(path)?))
    }

    /// Recorded entries not yet replayed.
    pub fn remaining(&self) -> usize {
        let cursor = *self.lock();
        self.cassette.len().saturating_sub(cursor)
    }

    /// Fails if any recorded entry was not replayed.
    pub fn assert_exhausted(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(ResilientHttpError::CassetteNotExhausted { remaining }),
        }
    }

    fn replay(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let actual = RequestFingerprint::of(request);
        let mut cursor = self.lock();

        let Some(entry) = self.cassette.entries().get(*cursor) else {
            return Err(TransportError::Replay(ReplayError::Exhausted {
                method: actual.method,
                url: actual.url,
            }));
        };
        if entry.request != actual {
            return Err(TransportError::Replay(ReplayError::Mismatch {
                expected: entry.request.to_string(),
                actual: actual.to_string(),
            }));
        }

        let response = self
            .cassette
            .replay_response(*cursor, request)
            .map_err(|message| {
                TransportError::Replay(ReplayError::Mismatch {
                    expected: entry.request.to_string(),
                    actual: message,
                })
            })?;
        *cursor += 1;
        Ok(response)
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for CassetteReplayTransport {
    async fn send(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        self.replay(&request)
    }
}

impl BlockingTransport for CassetteReplayTransport {
    fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        self.replay(&request)
    }
}
