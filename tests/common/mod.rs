#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use resilient_http::{
    transport::BlockingTransport, ClientEvent, HttpRequest, HttpResponse, Transport,
    TransportError,
};

type Handler =
    dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync;

/// In-process transport driven by a closure that sees every request and its
/// 0-based call index.
pub struct FnTransport {
    handler: Box<Handler>,
    calls: AtomicUsize,
    seen: Mutex<Vec<HttpRequest>>,
}

impl FnTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<HttpRequest> {
        self.seen.lock().expect("seen mutex").clone()
    }

    pub fn header_values(&self, name: &str) -> Vec<Option<String>> {
        self.seen()
            .iter()
            .map(|request| {
                request
                    .headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
            })
            .collect()
    }

    fn handle(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.handler)(&request, index);
        self.seen.lock().expect("seen mutex").push(request);
        result
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.handle(request)
    }
}

impl BlockingTransport for FnTransport {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.handle(request)
    }
}

/// Collects hook events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<ClientEvent>>>);

impl EventLog {
    pub fn hook(&self) -> impl Fn(&ClientEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.0);
        move |event: &ClientEvent| events.lock().expect("event mutex").push(event.clone())
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.0.lock().expect("event mutex").clone()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.events()
            .iter()
            .filter_map(ClientEvent::sleep_duration)
            .collect()
    }
}

/// Records requested sleep durations without waiting.
#[derive(Clone, Default)]
pub struct SleepLog(Arc<Mutex<Vec<Duration>>>);

impl SleepLog {
    pub fn push(&self, duration: Duration) {
        self.0.lock().expect("sleep mutex").push(duration);
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.0.lock().expect("sleep mutex").clone()
    }
}

/// Manually advanced clock.
#[derive(Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("clock mutex") += by;
    }

    pub fn now(&self) -> Instant {
        self.origin + *self.offset.lock().expect("clock mutex")
    }

    pub fn as_fn(&self) -> impl Fn() -> Instant + Send + Sync + 'static {
        let clock = self.clone();
        move || clock.now()
    }
}

pub fn connect_error() -> TransportError {
    TransportError::Network("connection refused".to_owned())
}
