use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use resilient_http::{ClientOptions, HttpClient, ResilientHttpError, RetryPolicy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: JsonValue,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
            delay: Duration::from_millis(0),
        }
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    hits: Arc<AtomicUsize>,
    trace_ids: Arc<Mutex<Vec<Option<String>>>>,
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

fn record_trace(state: &MockState, headers: &HeaderMap) {
    let trace = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    state
        .trace_ids
        .lock()
        .expect("trace mutex must not be poisoned")
        .push(trace);
}

async fn scripted_handler(State(state): State<MockState>, headers: HeaderMap) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    record_trace(&state, &headers);

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut out_headers = HeaderMap::new();
    for (name, value) in response.headers {
        out_headers.insert(name, value.parse().expect("valid header value"));
    }
    (response.status, out_headers, Json(response.body))
}

async fn paged_handler(
    State(state): State<MockState>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    record_trace(&state, &headers);

    let page = query.page.unwrap_or(1);
    let mut out_headers = HeaderMap::new();
    if page < 3 {
        let link = format!("</items?page={}>; rel=\"next\"", page + 1);
        out_headers.insert("link", link.parse().expect("valid link"));
    }
    (StatusCode::OK, out_headers, Json(json!([page])))
}

async fn looping_handler(State(state): State<MockState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut out_headers = HeaderMap::new();
    out_headers.insert(
        "link",
        "</looping?page=1>; rel=\"next\"".parse().expect("valid link"),
    );
    (StatusCode::OK, out_headers, Json(json!([1])))
}

struct TestServer {
    base_url: String,
    state: MockState,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn options(&self) -> ClientOptions {
        ClientOptions::default()
            .with_base_url(self.base_url.parse().expect("base url"))
            .with_trace_header("X-Request-ID")
    }

    fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    fn trace_ids(&self) -> Vec<Option<String>> {
        self.state.trace_ids.lock().expect("trace mutex").clone()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        hits: Arc::new(AtomicUsize::new(0)),
        trace_ids: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/scripted", get(scripted_handler))
        .route("/items", get(paged_handler))
        .route("/looping", get(looping_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        state,
        task,
    }
}

#[tokio::test]
async fn get_json_dict_returns_object() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!({"ok": true, "n": 7}),
    )])
    .await;
    let client = HttpClient::new().with_options(server.options());

    let body = client.get_json_dict("/scripted").await.expect("call must succeed");

    assert_eq!(body["n"], json!(7));
    assert_eq!(server.hits(), 1);
    assert!(server.trace_ids()[0].is_some());
}

#[tokio::test]
async fn retries_429_after_retry_after_delay() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::TOO_MANY_REQUESTS, json!({"error": "rate"}))
            .with_header("retry-after", "0.05"),
        MockResponse::json(StatusCode::OK, json!([1, 2])),
    ])
    .await;
    let client = HttpClient::new()
        .with_options(server.options())
        .with_policy(RetryPolicy::new(2).with_retry_on_429(true));

    let items = client.get_json_list("/scripted").await.expect("must succeed after retry");

    assert_eq!(items, vec![json!(1), json!(2)]);
    assert_eq!(server.hits(), 2);
    let traces = server.trace_ids();
    assert_eq!(traces[0], traces[1]);
}

#[tokio::test]
async fn server_error_surfaces_status_and_body() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": "down"}),
    )])
    .await;
    let client = HttpClient::new()
        .with_options(server.options())
        .with_policy(RetryPolicy::new(3));

    let err = client.get_json_dict("/scripted").await.expect_err("must fail");

    match err {
        ResilientHttpError::Http { status, body } => {
            assert_eq!(status, 503);
            assert!(body.contains("down"));
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn request_timeout_surfaces_timeout_error() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({"ok": true}))
        .with_delay(Duration::from_millis(300))])
    .await;
    let client = HttpClient::new()
        .with_options(server.options().with_timeout(Duration::from_millis(30)))
        .with_policy(RetryPolicy::new(3));

    let err = client.get_json_dict("/scripted").await.expect_err("request must time out");

    assert!(matches!(err, ResilientHttpError::Timeout { .. }));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn paginated_fetch_follows_link_next_with_one_trace_id() {
    let server = spawn_server(Vec::new()).await;
    let client = HttpClient::new().with_options(server.options());

    let items = client
        .get_json_list_paginated("/items?page=1")
        .await
        .expect("pagination must succeed");

    assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    let traces = server.trace_ids();
    assert_eq!(traces.len(), 3);
    assert!(traces[0].is_some());
    assert!(traces.iter().all(|trace| trace == &traces[0]));
}

#[tokio::test]
async fn paginated_fetch_stops_at_max_pages() {
    let server = spawn_server(Vec::new()).await;
    let client = HttpClient::new().with_options(server.options().with_max_pages(2));

    let items = client
        .get_json_list_paginated("/items?page=1")
        .await
        .expect("pagination must succeed");

    assert_eq!(items, vec![json!(1), json!(2)]);
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn paginated_fetch_detects_cycles() {
    let server = spawn_server(Vec::new()).await;
    let client = HttpClient::new().with_options(server.options());

    let err = client
        .get_json_list_paginated("/looping?page=1")
        .await
        .expect_err("cycle must be detected");

    assert!(matches!(err, ResilientHttpError::PaginationCycle { .. }));
    assert_eq!(server.hits(), 1);
}
