mod common;

use std::sync::Arc;

use reqwest::StatusCode;
use resilient_http::{
    cassette::{Cassette, CassetteRecordTransport, CassetteReplayTransport},
    ClientOptions, HttpClient, HttpResponse, ResilientHttpError,
};
use serde_json::json;

use common::FnTransport;

fn echo_url() -> Arc<FnTransport> {
    FnTransport::new(|request, _| {
        Ok(HttpResponse::json(
            StatusCode::OK,
            &json!({"ok": true, "url": request.url.as_str()}),
        ))
    })
}

#[tokio::test]
async fn record_then_replay_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("roundtrip.json");

    let inner = echo_url();
    let recorder = Arc::new(CassetteRecordTransport::new(inner.clone(), Cassette::new()));
    let client = HttpClient::with_transport(Arc::clone(&recorder));

    let urls = [
        "https://example.test/api",
        "https://example.test/api/items",
        "https://example.test/api?page=2",
    ];
    let mut live = Vec::new();
    for url in urls {
        live.push(client.get_json_dict(url).await.expect("live call"));
    }
    assert_eq!(inner.calls(), 3);
    recorder.save(&path).expect("save cassette");

    let replay = Arc::new(CassetteReplayTransport::load(&path).expect("load cassette"));
    let client = HttpClient::with_transport(Arc::clone(&replay));
    for (url, expected) in urls.iter().zip(&live) {
        let replayed = client.get_json_dict(url).await.expect("replayed call");
        assert_eq!(&replayed, expected);
    }
    replay.assert_exhausted().expect("every entry replayed");
    assert_eq!(inner.calls(), 3, "replay must not reach the network");
}

#[tokio::test]
async fn unknown_request_fails_and_leftovers_are_reported() {
    let recorder = Arc::new(CassetteRecordTransport::new(echo_url(), Cassette::new()));
    HttpClient::with_transport(Arc::clone(&recorder))
        .get_json_dict("https://example.test/api")
        .await
        .expect("live call");
    let cassette = recorder.cassette();

    let replay = Arc::new(CassetteReplayTransport::new(cassette.clone()));
    let err = HttpClient::with_transport(Arc::clone(&replay))
        .get_json_dict("https://example.test/other")
        .await
        .expect_err("path differs");
    assert!(matches!(err, ResilientHttpError::CassetteMismatch { .. }));
    assert!(err.is_request_failure());
    assert!(matches!(
        replay.assert_exhausted(),
        Err(ResilientHttpError::CassetteNotExhausted { remaining: 1 })
    ));

    let replay = Arc::new(CassetteReplayTransport::new(cassette));
    let client = HttpClient::with_transport(Arc::clone(&replay));
    client
        .get_json_dict("https://example.test/api")
        .await
        .expect("recorded call");
    let err = client
        .get_json_dict("https://example.test/api")
        .await
        .expect_err("nothing left");
    assert!(matches!(err, ResilientHttpError::CassetteExhausted { .. }));
}

#[tokio::test]
async fn replay_ignores_fresh_trace_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("trace.json");

    let inner = FnTransport::new(|request, _| {
        let trace = request
            .headers
            .get("x-trace")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        Ok(HttpResponse::json(StatusCode::OK, &json!({ "trace": trace }))
            .with_header("x-trace", &trace))
    });
    let recorder = Arc::new(CassetteRecordTransport::new(
        inner,
        Cassette::new().with_volatile_header("X-Trace"),
    ));
    let options = ClientOptions::default().with_trace_header("X-Trace");
    let client =
        HttpClient::with_transport(Arc::clone(&recorder)).with_options(options.clone());

    let first = client
        .get_json_dict("https://example.test/t")
        .await
        .expect("first");
    let second = client
        .get_json_dict("https://example.test/t")
        .await
        .expect("second");
    assert!(first["trace"].is_string());
    assert_ne!(first["trace"], second["trace"]);
    recorder.save(&path).expect("save");

    let replay = Arc::new(CassetteReplayTransport::load(&path).expect("load"));
    let client = HttpClient::with_transport(Arc::clone(&replay)).with_options(options);
    let replayed_first = client
        .get_json_dict("https://example.test/t")
        .await
        .expect("replay 1");
    let replayed_second = client
        .get_json_dict("https://example.test/t")
        .await
        .expect("replay 2");
    assert_eq!(replayed_first, first);
    assert_eq!(replayed_second, second);
    replay.assert_exhausted().expect("drained");
}

#[test]
fn saved_file_is_human_readable_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty.json");
    Cassette::new()
        .with_volatile_header("X-Request-ID")
        .save(&path)
        .expect("save");

    let raw = std::fs::read_to_string(&path).expect("read");
    let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(parsed["version"], json!(1));
    assert_eq!(parsed["volatile_headers"], json!(["x-request-id"]));
    assert!(raw.contains('\n'), "cassette is pretty printed");
}
