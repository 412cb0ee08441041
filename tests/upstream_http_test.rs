//! Upstream HTTP reader tests
//!
//! Runs `HttpUpstream` against a `wiremock` provider. Bodies are set with
//! `set_body_raw(bytes, "text/event-stream")` so the content type matches
//! what the real provider sends.

mod common;

use std::time::Duration;

use futures::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use storyrelay::config::ProviderConfig;
use storyrelay::error::RelayError;
use storyrelay::request::ProviderRequest;
use storyrelay::upstream::{HttpUpstream, Upstream};

fn make_upstream(base_url: &str) -> HttpUpstream {
    let endpoint = url::Url::parse(base_url)
        .expect("valid url")
        .join("api/stream")
        .expect("valid path");
    HttpUpstream::new(endpoint, Duration::from_secs(5)).expect("client builds")
}

fn provider_request() -> ProviderRequest {
    ProviderRequest::build(
        &common::request("w", "p", 0),
        "01HSESSION",
        "It was dark.".to_string(),
        &ProviderConfig::default(),
    )
}

async fn collect(upstream: &HttpUpstream) -> Vec<Result<String, RelayError>> {
    let stream = upstream
        .open(&provider_request())
        .await
        .expect("open should succeed");
    stream.collect().await
}

#[tokio::test]
async fn test_streams_chunks_until_done() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/stream"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(
                common::chunk_body(&["Once", " upon", " a time"]),
                "text/event-stream",
            ),
        )
        .mount(&server)
        .await;

    let deltas: Vec<String> = collect(&make_upstream(&server.uri()))
        .await
        .into_iter()
        .map(|d| d.expect("delta"))
        .collect();

    assert_eq!(deltas, vec!["Once", " upon", " a time"]);
}

#[tokio::test]
async fn test_records_after_done_are_ignored() {
    let server = MockServer::start().await;

    let body = common::record_body(&[r#"{"chunk":"kept"}"#, "[DONE]", r#"{"chunk":"dropped"}"#]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let deltas = collect(&make_upstream(&server.uri())).await;
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].as_deref().unwrap(), "kept");
}

#[tokio::test]
async fn test_error_record_ends_stream_with_provider_error() {
    let server = MockServer::start().await;

    let body = common::record_body(&[
        r#"{"chunk":"Hel"}"#,
        r#"{"error":"quota exceeded"}"#,
        r#"{"chunk":"never"}"#,
    ]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let deltas = collect(&make_upstream(&server.uri())).await;
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0].as_deref().unwrap(), "Hel");
    match &deltas[1] {
        Err(RelayError::Provider(message)) => assert_eq!(message, "quota exceeded"),
        other => panic!("expected provider error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_and_ping_records_are_skipped() {
    let server = MockServer::start().await;

    let body = common::record_body(&[
        r#"{"status":"ping"}"#,
        "{not json",
        r#"{"chunk":"ok"}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let deltas = collect(&make_upstream(&server.uri())).await;
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].as_deref().unwrap(), "ok");
}

#[tokio::test]
async fn test_body_without_sentinel_ends_cleanly() {
    let server = MockServer::start().await;

    let body = common::record_body(&[r#"{"chunk":"a"}"#, r#"{"chunk":"b"}"#]);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let deltas: Vec<String> = collect(&make_upstream(&server.uri()))
        .await
        .into_iter()
        .map(|d| d.expect("delta"))
        .collect();
    assert_eq!(deltas, vec!["a", "b"]);
}

#[tokio::test]
async fn test_non_success_status_is_connection_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = make_upstream(&server.uri())
        .open(&provider_request())
        .await
        .err()
        .expect("open should fail");

    match err {
        RelayError::Connection(message) => {
            assert!(message.contains("503"), "message: {}", message);
            assert!(message.contains("overloaded"), "message: {}", message);
        }
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    let upstream = HttpUpstream::new(
        url::Url::parse("http://127.0.0.1:9/api/stream").unwrap(),
        Duration::from_secs(1),
    )
    .unwrap();

    let err = upstream.open(&provider_request()).await.err();
    assert!(matches!(err, Some(RelayError::Connection(_))));
}

#[tokio::test]
async fn test_request_body_carries_stream_flag_and_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "usecase": "story",
            "provider": "openai",
            "model": "gpt-4o-mini",
            "stream": true,
            "prompt_config": { "context": "It was dark." },
            "caller": { "project_id": "p", "session_id": "01HSESSION" }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(common::chunk_body(&["matched"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let deltas = collect(&make_upstream(&server.uri())).await;
    assert_eq!(deltas[0].as_deref().unwrap(), "matched");
}
