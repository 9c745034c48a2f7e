//! Tests for the HTTP agent processor against a mock agent.

use std::sync::Arc;
use std::time::Duration;

use jotter_jobs::{
    AgentConfig, Error, HttpProcessor, NotificationHub, ProcessContext, ProgressReporter,
    RequestProcessor, RequestType,
};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn context(request_type: RequestType, input: &str) -> ProcessContext {
    let request_id = Uuid::new_v4();
    let space_id = Uuid::new_v4();
    ProcessContext {
        request_id,
        space_id,
        request_type,
        input: input.to_string(),
        attempt: 1,
        progress: ProgressReporter::new(
            Arc::new(NotificationHub::default()),
            request_id,
            space_id,
            "alice",
        ),
    }
}

#[tokio::test]
async fn test_http_processor_posts_request_and_parses_result() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .and(body_partial_json(serde_json::json!({
            "type": "SEARCH",
            "input": "milk",
            "attempt": 1
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "searchResults": [{"path": "groceries.md", "score": 0.9}],
            "summary": "1 match"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let processor = HttpProcessor::new(AgentConfig::default().with_url(mock_server.uri())).unwrap();
    let result = processor
        .process(context(RequestType::Search, "milk"))
        .await
        .unwrap();

    assert_eq!(result.summary.as_deref(), Some("1 match"));
    assert_eq!(result.search_results.map(|r| r.len()), Some(1));
    assert!(result.files_created.is_none());
}

#[tokio::test]
async fn test_http_processor_maps_error_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&mock_server)
        .await;

    let processor = HttpProcessor::new(AgentConfig::default().with_url(mock_server.uri())).unwrap();
    let err = processor
        .process(context(RequestType::Input, "buy milk"))
        .await
        .unwrap_err();

    match err {
        Error::Processing(msg) => {
            assert!(msg.contains("502"));
            assert!(msg.contains("upstream down"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_http_processor_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let processor = HttpProcessor::new(
        AgentConfig::default()
            .with_url(mock_server.uri())
            .with_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    let err = processor
        .process(context(RequestType::Refactor, "tidy up"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Request(_)));
    assert!(err.is_retryable());
}
