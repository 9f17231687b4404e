mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{files_with_suffix, valid_result, write_images};
use vlm_batch::checkpoint::{CheckpointStore, FsCheckpointStore};
use vlm_batch::error::FailureKind;
use vlm_batch::executor::{TaskExecutor, ValidationPolicy};
use vlm_batch::ledger::CostLedger;
use vlm_batch::orchestrator::PoolManager;
use vlm_batch::scoring::{ClientSettings, ImagePayload, ScoreService, ScoringClient, ScoringError};
use vlm_batch::source::{DEFAULT_EXTENSIONS, ImageSource};
use vlm_batch::state_machine::{Task, TaskOutcome};

const ENDPOINT: &str = "/v1/chat/completions";

fn client(server: &MockServer, timeout: Duration) -> ScoringClient {
    ScoringClient::new(ClientSettings {
        endpoint: format!("{}{ENDPOINT}", server.uri()),
        api_token: "test-token".into(),
        model: "vision-test".into(),
        max_tokens: 1024,
        temperature: 0.3,
        request_timeout: timeout,
    })
    .unwrap()
}

fn payload() -> ImagePayload {
    ImagePayload {
        source: "cat.png".into(),
        mime: "image/png",
        base64: "iVBORw0KGgo=".into(),
    }
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 1200,
            "completion_tokens": 80,
            "total_tokens": 1280,
            "completion_tokens_details": { "reasoning_tokens": 40 }
        }
    })
}

#[tokio::test]
async fn successful_call_returns_content_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({ "model": "vision-test", "max_tokens": 1024 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
        .expect(1)
        .mount(&server)
        .await;

    let completion = client(&server, Duration::from_secs(5))
        .score(&payload())
        .await
        .unwrap();
    assert_eq!(completion.content, "hello");
    assert_eq!(completion.usage.prompt_tokens, 1200);
    assert_eq!(completion.usage.reasoning_tokens(), 40);
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_secs(5))
        .score(&payload())
        .await
        .unwrap_err();
    assert!(matches!(err, ScoringError::RateLimited { retry_after_ms: 7000 }));
}

#[tokio::test]
async fn error_statuses_surface_the_service_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({ "error": { "message": "invalid api key" } })),
        )
        .mount(&server)
        .await;

    match client(&server, Duration::from_secs(5)).score(&payload()).await {
        Err(ScoringError::ApiError { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid api key");
        }
        other => panic!("expected ApiError, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_secs(5))
        .score(&payload())
        .await
        .unwrap_err();
    assert!(matches!(err, ScoringError::Malformed(_)));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_millis(200))
        .score(&payload())
        .await
        .unwrap_err();
    assert!(matches!(err, ScoringError::Timeout));
}

#[tokio::test]
async fn executor_classifies_http_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let items = write_images(dir.path(), 1);
    let executor = TaskExecutor::new(
        Arc::new(client(&server, Duration::from_secs(5))),
        Duration::from_secs(5),
        ValidationPolicy::Retry,
    );
    let outcome = executor.execute(&Task::new(items[0].clone(), 3)).await;
    assert!(matches!(
        outcome,
        TaskOutcome::RetryableFailure(FailureKind::Server { status: 502, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_recovers_from_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&valid_result(6.0))))
        .with_priority(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let items = write_images(dir.path(), 4);
    let executor = TaskExecutor::new(
        Arc::new(client(&server, Duration::from_secs(5))),
        Duration::from_secs(5),
        ValidationPolicy::Retry,
    );
    let ledger = Arc::new(CostLedger::default());
    let pool = PoolManager::new(
        executor,
        Arc::new(FsCheckpointStore::new()),
        Arc::clone(&ledger),
        common::settings(2),
    );
    let extensions: Vec<String> = DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect();

    let summary = pool
        .run(ImageSource::new(dir.path(), &extensions).into_stream(2))
        .await;

    assert_eq!(summary.succeeded, 4);
    assert_eq!(files_with_suffix(dir.path(), ".json").len(), 4);

    let store = FsCheckpointStore::new();
    let mut attempts = 0;
    for item in &items {
        let record = store.read(item).await.unwrap().unwrap();
        assert!(record.is_success());
        assert!(record.cost > 0.0);
        attempts += record.attempts;
    }
    assert_eq!(attempts, 6);

    let snapshot = ledger.snapshot();
    assert_eq!(snapshot.prompt_tokens, 4 * 1200);
    assert_eq!(snapshot.reasoning_tokens, 4 * 40);
    assert_eq!(snapshot.total_output_tokens(), 4 * 120);
}
