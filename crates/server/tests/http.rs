use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chatgate_common::error::{EMPTY_MESSAGE_DETAIL, INTERNAL_ERROR_DETAIL, TEMPLATE_MISSING_BODY};
use chatgate_common::AppConfig;
use chatgate_proto::{ChatResponse, ErrorResponse, HealthResponse};
use chatgate_worker::testing::{FakeModel, FakeSource};
use chatgate_worker::{ChatService, ResourceSource};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    _dir: TempDir,
    config: AppConfig,
    source: Arc<FakeSource>,
    service: Arc<ChatService>,
}

impl Harness {
    fn new(with_template: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let assets = dir.path().join("static");
        fs::create_dir_all(&templates).unwrap();
        fs::create_dir_all(&assets).unwrap();
        fs::write(assets.join("chat.js"), "console.log('chat');").unwrap();
        if with_template {
            fs::write(templates.join("index.html"), "<html><body>ChatGate</body></html>").unwrap();
        }

        let mut config = AppConfig::default();
        config.server.templates_dir = templates;
        config.server.static_dir = assets;
        config.concurrency.worker_threads = 2;
        config.generation.max_new_tokens = 30;

        let source = Arc::new(FakeSource::new(FakeModel::new()));
        let resource_source: Arc<dyn ResourceSource> = source.clone();
        let service = Arc::new(ChatService::from_config(&config, resource_source).unwrap());

        Self {
            _dir: dir,
            config,
            source,
            service,
        }
    }

    fn app(&self) -> Router {
        chatgate_server::app(&self.config, Arc::clone(&self.service))
    }
}

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_chat_success() {
    let harness = Harness::new(true);

    let response = harness.app().oneshot(chat_request(r#"{"message": "Hello"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: ChatResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body.response, FakeModel::REPLY.trim());
    assert!(!body.response.starts_with("Hello"));
}

#[tokio::test]
async fn test_empty_message_rejected_without_admission() {
    let harness = Harness::new(true);

    for message in [r#"{"message": ""}"#, r#"{"message": "   \n "}"#] {
        let response = harness.app().oneshot(chat_request(message)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: ErrorResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.detail, EMPTY_MESSAGE_DETAIL);
    }

    assert_eq!(harness.service.gate().admitted(), 0);
    assert_eq!(harness.source.loads(), 0);
}

#[tokio::test]
async fn test_load_failure_is_generic_and_retried() {
    let harness = Harness::new(true);
    harness.source.set_broken(true);

    let response = harness.app().oneshot(chat_request(r#"{"message": "Hello"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let raw = body_bytes(response).await;
    let body: ErrorResponse = serde_json::from_slice(&raw).unwrap();
    assert_eq!(body.detail, INTERNAL_ERROR_DETAIL);
    assert!(!String::from_utf8_lossy(&raw).contains("tokenizer.json"));

    harness.source.set_broken(false);
    let response = harness.app().oneshot(chat_request(r#"{"message": "Hello"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.source.loads(), 2);
}

#[tokio::test]
async fn test_malformed_body_is_client_error() {
    let harness = Harness::new(true);

    for body in ["not json", r#"{"text": "Hello"}"#] {
        let response = harness.app().oneshot(chat_request(body)).await.unwrap();
        assert!(response.status().is_client_error());
    }
    assert_eq!(harness.service.gate().admitted(), 0);
}

#[tokio::test]
async fn test_index_served() {
    let harness = Harness::new(true);

    let response = harness.app().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(String::from_utf8_lossy(&body_bytes(response).await).contains("ChatGate"));
}

#[tokio::test]
async fn test_index_missing_template() {
    let harness = Harness::new(false);

    let response = harness.app().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(body_bytes(response).await, TEMPLATE_MISSING_BODY.as_bytes());
}

#[tokio::test]
async fn test_static_assets() {
    let harness = Harness::new(true);

    let response = harness.app().oneshot(get("/static/chat.js")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness.app().oneshot(get("/static/missing.js")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reports_model_state() {
    let harness = Harness::new(true);

    let response = harness.app().oneshot(get("/health")).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health.status, "ok");
    assert!(!health.model_loaded);

    harness.service.preload().await.unwrap();

    let response = harness.app().oneshot(get("/health")).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(health.model_loaded);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let mut harness = Harness::new(true);

    harness.app().oneshot(chat_request(r#"{"message": "Hello"}"#)).await.unwrap();
    let response = harness.app().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(String::from_utf8_lossy(&body_bytes(response).await).contains("chat_requests_total"));

    harness.config.observability.enable_metrics = false;
    let response = harness.app().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
