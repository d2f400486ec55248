//! HTTP request handlers

use crate::state::AppState;
use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};
use chatgate_common::{ChatGateError, METRICS};
use chatgate_proto::{ChatRequest, ChatResponse, ErrorResponse, HealthResponse};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Error wrapper that renders a [`ChatGateError`] as an HTTP response
///
/// Only the public message crosses the boundary; the full error is logged by
/// the handler that produced it.
#[derive(Debug)]
pub struct ApiError(pub ChatGateError);

impl From<ChatGateError> for ApiError {
    fn from(err: ChatGateError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match self.0 {
            ChatGateError::TemplateMissing(_) => (status, Html(self.0.public_message().to_string())).into_response(),
            _ => (
                status,
                Json(ErrorResponse {
                    detail: self.0.public_message().to_string(),
                }),
            )
                .into_response(),
        }
    }
}

/// Home page
pub async fn index(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let path = state.templates_dir.join("index.html");

    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Ok(Html(page)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            error!("Template not found: {}", path.display());
            Err(ChatGateError::template_missing(path.display().to_string()).into())
        }
        Err(e) => {
            error!("Failed to read template {}: {}", path.display(), e);
            Err(ChatGateError::from(e).into())
        }
    }
}

/// Generate a reply to one chat message
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);

    async move {
        METRICS.chat.requests_total.inc();
        let start = Instant::now();

        let outcome = state.service.respond(&request.message).await;
        METRICS.chat.request_duration.observe(start.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                METRICS.chat.requests_success.inc();
                info!(
                    "Replied with {} tokens in {:?}",
                    result.completion_tokens,
                    start.elapsed()
                );
                Ok(Json(ChatResponse {
                    response: result.text,
                }))
            }
            Err(e) if e.is_client_error() => {
                METRICS.chat.requests_rejected.inc();
                debug!("Rejected chat request: {}", e);
                Err(ApiError(e))
            }
            Err(e) => {
                METRICS.chat.requests_failed.inc();
                error!("Error processing chat request: {}", e);
                Err(ApiError(e))
            }
        }
    }
    .instrument(span)
    .await
}

/// Liveness and model state
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: state.service.loader().is_loaded(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    if !state.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}
