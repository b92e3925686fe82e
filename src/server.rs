//! HTTP server.
//!
//! Exposes the intake pipeline as a JSON HTTP API for the spreadsheet UI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/normalize` | Normalize and classify a batch; SSE progress stream |
//! | `POST` | `/api/persist` | Persist a completed batch in one transaction |
//! | `POST` | `/api/feedback` | Submit a label correction or confirmation |
//! | `POST` | `/api/classify` | Classify a single text |
//! | `GET`  | `/api/labels` | Label catalog of the current corpus snapshot |
//! | `GET`  | `/health` | Health check (version and corpus version) |
//!
//! # Streaming
//!
//! `/api/normalize` answers with `text/event-stream`; every progress event
//! is one `data: <json>` frame. The stream always ends with a `completed` or
//! `error` event. A client that disconnects drops the stream, which cancels
//! the job.
//!
//! # Error Contract
//!
//! Non-streaming errors use
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "text must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `feedback_log` (500), `internal` (500).
//! Persist failures keep the persist response shape and carry the failure
//! kind in `error_kind`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser UI can be
//! served from a different origin.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use cbam_intake_core::classify::BatchClassifier;
use cbam_intake_core::corpus::LabelInfo;
use cbam_intake_core::feedback::FeedbackError;
use cbam_intake_core::models::{ClassificationResult, FeedbackEvent, RawRow};
use cbam_intake_core::source::{NormalizeRequest, RowSource, RowSourceError};

use crate::config::Config;
use crate::pipeline::{PersistRequest, PersistResponse};
use crate::services::Services;

/// Starts the HTTP server on `[server].bind`. Runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Arc::new(Services::open(config).await?);
    let app = build_router(services);

    let bind_addr = config.server.bind.clone();
    tracing::info!(%bind_addr, "intake server listening");
    println!("Intake server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The application router over already-wired services.
pub fn build_router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/normalize", post(handle_normalize))
        .route("/api/persist", post(handle_persist))
        .route("/api/feedback", post(handle_feedback))
        .route("/api/classify", post(handle_classify))
        .route("/api/labels", get(handle_labels))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(services)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn feedback_log_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "feedback_log".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    corpus_version: u64,
}

async fn handle_health(State(services): State<Arc<Services>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        corpus_version: services.classifier.corpus_version(),
    })
}

// ============ POST /api/normalize ============

/// A body that could not be parsed; surfaces as an `invalid_request` event.
struct UnreadableBody(String);

impl RowSource for UnreadableBody {
    fn filename(&self) -> &str {
        ""
    }

    fn rows(&self) -> Result<Vec<RawRow>, RowSourceError> {
        Err(RowSourceError::Unreadable(self.0.clone()))
    }
}

async fn handle_normalize(State(services): State<Arc<Services>>, body: Bytes) -> Response {
    let events = match serde_json::from_slice::<NormalizeRequest>(&body) {
        Ok(request) => services.orchestrator.process(request).boxed(),
        Err(e) => services
            .orchestrator
            .process(UnreadableBody(format!("invalid request body: {}", e)))
            .boxed(),
    };

    let stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","kind":"internal","message":"serialization failed: {}"}}"#,
                e
            )
        });
        Ok::<_, Infallible>(Event::default().data(data))
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))),
    )
        .into_response()
}

// ============ POST /api/persist ============

async fn handle_persist(
    State(services): State<Arc<Services>>,
    Json(request): Json<PersistRequest>,
) -> (StatusCode, Json<PersistResponse>) {
    let response = services.orchestrator.persist(request).await;
    let status = match response.error_kind.as_deref() {
        None => StatusCode::OK,
        Some("conflict") => StatusCode::CONFLICT,
        Some("transient") => StatusCode::SERVICE_UNAVAILABLE,
        Some("fatal") => StatusCode::INTERNAL_SERVER_ERROR,
        Some(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(response))
}

// ============ POST /api/feedback ============

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub material_text: String,
    pub corrected_label: String,
    #[serde(default)]
    pub was_correct: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
}

#[derive(Debug, Serialize)]
struct FeedbackResponse {
    status: String,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    corpus_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn handle_feedback(
    State(services): State<Arc<Services>>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackResponse>), AppError> {
    let mut event = FeedbackEvent::new(
        &request.material_text,
        &request.corrected_label,
        request.was_correct,
    );
    event.note = request.note;
    event.process_context = request.process;
    event.product_context = request.product;
    let timestamp = event.timestamp;

    match services.feedback.submit(event).await {
        Ok(ack) => Ok((
            StatusCode::OK,
            Json(FeedbackResponse {
                status: "feedback_processed".to_string(),
                timestamp: ack.timestamp,
                corpus_version: Some(ack.corpus_version),
                reason: None,
            }),
        )),
        Err(FeedbackError::Rejected(reason)) => Ok((
            StatusCode::BAD_REQUEST,
            Json(FeedbackResponse {
                status: "feedback_rejected".to_string(),
                timestamp,
                corpus_version: None,
                reason: Some(reason),
            }),
        )),
        Err(e @ FeedbackError::Log(_)) => Err(feedback_log_error(e.to_string())),
    }
}

// ============ POST /api/classify ============

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    text: String,
}

async fn handle_classify(
    State(services): State<Arc<Services>>,
    Json(request): Json<ClassifyRequest>,
) -> Result<Json<ClassificationResult>, AppError> {
    if request.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    Ok(Json(services.classifier.classify(&request.text).await))
}

// ============ GET /api/labels ============

#[derive(Serialize)]
struct LabelsResponse {
    corpus_version: u64,
    labels: Vec<LabelInfo>,
}

async fn handle_labels(State(services): State<Arc<Services>>) -> Json<LabelsResponse> {
    let (corpus_version, labels) = services.classifier.label_catalog();
    Json(LabelsResponse {
        corpus_version,
        labels,
    })
}
