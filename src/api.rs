//! REST + SSE API server for the advisory orchestrator
//!
//! POST /api/advise starts an orchestration and returns the stream session
//! handle; GET /api/advise/stream delivers the ordered event stream with
//! resume support; the trace endpoint serves audit tooling.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::gate::{ActionGate, SignedToken};
use crate::models::{AdvisoryRequest, ProposedAction};
use crate::stream::{spawn_publisher, SessionManager};
use crate::telemetry::TraceStore;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<SessionManager>,
    pub trace_store: Arc<dyn TraceStore>,
    pub gate: Arc<dyn ActionGate>,
    /// Cancellation tokens for in-flight requests, keyed by session id.
    pub active: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Advise Endpoint
/// =============================

async fn start_advise(
    State(state): State<ApiState>,
    Json(request): Json<AdvisoryRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if request.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty".into())),
        );
    }

    info!(query = %request.query, "Received advisory request");

    let correlation_id = Uuid::new_v4();
    let session = state.sessions.open(correlation_id).await;

    let capacity = state.orchestrator.config().event_queue_capacity;
    let (events, _publisher) =
        spawn_publisher(state.sessions.clone(), session.session_id, capacity);

    let cancel = CancellationToken::new();
    state
        .active
        .write()
        .await
        .insert(session.session_id, cancel.clone());

    let orchestrator = state.orchestrator.clone();
    let active = state.active.clone();
    let session_id = session.session_id;
    tokio::spawn(async move {
        // The run emits its own terminal event; errors are already
        // surfaced on the stream by the time this resolves.
        let _ = orchestrator
            .run(request, correlation_id, events, cancel)
            .await;
        active.write().await.remove(&session_id);
    });

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session.session_id,
            "correlation_id": correlation_id,
        }))),
    )
}

/// =============================
/// Stream Endpoint (SSE)
/// =============================

#[derive(Debug, Deserialize)]
struct StreamParams {
    session_id: Uuid,
    /// Highest sequence number the client has already processed.
    #[serde(default)]
    last_acked_seq: u64,
}

async fn stream_events(
    State(state): State<ApiState>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiResponse>)> {
    let (replay, rx) = state
        .sessions
        .attach(params.session_id, params.last_acked_seq)
        .await
        .map_err(|e| (StatusCode::GONE, Json(ApiResponse::error(e.to_string()))))?;

    let live = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|envelope| (envelope, rx))
    });

    let stream = futures::stream::iter(replay)
        .chain(live)
        // Close the stream right after the terminal event.
        .scan(false, |done, envelope| {
            let next = if *done { None } else { Some(envelope) };
            if let Some(envelope) = &next {
                *done = envelope.event.is_terminal();
            }
            futures::future::ready(next)
        })
        .map(|envelope| {
            let event = Event::default()
                .event(envelope.event.kind())
                .json_data(&envelope)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            Ok::<Event, Infallible>(event)
        });

    // No-buffering hints so intermediate proxies deliver immediately.
    Ok((
        [
            ("cache-control", "no-cache"),
            ("x-accel-buffering", "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

/// =============================
/// Abort Endpoint
/// =============================

async fn abort_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let active = state.active.read().await;
    match active.get(&session_id) {
        Some(cancel) => {
            cancel.cancel();
            info!(%session_id, "Client abort propagated");
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "session_id": session_id,
                    "aborting": true,
                }))),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(
                "no in-flight orchestration for that session".into(),
            )),
        ),
    }
}

/// =============================
/// Action Authorization Endpoint
/// =============================

#[derive(Debug, Deserialize)]
struct AuthorizeRequest {
    action: ProposedAction,
    token: Option<SignedToken>,
}

/// The signed-token boundary for sensitive actions. Execution systems must
/// clear this check before acting on a proposal; the orchestration core
/// never executes anything itself.
async fn authorize_action(
    State(state): State<ApiState>,
    Json(request): Json<AuthorizeRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    match state
        .gate
        .authorize(&request.action, request.token.as_ref())
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "authorized": true,
            }))),
        ),
        Err(e) => (
            StatusCode::FORBIDDEN,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// =============================
/// Trace Endpoint
/// =============================

async fn get_trace(
    State(state): State<ApiState>,
    Path(correlation_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.trace_store.get_trace(correlation_id).await {
        Ok(records) if records.is_empty() => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("no trace for that correlation id".into())),
        ),
        Ok(records) => (StatusCode::OK, Json(ApiResponse::success(records))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("trace lookup failed: {}", e))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<SessionManager>,
    trace_store: Arc<dyn TraceStore>,
    gate: Arc<dyn ActionGate>,
) -> Router {
    let state = ApiState {
        orchestrator,
        sessions,
        trace_store,
        gate,
        active: Arc::new(RwLock::new(HashMap::new())),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/advise", post(start_advise))
        .route("/api/advise/stream", get(stream_events))
        .route("/api/advise/:session_id/abort", post(abort_session))
        .route("/api/actions/authorize", post(authorize_action))
        .route("/api/trace/:correlation_id", get(get_trace))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<SessionManager>,
    trace_store: Arc<dyn TraceStore>,
    gate: Arc<dyn ActionGate>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let _gc = sessions.spawn_gc();
    let router = create_router(orchestrator, sessions, trace_store, gate);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
