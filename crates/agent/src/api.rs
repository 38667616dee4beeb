//! HTTP API for health, metrics, status and the live event stream

use aurora_lib::{alerts::AlertQuery, health::ComponentStatus, Monitor};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub monitor: Monitor,
}

impl AppState {
    pub fn new(monitor: Monitor) -> Self {
        Self { monitor }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AckParams {
    pub by: Option<String>,
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.monitor.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.monitor.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.metrics().encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.monitor.status().await)
}

async fn alerts(State(state): State<Arc<AppState>>, Query(query): Query<AlertQuery>) -> impl IntoResponse {
    Json(state.monitor.alerts().history(&query))
}

async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<AckParams>,
) -> StatusCode {
    let by = params.by.as_deref().unwrap_or("api");
    if state.monitor.alerts().acknowledge(&id, by) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn anomalies(State(state): State<Arc<AppState>>, Query(params): Query<LimitParams>) -> impl IntoResponse {
    Json(state.monitor.detector().history(params.limit))
}

async fn breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.monitor.breakers().all_stats())
}

async fn limiters(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.monitor.limiters().all_stats())
}

async fn healing(State(state): State<Arc<AppState>>, Query(params): Query<LimitParams>) -> impl IntoResponse {
    let healer = state.monitor.healer();
    Json(serde_json::json!({
        "stats": healer.stats(),
        "targets": healer.all_target_status(),
        "history": healer.history(params.limit),
    }))
}

async fn heartbeat(State(state): State<Arc<AppState>>) -> StatusCode {
    state.monitor.heartbeat().await;
    StatusCode::NO_CONTENT
}

/// Server-sent events, one per bus event; lagged events are skipped
async fn events(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.monitor.subscribe()).filter_map(|received| {
        let event = received.ok()?;
        Event::default()
            .event(event.kind())
            .json_data(&event)
            .ok()
            .map(Ok::<_, Infallible>)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/alerts", get(alerts))
        .route("/alerts/:id/ack", post(acknowledge_alert))
        .route("/anomalies", get(anomalies))
        .route("/breakers", get(breakers))
        .route("/limiters", get(limiters))
        .route("/healing", get(healing))
        .route("/heartbeat", post(heartbeat))
        .route("/events", get(events))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
