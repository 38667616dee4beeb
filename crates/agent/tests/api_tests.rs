//! Integration tests for the agent API endpoints

use async_trait::async_trait;
use aurora_agent::api::{create_router, AppState};
use aurora_lib::{
    collector::{CpuTimes, RawReadings, SystemSource},
    config::MonitorConfig,
    health::components,
    AlertLevel, Monitor,
};
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tokio_test::assert_ok;
use tower::ServiceExt;

struct StaticSource;

#[async_trait]
impl SystemSource for StaticSource {
    async fn read(&self) -> anyhow::Result<RawReadings> {
        Ok(RawReadings {
            cpu: CpuTimes { idle: 80, total: 100 },
            cores: 4,
            memory_total: 8_000,
            memory_available: 6_000,
            ..RawReadings::default()
        })
    }
}

fn setup_test_app() -> (Router, Monitor) {
    let mut config = MonitorConfig::default();
    config.alerts.cooldown_ms = 0;
    let monitor = Monitor::with_source(config, Arc::new(StaticSource)).unwrap();
    let router = create_router(Arc::new(AppState::new(monitor.clone())));
    (router, monitor)
}

async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, value)
}

async fn post(app: Router, uri: &str) -> StatusCode {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
    .status()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, monitor) = setup_test_app();
    monitor.health().register(components::COLLECTOR).await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["collector"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, monitor) = setup_test_app();
    monitor
        .health()
        .set_degraded(components::COLLECTOR, "last sample 30000ms ago")
        .await;

    let (status, health) = get(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, monitor) = setup_test_app();
    monitor
        .health()
        .set_unhealthy(components::WATCHDOG, "heartbeat timeout exceeded")
        .await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_monitor_lifecycle() {
    let (app, monitor) = setup_test_app();

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    assert_ok!(monitor.start().await);
    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);

    monitor.stop().await;
    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, monitor) = setup_test_app();
    monitor.collect().await.unwrap();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("aurora_memory_percent 25"));
    assert!(metrics_text.contains("aurora_watchdog_alive 1"));
}

#[tokio::test]
async fn test_status_reports_registrations() {
    let (app, monitor) = setup_test_app();
    monitor.create_circuit_breaker("openai", None);
    monitor.create_rate_limiter("telegram", None);

    let (status, body) = get(app, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["app_name"], "aurora-app");
    assert_eq!(body["circuit_breakers"], 1);
    assert_eq!(body["rate_limiters"], 1);
    assert_eq!(body["components"]["watchdog"], true);
}

#[tokio::test]
async fn test_alerts_can_be_filtered_and_acknowledged() {
    let (app, monitor) = setup_test_app();
    monitor.alerts().info("tests", "Deployed", "v2 rolled out").await;
    let critical = monitor
        .alerts()
        .critical("tests", "Database down", "connection refused")
        .await;

    let (status, alerts) = get(app.clone(), "/alerts?level=critical").await;
    assert_eq!(status, StatusCode::OK);
    let alerts = alerts.as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["title"], "Database down");

    let uri = format!("/alerts/{}/ack?by=oncall", critical.id);
    assert_eq!(post(app.clone(), &uri).await, StatusCode::NO_CONTENT);
    assert_eq!(post(app.clone(), "/alerts/missing/ack").await, StatusCode::NOT_FOUND);

    let acked = monitor.alerts().unacknowledged(Some(AlertLevel::Critical));
    assert!(acked.is_empty());

    let (_, alerts) = get(app, "/alerts?acknowledged=true").await;
    assert_eq!(alerts[0]["acknowledged_by"], "oncall");
}

#[tokio::test]
async fn test_breaker_and_limiter_stats() {
    let (app, monitor) = setup_test_app();
    let breaker = monitor.create_circuit_breaker("openai", None);
    breaker.force_open();
    monitor.create_rate_limiter("discord", None);

    let (status, breakers) = get(app.clone(), "/breakers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(breakers[0]["name"], "openai");
    assert_eq!(breakers[0]["state"], "open");

    let (status, limiters) = get(app, "/limiters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(limiters[0]["name"], "discord");
}

#[tokio::test]
async fn test_anomalies_endpoint_returns_history() {
    let (app, monitor) = setup_test_app();
    for value in [10.0, 11.0, 10.0, 12.0, 11.0, 10.0, 11.0, 10.0, 12.0, 11.0, 95.0] {
        monitor.record_metric("requests.latency_ms", value);
    }
    let found = monitor.detect().await;

    let (status, anomalies) = get(app, "/anomalies?limit=50").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(anomalies.as_array().unwrap().len(), found.len());
}

#[tokio::test]
async fn test_healing_reports_pressure_actions() {
    let (app, monitor) = setup_test_app();
    let actions = monitor.healer().handle_memory_pressure(97.0).await;
    assert_eq!(actions.len(), 3);

    let (status, healing) = get(app, "/healing?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(healing["stats"]["skipped_actions"], 3);
    assert_eq!(healing["stats"]["actions_by_type"]["memory_trim"], 1);
    let history = healing["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1]["action_type"], "memory_trim");
    assert_eq!(history[1]["outcome"], "skipped");
}

#[tokio::test]
async fn test_heartbeat_endpoint_records_liveness() {
    let (app, monitor) = setup_test_app();

    assert_eq!(post(app, "/heartbeat").await, StatusCode::NO_CONTENT);
    assert_eq!(monitor.watchdog().status().heartbeats, 1);
}
