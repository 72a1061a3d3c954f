//! Health and admin endpoints for consumer processes.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)
//! - Dedup store admin (`GET /admin/dedup`, `DELETE /admin/dedup`)
//! - DLQ depth (`GET /admin/dlq/stats`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::dedup::DedupStore;
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Broker connection; readiness reports "not_configured" without one.
    pub redis: Option<ConnectionManager>,
    pub app_name: String,
    pub app_version: String,
    /// Source topic
    pub topic: String,
    /// Dead-letter topic, if routing is enabled
    pub dlq_topic: Option<String>,
    /// Dedup store, if idempotency is enabled
    pub dedup: Option<Arc<dyn DedupStore>>,
}

impl HealthState {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            redis: None,
            app_name: app_name.into(),
            app_version: app_version.into(),
            topic: topic.into(),
            dlq_topic: None,
            dedup: None,
        }
    }

    pub fn with_redis(mut self, redis: ConnectionManager) -> Self {
        self.redis = Some(redis);
        self
    }

    pub fn with_dlq_topic(mut self, dlq_topic: Option<&str>) -> Self {
        self.dlq_topic = dlq_topic.map(str::to_string);
        self
    }

    pub fn with_dedup_store(mut self, dedup: Option<Arc<dyn DedupStore>>) -> Self {
        self.dedup = dedup;
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Checks that the broker answers PING.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let Some(mut conn) = state.redis.clone() else {
        return Ok((
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": { "redis": "not_configured" } })),
        ));
    };

    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    match result {
        Ok(response) if response == "PONG" => Ok((
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": { "redis": "ok" } })),
        )),
        Ok(response) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("unexpected response: {}", response) }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// `GET /admin/dedup`
pub async fn dedup_stats_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = state.dedup.as_ref().ok_or_else(idempotency_disabled)?;
    Ok(Json(json!({
        "topic": state.topic,
        "enabled": true,
        "size": store.size().await,
    })))
}

/// Forget every processed key.
///
/// `DELETE /admin/dedup`
pub async fn dedup_clear_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = state.dedup.as_ref().ok_or_else(idempotency_disabled)?;
    let cleared = store.size().await;
    store.clear().await;
    info!(topic = %state.topic, cleared = cleared, "Dedup store cleared via admin endpoint");
    Ok(Json(json!({
        "success": true,
        "cleared_count": cleared,
    })))
}

fn idempotency_disabled() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Idempotency is not enabled for this consumer" })),
    )
}

/// Dead-letter topic depth.
///
/// `GET /admin/dlq/stats`
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(dlq_topic) = state.dlq_topic.as_deref() else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Dead-letter queue is not enabled for this consumer" })),
        ));
    };
    let Some(mut conn) = state.redis.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Broker connection not configured" })),
        ));
    };

    let length: Result<u64, _> = redis::cmd("XLEN").arg(dlq_topic).query_async(&mut conn).await;

    match length {
        Ok(length) => Ok(Json(json!({
            "topic": state.topic,
            "dlq_topic": dlq_topic,
            "length": length,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("Failed to read DLQ length: {}", e) })),
        )),
    }
}

/// Create the health and admin router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dedup", get(dedup_stats_handler).delete(dedup_clear_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .with_state(state)
}
