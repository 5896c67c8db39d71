//! HTTP status API.
//!
//! Read-only routes over the metrics registry and the queue depth, plus
//! the Prometheus exposition when a recorder is installed.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::metrics::{KindMetrics, MetricsRegistry};
use crate::queue::DurableQueue;
use crate::record::RecordKind;

/// Status API state.
#[derive(Clone)]
pub struct StatusApiState {
    pub metrics: Arc<MetricsRegistry>,
    pub queue: DurableQueue,
    /// Renders `/metrics`; the route answers 404 without it.
    pub prometheus: Option<PrometheusHandle>,
}

impl StatusApiState {
    pub const fn new(metrics: Arc<MetricsRegistry>, queue: DurableQueue) -> Self {
        Self {
            metrics,
            queue,
            prometheus: None,
        }
    }

    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Create the status API router.
pub fn status_router(state: StatusApiState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Processing state of one record kind.
#[derive(Debug, Serialize)]
pub struct KindStatus {
    #[serde(flatten)]
    pub metrics: KindMetrics,
    /// Entries waiting in the stream, `None` if the broker did not answer.
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub kinds: BTreeMap<RecordKind, KindStatus>,
}

/// Handle GET /health - liveness probe
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Handle GET /status - per-kind counters and queue depth
async fn handle_status(State(state): State<StatusApiState>) -> Json<StatusResponse> {
    let snapshot = state.metrics.snapshot();
    let mut kinds = BTreeMap::new();

    for (kind, metrics) in snapshot {
        let queue_depth = match state.queue.depth(kind).await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Failed to read queue depth");
                None
            }
        };
        kinds.insert(
            kind,
            KindStatus {
                metrics,
                queue_depth,
            },
        );
    }

    Json(StatusResponse { kinds })
}

/// Handle GET /metrics - Prometheus text exposition
async fn handle_metrics(State(state): State<StatusApiState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter disabled").into_response(),
    }
}
