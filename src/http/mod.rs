//! HTTP surface exposed by the agent (spec.md §6).

pub mod collector;
pub mod custom_metrics;
pub mod health;
pub mod metrics;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use crate::ingest::IngestPipeline;
use crate::metrics::Metrics as AgentMetrics;
use custom_metrics::CustomMetricsState;
use health::HealthRegistry;

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestPipeline>,
    pub metrics: Arc<AgentMetrics>,
    pub health: Arc<HealthRegistry>,
    pub custom_metrics: Arc<CustomMetricsState>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/collector", post(collector::handle))
        .route("/metrics", get(metrics::handle))
        .route("/healthz", get(health::handle))
        .route("/debug/pprof/*path", get(pprof_stub))
        .route("/apis/custom.metrics.k8s.io", get(custom_metrics::group_list))
        .nest("/apis/custom.metrics.k8s.io/v1beta1", custom_metrics::router())
        .with_state(state)
}

async fn pprof_stub() -> StatusCode {
    StatusCode::NOT_FOUND
}
