//! Kubernetes custom-metrics shape (spec.md §4.G): a single synthetic
//! gauge, `cost_metrics_shipping_progress`, per pod.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::Api;

use crate::segment::SegmentStore;

use super::AppState;

pub struct CustomMetricsState {
    pub cost_store: Arc<SegmentStore>,
    pub row_limit: usize,
    pub max_interval: Duration,
    pub kube_client: Option<kube::Client>,
    pub component_label: String,
}

impl CustomMetricsState {
    /// `expected = (elapsed_ms / max_interval_ms) * row_limit`;
    /// `progress = pending / expected`, or 0 when nothing is pending.
    pub fn shipping_progress(&self) -> f64 {
        let pending = self.cost_store.pending();
        if pending == 0 {
            return 0.0;
        }
        let elapsed_ms = self.cost_store.elapsed_time().as_millis() as f64;
        let max_interval_ms = self.max_interval.as_millis() as f64;
        if max_interval_ms == 0.0 {
            return 0.0;
        }
        let expected = (elapsed_ms / max_interval_ms) * self.row_limit as f64;
        if expected == 0.0 {
            return 0.0;
        }
        pending as f64 / expected
    }

    /// Running pods matching the configured component label. Without a
    /// configured client, returns a single wildcard entry.
    pub async fn pod_names(&self) -> Vec<String> {
        let Some(client) = &self.kube_client else {
            return vec!["*".to_string()];
        };
        let api: Api<Pod> = Api::all(client.clone());
        let lp = ListParams::default().labels(&self.component_label);
        match api.list(&lp).await {
            Ok(list) => list
                .items
                .into_iter()
                .filter(|pod| {
                    pod.status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        == Some("Running")
                })
                .filter_map(|pod| pod.metadata.name)
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(api_resource_list))
        .route("/namespaces/:namespace/pods/*name", get(pod_metric))
}

/// `GET /apis/custom.metrics.k8s.io` — the API group discovery document
/// naming the one version this agent serves.
pub async fn group_list() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "kind": "APIGroup",
        "apiVersion": "v1",
        "name": "custom.metrics.k8s.io",
        "versions": [{
            "groupVersion": "custom.metrics.k8s.io/v1beta1",
            "version": "v1beta1",
        }],
        "preferredVersion": {
            "groupVersion": "custom.metrics.k8s.io/v1beta1",
            "version": "v1beta1",
        },
    }))
}

async fn api_resource_list() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": "custom.metrics.k8s.io/v1beta1",
        "resources": [{
            "name": "pods/cost_metrics_shipping_progress",
            "singularName": "",
            "namespaced": true,
            "kind": "MetricValueList",
            "verbs": ["get"]
        }]
    }))
}

async fn pod_metric(
    State(state): State<AppState>,
    Path((_namespace, raw_name)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let name = raw_name
        .trim_end_matches("/cost_metrics_shipping_progress")
        .to_string();
    let value = state.custom_metrics.shipping_progress();
    let timestamp = Utc::now().to_rfc3339();

    if name == "*" {
        let pods = state.custom_metrics.pod_names().await;
        let items: Vec<_> = pods
            .iter()
            .map(|pod_name| metric_value(pod_name, value, &timestamp))
            .collect();
        Json(serde_json::json!({
            "kind": "MetricValueList",
            "apiVersion": "custom.metrics.k8s.io/v1beta1",
            "items": items,
        }))
    } else {
        Json(metric_value(&name, value, &timestamp))
    }
}

fn metric_value(pod_name: &str, value: f64, timestamp: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "MetricValue",
        "apiVersion": "custom.metrics.k8s.io/v1beta1",
        "describedObject": {
            "kind": "Pod",
            "name": pod_name,
            "apiVersion": "v1",
        },
        "metricName": "cost_metrics_shipping_progress",
        "timestamp": timestamp,
        "value": value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentKind;
    use crate::segment::SegmentStoreConfig;

    #[test]
    fn progress_is_zero_when_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SegmentStore::new(
                dir.path(),
                ContentKind::Metrics,
                "writer",
                SegmentStoreConfig::default(),
            )
            .unwrap(),
        );
        let state = CustomMetricsState {
            cost_store: store,
            row_limit: 1000,
            max_interval: Duration::from_secs(600),
            kube_client: None,
            component_label: "app.kubernetes.io/component=aggregator".into(),
        };
        assert_eq!(state.shipping_progress(), 0.0);
    }

    #[tokio::test]
    async fn pod_names_defaults_to_wildcard_without_kube_client() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SegmentStore::new(
                dir.path(),
                ContentKind::Metrics,
                "writer",
                SegmentStoreConfig::default(),
            )
            .unwrap(),
        );
        let state = CustomMetricsState {
            cost_store: store,
            row_limit: 1000,
            max_interval: Duration::from_secs(600),
            kube_client: None,
            component_label: "app.kubernetes.io/component=aggregator".into(),
        };
        assert_eq!(state.pod_names().await, vec!["*".to_string()]);
    }

    #[tokio::test]
    async fn group_list_names_the_served_version() {
        let Json(body) = group_list().await;
        assert_eq!(body["kind"], "APIGroup");
        assert_eq!(
            body["preferredVersion"]["groupVersion"],
            "custom.metrics.k8s.io/v1beta1"
        );
    }
}
