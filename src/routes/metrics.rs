use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics — render the recorder's current snapshot in Prometheus
/// text exposition format. Mounted with its own state, separate from the
/// application router.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
