//! Metrics HTTP endpoint.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::metrics::IngressMetrics;

pub fn create_router(metrics: IngressMetrics) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<IngressMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Serve `GET /metrics` until the listener fails.
pub async fn serve_metrics(listener: TcpListener, metrics: IngressMetrics) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Metrics endpoint listening");
    axum::serve(listener, create_router(metrics)).await
}
