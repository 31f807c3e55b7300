use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{Encoder, TextEncoder};

use crate::services::metrics::TENANT_CONNECTIONS_GAUGE;

/// GET /metrics: tenancy gauges and counters in the Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let connections = TENANT_CONNECTIONS_GAUGE.get();
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut body) {
        tracing::error!("Failed to encode metrics: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            Vec::new(),
        );
    }
    tracing::trace!(
        tenant_connections = connections,
        bytes = body.len(),
        "Serving metrics scrape"
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        body,
    )
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;
    use crate::services::metrics::{record, PROVISIONING_COUNTER};

    #[tokio::test]
    async fn scrape_reports_tenancy_metrics_as_prometheus_text() {
        record::<(), ()>("scrape_test", &Ok(()));
        assert!(PROVISIONING_COUNTER.with_label_values(&["scrape_test", "ok"]).get() >= 1.0);

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("tenant_provisioning_total"));
        assert!(text.contains("tenant_connections_active"));
    }
}
