//! Request metrics middleware and the Prometheus exposition endpoint.

use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::AppState;

/// Count and time every request except the metrics scrape itself.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().to_string();
    if path == "/metrics" {
        return next.run(request).await;
    }

    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();

    metrics::counter!(
        "http_request_count",
        "method" => method.clone(),
        "endpoint" => path.clone(),
        "http_status" => status.clone()
    )
    .increment(1);
    metrics::histogram!(
        "http_request_latency_seconds",
        "method" => method,
        "endpoint" => path,
        "http_status" => status
    )
    .record(started.elapsed().as_secs_f64());

    response
}

/// `GET /metrics`: render whatever the installed recorder has collected.
pub async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
