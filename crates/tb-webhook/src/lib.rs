//! HTTP surface of the bridge.
//!
//! - `POST /v1/webhook`: signature check, schema validation, normalization,
//!   deduplicated publish to the bus.
//! - `GET /`: liveness of the bus and claim store.
//! - `GET /metrics`: Prometheus exposition.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use lapin::Connection;
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use tower_http::trace::TraceLayer;

use tb_bus::BusMonitor;
use tb_config::AppConfig;

pub mod auth;
mod error;
mod health;
pub mod inbound;
mod metrics_mw;
mod schema;
mod webhook;

pub use error::WebhookError;
pub use inbound::InboundPipeline;
pub use schema::WebhookSchema;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<InboundPipeline>,
    pub schema: Arc<WebhookSchema>,
    pub amqp: Arc<Connection>,
    pub bus_monitor: Arc<BusMonitor>,
    pub redis: Option<ConnectionManager>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/webhook", post(webhook::handle_webhook))
        .route("/", get(health::health))
        .route("/metrics", get(metrics_mw::render_metrics))
        .layer(middleware::from_fn(metrics_mw::track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
