mod health;
mod metrics;
mod relay;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(relay::relay_socket))
        .route("/ws", get(relay::relay_socket))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
