use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    connections: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Health {
        status: "Available",
        connections: state.connections.active(),
    })
}
