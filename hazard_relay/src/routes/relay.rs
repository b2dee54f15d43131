use crate::{handler::serve_connection, server::SharedState};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
};
use std::net::SocketAddr;

pub async fn relay_socket(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, peer, state))
}
