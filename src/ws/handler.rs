//! Axum WebSocket upgrade handler.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;

use super::connection::run_connection;
use super::messages::PROTOCOL;
use crate::app_state::AppState;

/// `GET <subscription path>` — Upgrade to a `graphql-ws` WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let server = Arc::clone(&state.server);

    ws.protocols([PROTOCOL])
        .on_upgrade(move |socket| run_connection(socket, server))
}
