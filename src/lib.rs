//! # stargate-ws
//!
//! Live-query subscription gateway: the `graphql-ws` WebSocket transport
//! on top of an in-process publish/subscribe event bus.
//!
//! Clients open a socket, send `connection_init`, then `start` any number
//! of subscription operations. Each operation resolves to one or more bus
//! topics (or a server-side producer); every event published on those
//! topics is executed against the operation's selection and pushed back
//! as a `data` message until the client sends `stop`, the stream ends, or
//! the connection goes away.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)        publish, topics, health
//!     ├── WS Handler (ws/)            graphql-ws state machine
//!     │       │
//!     │       └── Operation tasks (ws/operation)
//!     │
//!     ├── ExecutionEngine (execution/)  parse + subscribe
//!     │
//!     ├── EventStream bridge (pubsub/bridge)
//!     └── PubSub bus (pubsub/bus)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod execution;
pub mod pubsub;
pub mod service;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;

/// Builds the full application router: REST endpoints plus the
/// subscription endpoint at `subscription_path`.
pub fn router(state: AppState, subscription_path: &str) -> Router {
    Router::new()
        .merge(api::build_router())
        .route(subscription_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
