//! stargate-ws server entry point.
//!
//! Starts the Axum HTTP server with REST and `graphql-ws` endpoints.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use stargate_ws::app_state::AppState;
use stargate_ws::config::{GatewayConfig, LogFormat};
use stargate_ws::pubsub::PubSub;
use stargate_ws::service::{build_schema, token_authenticator};
use stargate_ws::ws::SubscriptionServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = GatewayConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    tracing::info!(addr = %config.listen_addr, "starting stargate-ws");

    // Build event layer
    let pubsub = PubSub::new();
    let schema = build_schema(&pubsub);

    // Build protocol handler
    let mut server = SubscriptionServer::new(Arc::new(schema))
        .with_debug_errors(config.debug_errors)
        .with_keep_alive(config.keep_alive());
    if let Some(token) = config.auth_token.clone() {
        server = server.with_authenticate(token_authenticator(token));
        tracing::info!("connection authentication enabled");
    }

    // Build application state
    let app_state = AppState {
        pubsub,
        server: Arc::new(server),
    };

    // Build router
    let app = stargate_ws::router(app_state, &config.subscription_path);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        path = %config.subscription_path,
        "server listening"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
