//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::pubsub::PubSub;
use crate::ws::SubscriptionServer;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Event bus that feeds every subscription.
    pub pubsub: PubSub,
    /// Protocol handler for the subscription endpoint.
    pub server: Arc<SubscriptionServer>,
}
