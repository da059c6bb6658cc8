//! Topic handlers: publish onto the bus and list live subscriptions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;

use crate::api::dto::{PublishResponse, TopicListResponse};
use crate::app_state::AppState;
use crate::error::GatewayError;
use crate::pubsub::PubSubEngine;

/// `POST /topics/{topic}` — Publish the JSON body to `topic`.
///
/// Delivery is asynchronous; the response reports how many subscribers
/// were registered when the payload was accepted.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for a blank topic and
/// [`GatewayError::PubSub`] if the bus rejects the publish.
pub async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, GatewayError> {
    if topic.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "topic must not be empty".to_string(),
        ));
    }

    let subscribers = state.pubsub.topic_subscriber_count(&topic);
    state.pubsub.publish(&topic, payload).await?;
    tracing::debug!(%topic, subscribers, "published via http");

    let response = PublishResponse {
        topic,
        subscribers,
        published_at: Utc::now(),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// `GET /topics` — Live subscriber counts per topic.
pub async fn list_topics(State(state): State<AppState>) -> impl IntoResponse {
    Json(TopicListResponse::from(state.pubsub.topics()))
}

/// Topic routes, nested under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/topics", get(list_topics))
        .route("/topics/{topic}", post(publish))
}
