//! Demo subscription feeds.
//!
//! - `postAdded(author: String)`: every payload published on
//!   [`POST_ADDED`], optionally narrowed to one author.
//! - `tick(intervalMs: Int, count: Int)`: a server-side ticker, ending
//!   after `count` ticks when given.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use crate::execution::{GraphQLError, ResolverArgs, Schema};
use crate::pubsub::{EventStream, PubSub, PubSubEngine};

/// Topic carrying newly added posts.
pub const POST_ADDED: &str = "POST_ADDED";

/// Default `tick` period when `intervalMs` is omitted.
pub const DEFAULT_TICK_MS: u64 = 1_000;

/// Builds the schema served by the gateway.
#[must_use]
pub fn build_schema(pubsub: &PubSub) -> Schema {
    let engine: Arc<dyn PubSubEngine> = Arc::new(pubsub.clone());
    Schema::builder()
        .subscription("postAdded", move |args| {
            Ok(post_added(Arc::clone(&engine), &args))
        })
        .subscription("tick", tick)
        .build()
}

fn post_added(engine: Arc<dyn PubSubEngine>, args: &ResolverArgs) -> EventStream {
    let stream = EventStream::topics(engine, [POST_ADDED]);
    match args.str("author").map(str::to_string) {
        Some(author) => stream.filter(move |payload| post_author(payload) == Some(author.as_str())),
        None => stream,
    }
}

/// Author of a published post, whether or not the payload is wrapped in
/// a `postAdded` key.
fn post_author(payload: &Value) -> Option<&str> {
    payload
        .get("postAdded")
        .unwrap_or(payload)
        .get("author")
        .and_then(Value::as_str)
}

fn tick(args: ResolverArgs) -> Result<EventStream, GraphQLError> {
    let interval_ms = match args.arguments.get("intervalMs") {
        None | Some(Value::Null) => DEFAULT_TICK_MS,
        Some(value) => value
            .as_u64()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| GraphQLError::new("intervalMs must be a positive integer."))?,
    };
    let count = args.u64("count");
    Ok(EventStream::interval(
        Duration::from_millis(interval_ms),
        count,
        |n| json!({ "count": n, "at": Utc::now().to_rfc3339() }),
    ))
}
