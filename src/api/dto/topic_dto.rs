//! Topic publish and listing DTOs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response body for `POST /topics/{topic}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Topic the payload was published on.
    pub topic: String,
    /// Subscribers registered on the topic at publish time.
    pub subscribers: usize,
    /// Time the publish was accepted.
    pub published_at: DateTime<Utc>,
}

/// Live subscriber count of one topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicSummaryDto {
    /// Topic name.
    pub topic: String,
    /// Number of live subscriptions.
    pub subscribers: usize,
}

/// Response body for `GET /topics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicListResponse {
    /// Topics with at least one subscriber, sorted by name.
    pub topics: Vec<TopicSummaryDto>,
    /// Sum of all subscriber counts.
    pub total_subscribers: usize,
}

impl From<BTreeMap<String, usize>> for TopicListResponse {
    fn from(counts: BTreeMap<String, usize>) -> Self {
        let total_subscribers = counts.values().sum();
        let topics = counts
            .into_iter()
            .map(|(topic, subscribers)| TopicSummaryDto { topic, subscribers })
            .collect();
        Self {
            topics,
            total_subscribers,
        }
    }
}
