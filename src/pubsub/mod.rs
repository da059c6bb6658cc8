//! Event distribution: the topic-keyed bus and the bridge that exposes
//! bus subscriptions as pull-based streams.

pub mod bridge;
pub mod bus;

pub use bridge::{EventStream, StreamCloser};
pub use bus::{Callback, PubSub, PubSubEngine, SubscriptionHandle};
