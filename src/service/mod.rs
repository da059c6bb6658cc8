//! Service layer: the demo subscription schema and connection
//! authentication served by the binary.
//!
//! [`build_schema`] wires subscription root fields to the shared
//! [`super::pubsub::PubSub`]; [`token_authenticator`] checks the
//! `authToken` carried by `connection_init`.

pub mod auth;
pub mod feeds;

pub use auth::token_authenticator;
pub use feeds::{POST_ADDED, build_schema};
