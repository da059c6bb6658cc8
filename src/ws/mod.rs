//! WebSocket layer: the `graphql-ws` subscription transport.
//!
//! The endpoint (default `/graphql`) negotiates the `graphql-ws`
//! subprotocol and runs one [`connection::Connection`] state machine per
//! socket. Each started operation is driven by its own
//! [`operation::Operation`] task.

pub mod connection;
pub mod handler;
pub mod messages;
pub mod operation;
pub mod server;

pub use connection::{Connection, ConnectionState, run_connection};
pub use messages::{ClientMessage, MessageType, OperationMessage, PROTOCOL};
pub use server::SubscriptionServer;
