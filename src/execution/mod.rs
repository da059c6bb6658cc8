//! Query-execution engine seam.
//!
//! The subscription transport only needs two things from an engine: a
//! `parse` step that rejects bad documents with a [`GraphQLError`], and a
//! `subscribe` step that yields either an immediate [`ExecutionResult`] or
//! a lazy [`ResultStream`]. [`Schema`] is a minimal engine that maps
//! subscription root fields to [`EventStream`](crate::pubsub::EventStream)
//! resolvers.

pub mod document;
pub mod result;
pub mod schema;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use document::{Document, OperationKind};
pub use result::{ExecutionResult, GraphQLError, Location, format_error};
pub use schema::{ResolverArgs, Schema, SchemaBuilder};

/// Lazy sequence of results for one live operation.
///
/// An `Err` item is terminal: the transport reports it and completes the
/// operation.
pub type ResultStream = BoxStream<'static, Result<ExecutionResult, GraphQLError>>;

/// What an engine returns for a subscribe request.
pub enum SubscribeOutcome {
    /// Execution finished without producing a stream (e.g. validation
    /// failure).
    Immediate(ExecutionResult),
    /// Results will be produced as events arrive.
    Stream(ResultStream),
}

impl fmt::Debug for SubscribeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(result) => f.debug_tuple("Immediate").field(result).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Authenticated identity attached to a connection by the authentication
/// hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier of the authenticated party.
    pub id: String,
    /// Additional attributes supplied by the hook.
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl Principal {
    /// Creates a principal without claims.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }
}

/// Per-operation context handed to the engine.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Connection the operation belongs to.
    pub connection_id: Uuid,
    /// Client-supplied operation id.
    pub operation_id: String,
    /// Principal established at `connection_init`, if any.
    pub principal: Option<Principal>,
}

/// Contract of the query-execution engine consumed by the transport.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + fmt::Debug {
    /// Parses a query document.
    ///
    /// # Errors
    ///
    /// Returns a syntax [`GraphQLError`] on malformed input.
    fn parse(&self, query: &str) -> Result<Document, GraphQLError>;

    /// Starts executing `document`.
    ///
    /// Validation and resolver failures are reported through
    /// [`SubscribeOutcome::Immediate`].
    ///
    /// # Errors
    ///
    /// Returns a [`GraphQLError`] when the engine fails outside of normal
    /// execution; the transport reports it as an operation `error`.
    async fn subscribe(
        &self,
        document: &Document,
        variables: Option<Map<String, Value>>,
        operation_name: Option<&str>,
        context: &OperationContext,
    ) -> Result<SubscribeOutcome, GraphQLError>;
}
