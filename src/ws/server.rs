//! Configured subscription protocol handler.
//!
//! [`SubscriptionServer`] bundles the execution engine with the two
//! injectable hooks of the protocol: authentication at `connection_init`
//! and error formatting for `data`/`error` payloads.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::execution::{ExecutionEngine, GraphQLError, Principal, format_error};

/// Authentication hook: receives the `connection_init` payload and returns
/// the authenticated principal, or the reason for rejection.
pub type AuthenticateFn =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Principal, String>> + Send + Sync>;

/// Error formatting hook used for every error sent to clients.
pub type ErrorFormatter = Arc<dyn Fn(&GraphQLError) -> Value + Send + Sync>;

/// Protocol handler shared by every connection of one endpoint.
pub struct SubscriptionServer {
    engine: Arc<dyn ExecutionEngine>,
    authenticate: Option<AuthenticateFn>,
    format_error: ErrorFormatter,
    keep_alive: Option<Duration>,
}

impl fmt::Debug for SubscriptionServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionServer")
            .field("engine", &self.engine)
            .field("authenticate", &self.authenticate.is_some())
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl SubscriptionServer {
    /// Creates a handler without authentication or keep-alive, using the
    /// default error formatter.
    #[must_use]
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            authenticate: None,
            format_error: Arc::new(|err: &GraphQLError| format_error(err, false)),
            keep_alive: None,
        }
    }

    /// Installs the authentication hook.
    #[must_use]
    pub fn with_authenticate<F, Fut>(mut self, authenticate: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Principal, String>> + Send + 'static,
    {
        self.authenticate = Some(Arc::new(move |payload| authenticate(payload).boxed()));
        self
    }

    /// Replaces the error formatter.
    #[must_use]
    pub fn with_error_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&GraphQLError) -> Value + Send + Sync + 'static,
    {
        self.format_error = Arc::new(formatter);
        self
    }

    /// Uses the default formatter, exposing underlying failures when
    /// `debug` is set.
    #[must_use]
    pub fn with_debug_errors(self, debug: bool) -> Self {
        self.with_error_formatter(move |err| format_error(err, debug))
    }

    /// Sends `ka` right after `connection_ack` and then every `interval`.
    /// `None` disables keep-alive.
    #[must_use]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval.filter(|i| !i.is_zero());
        self
    }

    /// The execution engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    /// The authentication hook, if installed.
    #[must_use]
    pub fn authenticator(&self) -> Option<&AuthenticateFn> {
        self.authenticate.as_ref()
    }

    /// The error formatter.
    #[must_use]
    pub fn error_formatter(&self) -> &ErrorFormatter {
        &self.format_error
    }

    /// Keep-alive interval, if enabled.
    #[must_use]
    pub const fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }
}
