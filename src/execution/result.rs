//! Execution results and errors reported by the query-execution engine.

use serde::Serialize;
use serde_json::{Map, Value, json};

/// Position in the query document, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    /// Line number.
    pub line: usize,
    /// Column number.
    pub column: usize,
}

/// Error produced while parsing, validating or executing an operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct GraphQLError {
    /// Human-readable description.
    pub message: String,
    /// Document positions the error refers to.
    pub locations: Vec<Location>,
    /// Response path of the field that failed.
    pub path: Option<Vec<Value>>,
    /// Free-form metadata forwarded to the client.
    pub extensions: Option<Map<String, Value>>,
    /// Description of the underlying failure, exposed only in debug mode.
    pub original: Option<String>,
}

impl GraphQLError {
    /// Creates an error carrying only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
            original: None,
        }
    }

    /// Creates a syntax error at the given document position.
    #[must_use]
    pub fn syntax(description: impl AsRef<str>, location: Location) -> Self {
        Self::new(format!("Syntax Error: {}", description.as_ref())).at(location)
    }

    /// Adds a document location.
    #[must_use]
    pub fn at(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    /// Sets the response path.
    #[must_use]
    pub fn with_path(mut self, path: Vec<Value>) -> Self {
        self.path = Some(path);
        self
    }

    /// Records the underlying failure.
    #[must_use]
    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original = Some(original.into());
        self
    }
}

/// Outcome of executing one operation or one event of a subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Result data, `None` when execution failed before producing any.
    pub data: Option<Value>,
    /// Errors raised while producing `data`.
    pub errors: Vec<GraphQLError>,
}

impl ExecutionResult {
    /// Successful result.
    #[must_use]
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Failed result without data.
    #[must_use]
    pub fn from_error(error: GraphQLError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }

    /// Serializes the result into a `data` message payload, formatting each
    /// error with `format`.
    pub fn to_payload(&self, format: impl Fn(&GraphQLError) -> Value) -> Value {
        let mut payload = Map::new();
        payload.insert("data".to_string(), self.data.clone().unwrap_or(Value::Null));
        if !self.errors.is_empty() {
            payload.insert(
                "errors".to_string(),
                Value::Array(self.errors.iter().map(format).collect()),
            );
        }
        Value::Object(payload)
    }
}

/// Default error formatter.
///
/// Emits `message` plus `locations`, `path` and `extensions` when present.
/// With `debug` set, the underlying failure is added under
/// `extensions.exception`.
#[must_use]
pub fn format_error(error: &GraphQLError, debug: bool) -> Value {
    let mut formatted = Map::new();
    let message = if error.message.is_empty() {
        "An unknown error occurred."
    } else {
        error.message.as_str()
    };
    formatted.insert("message".to_string(), json!(message));
    if !error.locations.is_empty() {
        formatted.insert("locations".to_string(), json!(error.locations));
    }
    if let Some(path) = &error.path {
        formatted.insert("path".to_string(), json!(path));
    }

    let mut extensions = error.extensions.clone().unwrap_or_default();
    if debug && let Some(original) = &error.original {
        extensions.insert("exception".to_string(), json!({ "message": original }));
    }
    if !extensions.is_empty() {
        formatted.insert("extensions".to_string(), Value::Object(extensions));
    }
    Value::Object(formatted)
}
