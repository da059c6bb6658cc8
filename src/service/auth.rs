//! Shared-token authentication for `connection_init`.

use std::future::{Ready, ready};

use serde_json::Value;

use crate::execution::Principal;

/// Rejection reason reported in `connection_error`.
pub const INVALID_CREDENTIALS: &str = "Invalid auth credentials.";

/// Returns an authentication hook accepting connections whose init
/// payload carries `authToken` equal to `expected`.
pub fn token_authenticator(
    expected: String,
) -> impl Fn(Option<Value>) -> Ready<Result<Principal, String>> + Send + Sync + 'static {
    move |payload| {
        let token = payload
            .as_ref()
            .and_then(|p| p.get("authToken"))
            .and_then(Value::as_str);
        ready(match token {
            Some(token) if token == expected => Ok(Principal::new("token")),
            _ => Err(INVALID_CREDENTIALS.to_string()),
        })
    }
}
