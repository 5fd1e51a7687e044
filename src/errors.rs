use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use relay_channels::ChannelError;
use relay_core::CoreError;
use relay_ssh::SshError;

/// Top-level error type for the gateway and background workers. Wraps
/// each sub-crate's error and maps it to an HTTP status the way spec §7
/// requires: breaker-open surfaces immediately, unknown entities are
/// structured, everything else becomes a best-effort 500.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// Short guidance suitable for a chat reply, replacing technical
    /// codes with next-step language (spec §7 "User-visible messages").
    pub fn user_guidance(&self) -> String {
        match self {
            RelayError::Unauthorized => "Unauthorized.".to_string(),
            RelayError::BadRequest(msg) => format!("Bad request: {msg}"),
            RelayError::Ssh(SshError::UnknownServer(id)) => {
                format!("Unknown server '{id}'.")
            }
            RelayError::Ssh(SshError::CircuitOpen(e)) => {
                format!("Server temporarily unavailable: {e}")
            }
            RelayError::Ssh(SshError::Delivery { server_id, source }) => {
                format!("Unable to reach server '{server_id}': {source}")
            }
            RelayError::Core(CoreError::UnknownServer(id)) => format!("Unknown server '{id}'."),
            RelayError::Core(CoreError::SessionNotFound(id)) => {
                format!("No active session for '{id}'.")
            }
            other => format!("Internal error: {other}"),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Core(CoreError::UnknownServer(_) | CoreError::SessionNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
