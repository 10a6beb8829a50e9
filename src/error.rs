//! Error types.
//!
//! Transport errors stay inside the transport (reconnect/fallback handles
//! them); only [`TransportError::NotViable`] reaches callers of `send`.
//! Command and business errors propagate to the caller and are also
//! recorded on the timeline by the session controller.

use thiserror::Error;

use crate::connection::ConnectionMode;

/// Errors returned by the REST collaborator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server returned a non-2xx HTTP status.
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    /// The response body could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Server { status: 404, .. })
    }
}

/// Errors surfaced by [`crate::transport::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// Neither the channel nor polling can currently carry a command.
    #[error("no viable transport (mode: {mode})")]
    NotViable { mode: ConnectionMode },
    /// The transport driver has shut down.
    #[error("transport closed")]
    Closed,
    #[error("channel error: {0}")]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("command delivery over REST failed: {0}")]
    Rest(#[from] ClientError),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

/// Errors from user-issued commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no session attached")]
    NoSession,
    #[error("{action} is not possible while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
    /// The server accepted the request but reported failure.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Api(#[from] ClientError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
