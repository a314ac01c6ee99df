// Error types for the server crate.
//
// Nothing in the control server is fatal to the process: most failures are
// logged and the offending message dropped (see `server.rs`). The types here
// cover the few places that hand an error back to the caller: proxy
// registration, configuration loading and the blocking client.

use drivelink_protocol::{ProtocolError, Response};
use thiserror::Error;

/// Errors returned by `ControlServer` setup calls.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid {role} address {address:?}: expected four dot-separated octets in 0..=255")]
    InvalidAddress { role: &'static str, address: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading a `ServerConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by `NetClient`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected response during handshake: {0:?}")]
    UnexpectedResponse(Response),

    #[error("registration refused by the server")]
    Refused,
}
