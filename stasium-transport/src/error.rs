//! Error types for stasium-transport.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error surface for the socket server and client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with a non-empty `error` field.
    #[error("server error: {0}")]
    Server(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.into(),
        source,
    }
}
