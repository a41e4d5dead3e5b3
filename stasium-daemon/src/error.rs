//! Error types for stasium-daemon.

use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime: supervisor, poll loop, store, and
/// provider wiring.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] stasium_core::CoreError),

    #[error("manifest error: {0}")]
    Manifest(#[from] stasium_manifest::ManifestError),

    #[error("transport error: {0}")]
    Transport(#[from] stasium_transport::TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
