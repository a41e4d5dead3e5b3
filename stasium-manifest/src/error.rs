//! Error types for stasium-manifest.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from manifest document operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O failure, with the path that failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML decode/encode error without file context (in-memory parse).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load — includes the file path.
    #[error("failed to parse manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The manifest file did not exist at the expected path.
    #[error("manifest not found at {path}")]
    NotFound { path: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ManifestError {
    ManifestError::Io {
        path: path.into(),
        source,
    }
}
