//! Error taxonomy shared across providers and the daemon.

use thiserror::Error;

/// All errors that can arise from the item model and provider operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Item ID does not split into `kind:provider:native_id`.
    #[error("invalid item id {id:?}: expected kind:provider:native_id")]
    MalformedId { id: String },

    /// Requested entity (item, process name, unit) is absent.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// Envelope payload could not be decoded for the chosen method.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration rejected before any side effect (e.g. empty command).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Entity with that name already exists.
    #[error("{what} already exists: {name}")]
    Conflict { what: &'static str, name: String },

    /// The provider cannot perform the requested action name.
    #[error("unsupported action {action:?} for {target}")]
    UnsupportedAction { action: String, target: &'static str },

    /// Provider is disabled (engine unreachable); actions fail, list is empty.
    #[error("{0} provider unavailable")]
    Unavailable(&'static str),

    /// Underlying file/socket/process failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        CoreError::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn unsupported_action(action: impl Into<String>, target: &'static str) -> Self {
        CoreError::UnsupportedAction {
            action: action.into(),
            target,
        }
    }
}
