//! Stasium manifest — the declarative item table loaded from `stasium.yaml`.
//!
//! Public API surface:
//! - [`document`] — [`Manifest`] and friends, parse / load / atomic save
//! - [`validate`] — structural validation with human-readable messages
//! - [`compose`] — minimal compose-file parsing and container auto-import
//! - [`error`] — [`ManifestError`]

pub mod compose;
pub mod document;
pub mod error;
pub mod validate;

pub use compose::{auto_import, parse_compose_file, ComposeFile, ComposeService, ContainerDef};
pub use document::{load, parse, save, ComposeRef, Group, Manifest, ManifestItem, Rule};
pub use error::ManifestError;
pub use validate::validate;
