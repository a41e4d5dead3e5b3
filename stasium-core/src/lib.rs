//! Stasium core library — the uniform item model shared by every provider.
//!
//! Public API surface:
//! - [`item`] — [`Item`], [`Kind`], [`Status`], [`RestartPolicy`], the ID codec
//! - [`provider`] — [`Provider`] and [`LogProvider`] contracts
//! - [`logline`] — [`LogLine`]
//! - [`error`] — [`CoreError`]

pub mod error;
pub mod item;
pub mod logline;
pub mod provider;

pub use error::CoreError;
pub use item::{item_id, parse_item_id, Item, Kind, RestartPolicy, Status};
pub use logline::LogLine;
pub use provider::{LogProvider, Provider};
