//! Provider contracts.
//!
//! Every item source implements [`Provider`]; sources that can stream logs
//! additionally implement [`LogProvider`]. Providers must be safe to call
//! concurrently with themselves and with other providers, and `list` must
//! honour cancellation.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::item::Item;
use crate::logline::LogLine;

/// An object supplying items of a given kind and executing actions on them.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier; equals the `kind` string of the items it emits.
    fn name(&self) -> &'static str;

    /// Current items known to this provider, in a stable order.
    async fn list(&self, cancel: CancellationToken) -> Result<Vec<Item>, CoreError>;

    /// Perform an action on the given item. Action names are provider-specific
    /// from {start, stop, restart, term, kill}; unknown names return
    /// [`CoreError::UnsupportedAction`].
    async fn action(
        &self,
        cancel: CancellationToken,
        item_id: &str,
        action: &str,
    ) -> Result<(), CoreError>;
}

/// A provider that can stream log lines for its items.
///
/// Repeated subscribes for the same item return receivers on the same
/// underlying channel. Receivers are lossy: a subscriber that falls behind
/// drops lines rather than stalling the producer.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        item_id: &str,
    ) -> Result<broadcast::Receiver<LogLine>, CoreError>;

    fn unsubscribe(&self, item_id: &str);
}
