//! Stasium transport — NDJSON envelopes over a local Unix socket.
//!
//! One JSON object per LF-terminated line, 1 MiB maximum. Requests carry a
//! sender-unique `id` echoed on the response; events are server-pushed with
//! fresh ids. See [`protocol::Message`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use error::TransportError;
pub use protocol::{
    event, method, ActionRequest, GetItemRequest, ItemPatch, LoadManifestRequest,
    LogsSubscribeRequest, Message, MsgType, PingResponse, UpdateManifestRequest,
    UpdateManifestResponse, MAX_LINE_BYTES,
};
pub use server::{Handler, HandlerFuture, Server};
