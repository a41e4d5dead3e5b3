//! The NDJSON envelope and the shared request/response payload types.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum accepted line length; longer lines terminate the connection.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

// Process-wide monotonic counter behind `req-<n>` / `evt-<n>` ids. Scoped to
// this module so the rest of the codebase has no ambient globals.
static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// The kind of envelope on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Req,
    Res,
    Evt,
}

/// One line of the wire protocol. Unknown fields on incoming envelopes are
/// ignored; `error` is non-empty only on responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Message {
    /// A new request with a unique `req-<n>` id.
    pub fn request(method: &str, data: Option<Value>) -> Self {
        Self {
            msg_type: MsgType::Req,
            id: format!("req-{}", next_seq()),
            method: method.to_owned(),
            data,
            error: String::new(),
        }
    }

    /// A response echoing the request's id.
    pub fn response(req_id: &str, method: &str, data: Option<Value>) -> Self {
        Self {
            msg_type: MsgType::Res,
            id: req_id.to_owned(),
            method: method.to_owned(),
            data,
            error: String::new(),
        }
    }

    /// An error response echoing the request's id.
    pub fn error_response(req_id: &str, method: &str, error: impl Into<String>) -> Self {
        Self {
            msg_type: MsgType::Res,
            id: req_id.to_owned(),
            method: method.to_owned(),
            data: None,
            error: error.into(),
        }
    }

    /// A server-pushed event with a fresh `evt-<n>` id.
    pub fn event(method: &str, data: Option<Value>) -> Self {
        Self {
            msg_type: MsgType::Evt,
            id: format!("evt-{}", next_seq()),
            method: method.to_owned(),
            data,
            error: String::new(),
        }
    }
}

/// Request method names.
pub mod method {
    pub const PING: &str = "Ping";
    pub const LOAD_MANIFEST: &str = "LoadManifest";
    pub const LIST_ITEMS: &str = "ListItems";
    pub const GET_ITEM: &str = "GetItem";
    pub const ACTION: &str = "Action";
    pub const UPDATE_MANIFEST: &str = "UpdateManifest";
    pub const LOGS_SUBSCRIBE: &str = "LogsSubscribe";
    pub const LOGS_UNSUBSCRIBE: &str = "LogsUnsubscribe";
}

/// Server-pushed event names.
pub mod event {
    pub const ITEMS_DELTA: &str = "items.delta";
    pub const LOGS_LINE: &str = "logs.line";
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub pong: bool,
}

/// Payload for `Action`: dispatched to the provider matching the id's kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub item_id: String,
    /// One of start, stop, restart, term, kill (provider-specific).
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetItemRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadManifestRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsSubscribeRequest {
    pub item_id: String,
}

/// A named manifest item carried as opaque fields; the manifest layer decodes
/// and validates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub name: String,
    pub item: Value,
}

/// Payload for `UpdateManifest`: exactly one of the three operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UpdateManifestRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_item: Option<ItemPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_item: Option<ItemPatch>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remove_item: String,
}

/// Structured result for manifest mutations; validation failures arrive here,
/// not as transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifestResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl UpdateManifestResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self { ok: false, errors }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
