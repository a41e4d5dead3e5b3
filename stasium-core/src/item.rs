//! Domain types for managed items and the item ID codec.
//!
//! An item ID is `kind:provider:native_id`. The native segment may itself
//! contain `:`; decoding splits on the first two delimiters only.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The category of a managed item. Closed set; doubles as the provider name
/// used for action dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    OsUnit,
    GenericProcess,
    SupervisedProcess,
    Container,
    LogSource,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::OsUnit => "os-unit",
            Kind::GenericProcess => "generic-process",
            Kind::SupervisedProcess => "supervised-process",
            Kind::Container => "container",
            Kind::LogSource => "log-source",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "os-unit" => Ok(Kind::OsUnit),
            "generic-process" => Ok(Kind::GenericProcess),
            "supervised-process" => Ok(Kind::SupervisedProcess),
            "container" => Ok(Kind::Container),
            "log-source" => Ok(Kind::LogSource),
            _ => Err(()),
        }
    }
}

/// Current state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
    Failed,
    Restarting,
    #[default]
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
            Status::Restarting => "restarting",
            Status::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// How a supervised process is respawned after exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        };
        f.write_str(s)
    }
}

impl FromStr for RestartPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "never" => Ok(RestartPolicy::Never),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// The universal record for a managed service, process, container, or log
/// source. Items are immutable values produced freshly per poll cycle;
/// identity is the `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub kind: Kind,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub status: Status,
    #[serde(default)]
    pub score: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<i32>,
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub mem_bytes: u64,
    #[serde(default)]
    pub uptime_sec: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub source: HashMap<String, String>,
}

impl Item {
    /// Construct an item with the encoded ID and defaulted gauges.
    pub fn new(kind: Kind, provider: &str, native_id: &str, name: impl Into<String>) -> Self {
        Self {
            id: item_id(kind, provider, native_id),
            kind,
            name: name.into(),
            group: String::new(),
            status: Status::Unknown,
            score: 0,
            pids: Vec::new(),
            cpu_pct: 0.0,
            mem_bytes: 0,
            uptime_sec: 0,
            ports: Vec::new(),
            tags: Vec::new(),
            source: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ID codec
// ---------------------------------------------------------------------------

const ID_DELIMITER: char = ':';

/// Encode `(kind, provider, native_id)` as `kind:provider:native_id`.
pub fn item_id(kind: Kind, provider: &str, native_id: &str) -> String {
    format!("{kind}{ID_DELIMITER}{provider}{ID_DELIMITER}{native_id}")
}

/// Decode an item ID into `(kind, provider, native_id)`.
///
/// Splits on the first two delimiters only, so the native segment keeps any
/// further `:` verbatim. Fails with [`CoreError::MalformedId`] when the ID
/// does not produce three parts or the kind segment is not a known kind.
pub fn parse_item_id(id: &str) -> Result<(Kind, &str, &str), CoreError> {
    let mut parts = id.splitn(3, ID_DELIMITER);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(provider), Some(native_id)) => {
            let kind = kind
                .parse::<Kind>()
                .map_err(|_| CoreError::MalformedId { id: id.to_owned() })?;
            Ok((kind, provider, native_id))
        }
        _ => Err(CoreError::MalformedId { id: id.to_owned() }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrip() {
        let id = item_id(Kind::SupervisedProcess, "supervisor", "php-serve");
        assert_eq!(id, "supervised-process:supervisor:php-serve");
        let (kind, provider, native) = parse_item_id(&id).expect("parse");
        assert_eq!(kind, Kind::SupervisedProcess);
        assert_eq!(provider, "supervisor");
        assert_eq!(native, "php-serve");
    }

    #[test]
    fn native_segment_keeps_delimiters() {
        let id = item_id(Kind::LogSource, "filetail", "app:/var/log/app.log");
        let (kind, provider, native) = parse_item_id(&id).expect("parse");
        assert_eq!(kind, Kind::LogSource);
        assert_eq!(provider, "filetail");
        assert_eq!(native, "app:/var/log/app.log");
    }

    #[test]
    fn too_few_parts_is_malformed() {
        let err = parse_item_id("container:mysql").unwrap_err();
        assert!(matches!(err, CoreError::MalformedId { .. }), "got: {err}");
        assert!(err.to_string().contains("container:mysql"));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let err = parse_item_id("widget:prov:x").unwrap_err();
        assert!(matches!(err, CoreError::MalformedId { .. }));
    }

    #[test]
    fn kind_strings_roundtrip() {
        for kind in [
            Kind::OsUnit,
            Kind::GenericProcess,
            Kind::SupervisedProcess,
            Kind::Container,
            Kind::LogSource,
        ] {
            assert_eq!(kind.as_str().parse::<Kind>(), Ok(kind));
        }
    }

    #[test]
    fn item_serde_skips_empty_collections() {
        let item = Item::new(Kind::Container, "container", "db", "db");
        let json = serde_json::to_value(&item).expect("serialize");
        assert_eq!(json["id"], "container:container:db");
        assert_eq!(json["status"], "unknown");
        assert!(json.get("pids").is_none());
        assert!(json.get("source").is_none());
    }

    #[test]
    fn restart_policy_default_is_on_failure() {
        assert_eq!(RestartPolicy::default(), RestartPolicy::OnFailure);
        assert_eq!("on-failure".parse::<RestartPolicy>(), Ok(RestartPolicy::OnFailure));
    }
}
