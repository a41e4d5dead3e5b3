//! Minimal compose-document parsing and container auto-import.
//!
//! Only the fields stasium needs are decoded; everything else in the compose
//! file is ignored.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ManifestError};

/// A minimal compose document: just the service map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
}

/// A minimal service definition from a compose file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A container to monitor, resolved from the manifest or auto-imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDef {
    /// Item name.
    pub name: String,
    /// Container name to match against the engine.
    pub container: String,
    /// Compose service name, matched via the engine's service label.
    pub service: String,
}

/// Read and decode a compose document.
pub fn parse_compose_file(path: &Path) -> Result<ComposeFile, ManifestError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    let compose: ComposeFile = serde_yaml::from_slice(&bytes).map_err(|e| ManifestError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(compose)
}

impl ComposeFile {
    /// Names of all services declared in the document.
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

/// Generate container definitions for compose services whose names are not
/// already taken by manifest items. A service without an explicit
/// `container_name` maps to the engine's `<project>-<service>-1` convention.
pub fn auto_import(
    compose: &ComposeFile,
    existing: &HashSet<String>,
    project: &str,
) -> Vec<ContainerDef> {
    let mut defs = Vec::new();
    for (name, service) in &compose.services {
        if existing.contains(name) {
            continue;
        }
        let container = if service.container_name.is_empty() && !project.is_empty() {
            format!("{project}-{name}-1")
        } else {
            service.container_name.clone()
        };
        defs.push(ContainerDef {
            name: name.clone(),
            container,
            service: name.clone(),
        });
    }
    defs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
