//! Manifest-driven provider registration at daemon startup.

use std::collections::HashSet;
use std::path::Path;

use stasium_manifest::{auto_import, parse_compose_file, Manifest};

use crate::providers::ContainerProvider;
use crate::supervisor::Supervisor;

/// What the manifest contributed beyond direct registrations.
#[derive(Debug, Default)]
pub struct Bootstrap {
    /// OS units named by os-unit items, for the os-unit provider.
    pub os_units: Vec<String>,
}

/// Walk the manifest's items: register supervised processes, declare
/// containers, collect OS units, and auto-import compose services whose names
/// no manifest item already uses.
pub fn apply_manifest(
    manifest: &Manifest,
    supervisor: &Supervisor,
    containers: &ContainerProvider,
) -> Bootstrap {
    let mut bootstrap = Bootstrap::default();

    for (name, item) in &manifest.items {
        match item.kind.as_str() {
            "os-unit" => bootstrap.os_units.push(item.unit.clone()),
            "supervised-process" => supervisor.register(
                name,
                &item.command,
                &item.dir,
                item.env.clone(),
                item.restart_policy(),
            ),
            "container" => {
                containers.add_container(name, &item.container, &item.service, &item.compose_file);
            }
            _ => {}
        }
    }

    if let Some(compose) = &manifest.compose {
        if !compose.file.is_empty() {
            match parse_compose_file(Path::new(&compose.file)) {
                Ok(compose_file) => {
                    let existing: HashSet<String> = manifest.items.keys().cloned().collect();
                    for def in auto_import(&compose_file, &existing, &manifest.project) {
                        containers.add_container(&def.name, &def.container, &def.service, &compose.file);
                    }
                }
                Err(err) => {
                    tracing::warn!(file = %compose.file, error = %err, "compose parse failed");
                }
            }
        }
    }

    bootstrap
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
