//! Structural validation of a manifest document.

use crate::document::Manifest;

const RESTART_POLICIES: [&str; 3] = ["always", "on-failure", "never"];

/// Check the manifest for structural correctness. Returns one message per
/// violation; an empty vector means the document is valid.
pub fn validate(manifest: &Manifest) -> Vec<String> {
    let mut errs = Vec::new();

    if manifest.version != 1 {
        errs.push(format!("version must be 1, got {}", manifest.version));
    }

    if manifest.items.is_empty() {
        errs.push("manifest must define at least one item".to_owned());
    }

    for (name, item) in &manifest.items {
        match item.kind.as_str() {
            "os-unit" => {
                if item.unit.is_empty() {
                    errs.push(format!("item {name:?} (os-unit): unit is required"));
                }
            }
            "supervised-process" => {
                if item.command.is_empty() {
                    errs.push(format!(
                        "item {name:?} (supervised-process): command is required"
                    ));
                }
                if !item.restart.is_empty() && !RESTART_POLICIES.contains(&item.restart.as_str()) {
                    errs.push(format!(
                        "item {name:?} (supervised-process): restart must be always, on-failure, or never; got {:?}",
                        item.restart
                    ));
                }
            }
            "container" => {
                if item.container.is_empty() && (item.compose_file.is_empty() || item.service.is_empty()) {
                    errs.push(format!(
                        "item {name:?} (container): container or compose_file+service is required"
                    ));
                }
            }
            "log-source" => {
                if item.files.is_empty() {
                    errs.push(format!("item {name:?} (log-source): files is required"));
                }
            }
            "" => errs.push(format!("item {name:?}: kind is required")),
            other => errs.push(format!("item {name:?}: unknown kind {other:?}")),
        }
    }

    for group in &manifest.groups {
        for reference in &group.items {
            if !manifest.items.contains_key(reference) {
                errs.push(format!(
                    "group {:?} references unknown item {reference:?}",
                    group.name
                ));
            }
        }
    }

    errs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Group, ManifestItem};

    fn manifest_with(name: &str, item: ManifestItem) -> Manifest {
        let mut m = Manifest {
            version: 1,
            ..Default::default()
        };
        m.items.insert(name.to_owned(), item);
        m
    }

    fn assert_has_error(errs: &[String], substr: &str) {
        assert!(
            errs.iter().any(|e| e.contains(substr)),
            "expected error containing {substr:?}, got: {errs:?}"
        );
    }

    #[test]
    fn version_must_be_1() {
        let mut m = manifest_with(
            "x",
            ManifestItem {
                kind: "os-unit".into(),
                unit: "x.service".into(),
                ..Default::default()
            },
        );
        m.version = 2;
        assert_has_error(&validate(&m), "version must be 1, got 2");
    }

    #[test]
    fn empty_items_rejected() {
        let m = Manifest {
            version: 1,
            ..Default::default()
        };
        assert_has_error(&validate(&m), "at least one item");
    }

    #[test]
    fn os_unit_requires_unit() {
        let m = manifest_with(
            "nginx",
            ManifestItem {
                kind: "os-unit".into(),
                ..Default::default()
            },
        );
        assert_has_error(&validate(&m), "item \"nginx\" (os-unit): unit is required");
    }

    #[test]
    fn supervised_process_requires_command() {
        let m = manifest_with(
            "serve",
            ManifestItem {
                kind: "supervised-process".into(),
                ..Default::default()
            },
        );
        assert_has_error(
            &validate(&m),
            "item \"serve\" (supervised-process): command is required",
        );
    }

    #[test]
    fn supervised_process_rejects_bad_restart() {
        let m = manifest_with(
            "serve",
            ManifestItem {
                kind: "supervised-process".into(),
                command: "foo".into(),
                restart: "bogus".into(),
                ..Default::default()
            },
        );
        assert_has_error(&validate(&m), "restart must be always, on-failure, or never");
    }

    #[test]
    fn supervised_process_accepts_valid_restarts() {
        for policy in ["always", "on-failure", "never", ""] {
            let m = manifest_with(
                "s",
                ManifestItem {
                    kind: "supervised-process".into(),
                    command: "foo".into(),
                    restart: policy.into(),
                    ..Default::default()
                },
            );
            assert!(validate(&m).is_empty(), "restart={policy:?}");
        }
    }

    #[test]
    fn container_requires_container_or_compose_pair() {
        let m = manifest_with(
            "db",
            ManifestItem {
                kind: "container".into(),
                ..Default::default()
            },
        );
        assert_has_error(&validate(&m), "container or compose_file+service");

        let with_container = manifest_with(
            "db",
            ManifestItem {
                kind: "container".into(),
                container: "mysql".into(),
                ..Default::default()
            },
        );
        assert!(validate(&with_container).is_empty());

        let with_compose = manifest_with(
            "db",
            ManifestItem {
                kind: "container".into(),
                compose_file: "compose.yml".into(),
                service: "mysql".into(),
                ..Default::default()
            },
        );
        assert!(validate(&with_compose).is_empty());

        let compose_only = manifest_with(
            "db",
            ManifestItem {
                kind: "container".into(),
                compose_file: "compose.yml".into(),
                ..Default::default()
            },
        );
        assert_has_error(&validate(&compose_only), "container or compose_file+service");
    }

    #[test]
    fn log_source_requires_files() {
        let m = manifest_with(
            "log",
            ManifestItem {
                kind: "log-source".into(),
                ..Default::default()
            },
        );
        assert_has_error(&validate(&m), "item \"log\" (log-source): files is required");
    }

    #[test]
    fn unknown_and_missing_kinds() {
        let m = manifest_with(
            "x",
            ManifestItem {
                kind: "widget".into(),
                ..Default::default()
            },
        );
        assert_has_error(&validate(&m), "unknown kind \"widget\"");

        let m = manifest_with("x", ManifestItem::default());
        assert_has_error(&validate(&m), "item \"x\": kind is required");
    }

    #[test]
    fn group_members_must_exist() {
        let mut m = manifest_with(
            "nginx",
            ManifestItem {
                kind: "os-unit".into(),
                unit: "nginx.service".into(),
                ..Default::default()
            },
        );
        m.groups.push(Group {
            name: "web".into(),
            items: vec!["nginx".into(), "nonexistent".into()],
        });
        assert_has_error(
            &validate(&m),
            "group \"web\" references unknown item \"nonexistent\"",
        );
    }
}
