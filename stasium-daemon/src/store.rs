//! The in-memory manifest with atomic mutation and persistence.
//!
//! Every mutation works on a copy: apply, validate, persist, and only then
//! commit. A failure at any step leaves both the in-memory manifest and the
//! file exactly as they were. Persisting happens before any supervisor side
//! effect; the resulting [`ReloadAction`]s are returned to the coordinator,
//! which owns the supervisor.

use std::path::Path;

use tokio::sync::RwLock;

use stasium_manifest::{load, save, validate, Manifest, ManifestItem};
use stasium_transport::UpdateManifestResponse;

/// Supervisor follow-up required after a committed mutation. Only
/// supervised-process items produce actions; other kinds are observed by
/// their providers on the next poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadAction {
    /// Register the item and start it.
    Start { name: String, item: ManifestItem },
    /// Unregister first (command or directory changed), then register+start.
    Replace { name: String, item: ManifestItem },
    /// Re-register in place to refresh env/policy, then start.
    Refresh { name: String, item: ManifestItem },
    /// Unregister.
    Remove { name: String },
}

/// Owns the current manifest; all mutation goes through the write lock.
#[derive(Default)]
pub struct ManifestStore {
    inner: RwLock<Option<Manifest>>,
}

const SUPERVISED_KIND: &str = "supervised-process";

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the current manifest, if one is loaded.
    pub async fn manifest(&self) -> Option<Manifest> {
        self.inner.read().await.clone()
    }

    /// Load, validate, and install the manifest at `path`. Returns the error
    /// set on failure; the previous manifest stays installed.
    pub async fn load(&self, path: &Path) -> Result<(), Vec<String>> {
        let manifest = load(path).map_err(|err| vec![err.to_string()])?;
        let errors = validate(&manifest);
        if !errors.is_empty() {
            return Err(errors);
        }

        let items = manifest.items.len();
        *self.inner.write().await = Some(manifest);
        tracing::info!(path = %path.display(), items, "manifest loaded");
        Ok(())
    }

    /// Install an already-validated manifest (daemon bootstrap).
    pub async fn install(&self, manifest: Manifest) {
        *self.inner.write().await = Some(manifest);
    }

    /// Add a named item. Fails with *conflict* if the name exists.
    pub async fn add_item(
        &self,
        name: &str,
        fields: serde_json::Value,
    ) -> (UpdateManifestResponse, Vec<ReloadAction>) {
        let mut guard = self.inner.write().await;
        let Some(current) = guard.as_ref() else {
            return (no_manifest(), Vec::new());
        };
        if current.items.contains_key(name) {
            return (
                UpdateManifestResponse::failed(vec![format!("item already exists: {name}")]),
                Vec::new(),
            );
        }

        let item = match decode_item(fields) {
            Ok(item) => item,
            Err(message) => return (UpdateManifestResponse::failed(vec![message]), Vec::new()),
        };

        let mut copy = current.clone();
        copy.items.insert(name.to_owned(), item.clone());

        if let Err(response) = validate_and_persist(&copy) {
            return (response, Vec::new());
        }
        *guard = Some(copy);
        tracing::info!(name, kind = %item.kind, "manifest item added");

        let mut actions = Vec::new();
        if item.kind == SUPERVISED_KIND {
            actions.push(ReloadAction::Start {
                name: name.to_owned(),
                item,
            });
        }
        (UpdateManifestResponse::ok(), actions)
    }

    /// Replace an existing item's definition.
    pub async fn update_item(
        &self,
        name: &str,
        fields: serde_json::Value,
    ) -> (UpdateManifestResponse, Vec<ReloadAction>) {
        let mut guard = self.inner.write().await;
        let Some(current) = guard.as_ref() else {
            return (no_manifest(), Vec::new());
        };
        let Some(old) = current.items.get(name).cloned() else {
            return (
                UpdateManifestResponse::failed(vec![format!("item not found: {name}")]),
                Vec::new(),
            );
        };

        let item = match decode_item(fields) {
            Ok(item) => item,
            Err(message) => return (UpdateManifestResponse::failed(vec![message]), Vec::new()),
        };

        let mut copy = current.clone();
        copy.items.insert(name.to_owned(), item.clone());

        if let Err(response) = validate_and_persist(&copy) {
            return (response, Vec::new());
        }
        *guard = Some(copy);
        tracing::info!(name, kind = %item.kind, "manifest item updated");

        let mut actions = Vec::new();
        if item.kind == SUPERVISED_KIND {
            if old.kind == SUPERVISED_KIND && (old.command != item.command || old.dir != item.dir) {
                actions.push(ReloadAction::Replace {
                    name: name.to_owned(),
                    item,
                });
            } else {
                actions.push(ReloadAction::Refresh {
                    name: name.to_owned(),
                    item,
                });
            }
        } else if old.kind == SUPERVISED_KIND {
            actions.push(ReloadAction::Remove {
                name: name.to_owned(),
            });
        }
        (UpdateManifestResponse::ok(), actions)
    }

    /// Remove an item and scrub it from every group's membership list.
    pub async fn remove_item(&self, name: &str) -> (UpdateManifestResponse, Vec<ReloadAction>) {
        let mut guard = self.inner.write().await;
        let Some(current) = guard.as_ref() else {
            return (no_manifest(), Vec::new());
        };
        let Some(old) = current.items.get(name).cloned() else {
            return (
                UpdateManifestResponse::failed(vec![format!("item not found: {name}")]),
                Vec::new(),
            );
        };

        let mut copy = current.clone();
        copy.items.remove(name);
        for group in &mut copy.groups {
            group.items.retain(|member| member != name);
        }

        if let Err(response) = validate_and_persist(&copy) {
            return (response, Vec::new());
        }
        *guard = Some(copy);
        tracing::info!(name, kind = %old.kind, "manifest item removed");

        let mut actions = Vec::new();
        if old.kind == SUPERVISED_KIND {
            actions.push(ReloadAction::Remove {
                name: name.to_owned(),
            });
        }
        (UpdateManifestResponse::ok(), actions)
    }
}

fn no_manifest() -> UpdateManifestResponse {
    UpdateManifestResponse::failed(vec!["no manifest loaded".to_owned()])
}

fn decode_item(fields: serde_json::Value) -> Result<ManifestItem, String> {
    let item: ManifestItem =
        serde_json::from_value(fields).map_err(|err| format!("decode item: {err}"))?;
    if item.kind.is_empty() {
        return Err("item kind is required".to_owned());
    }
    Ok(item)
}

fn validate_and_persist(copy: &Manifest) -> Result<(), UpdateManifestResponse> {
    let errors = validate(copy);
    if !errors.is_empty() {
        return Err(UpdateManifestResponse::failed(errors));
    }
    save(copy, &copy.file_path)
        .map_err(|err| UpdateManifestResponse::failed(vec![err.to_string()]))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store_with_manifest(dir: &TempDir) -> ManifestStore {
        let path = dir.path().join("stasium.yaml");
        let mut manifest = Manifest {
            version: 1,
            project: "test".into(),
            root: "/app".into(),
            file_path: path.clone(),
            ..Default::default()
        };
        manifest.items.insert(
            "serve".into(),
            ManifestItem {
                kind: "supervised-process".into(),
                command: "php artisan serve".into(),
                dir: "/app".into(),
                ..Default::default()
            },
        );
        save(&manifest, &path).expect("seed manifest file");

        let store = ManifestStore::new();
        store.install(manifest).await;
        store
    }

    #[tokio::test]
    async fn add_item_commits_and_returns_start_action() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;

        let (response, actions) = store
            .add_item(
                "worker",
                json!({"kind": "supervised-process", "command": "run worker"}),
            )
            .await;

        assert!(response.ok, "errors: {:?}", response.errors);
        assert!(matches!(&actions[..], [ReloadAction::Start { name, .. }] if name == "worker"));
        let manifest = store.manifest().await.expect("manifest");
        assert!(manifest.items.contains_key("worker"));
        let on_disk = std::fs::read_to_string(dir.path().join("stasium.yaml")).expect("read");
        assert!(on_disk.contains("worker"));
    }

    #[tokio::test]
    async fn add_duplicate_name_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;

        let (response, actions) = store
            .add_item("serve", json!({"kind": "supervised-process", "command": "other"}))
            .await;

        assert!(!response.ok);
        assert!(response.errors[0].contains("already exists"));
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn invalid_add_leaves_memory_and_file_untouched() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;
        let before_file = std::fs::read(dir.path().join("stasium.yaml")).expect("read");
        let before_mem = store.manifest().await;

        let (response, actions) = store
            .add_item("x", json!({"kind": "supervised-process"}))
            .await;

        assert!(!response.ok);
        assert_eq!(
            response.errors,
            ["item \"x\" (supervised-process): command is required"]
        );
        assert!(actions.is_empty());
        assert_eq!(store.manifest().await, before_mem);
        assert_eq!(
            std::fs::read(dir.path().join("stasium.yaml")).expect("read"),
            before_file
        );
    }

    #[tokio::test]
    async fn update_with_changed_command_yields_replace() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;

        let (response, actions) = store
            .update_item(
                "serve",
                json!({"kind": "supervised-process", "command": "php artisan serve --port=9000", "dir": "/app"}),
            )
            .await;

        assert!(response.ok, "errors: {:?}", response.errors);
        assert!(matches!(&actions[..], [ReloadAction::Replace { name, .. }] if name == "serve"));
    }

    #[tokio::test]
    async fn update_with_same_command_yields_refresh() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;

        let (response, actions) = store
            .update_item(
                "serve",
                json!({"kind": "supervised-process", "command": "php artisan serve", "dir": "/app", "restart": "always"}),
            )
            .await;

        assert!(response.ok, "errors: {:?}", response.errors);
        assert!(matches!(&actions[..], [ReloadAction::Refresh { name, .. }] if name == "serve"));
    }

    #[tokio::test]
    async fn update_away_from_supervised_kind_yields_remove() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;

        let (response, actions) = store
            .update_item("serve", json!({"kind": "container", "container": "serve"}))
            .await;

        assert!(response.ok, "errors: {:?}", response.errors);
        assert!(matches!(&actions[..], [ReloadAction::Remove { name }] if name == "serve"));
    }

    #[tokio::test]
    async fn remove_scrubs_group_membership_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("stasium.yaml");
        let mut manifest = Manifest {
            version: 1,
            project: "test".into(),
            file_path: path.clone(),
            ..Default::default()
        };
        manifest.items.insert(
            "serve".into(),
            ManifestItem {
                kind: "supervised-process".into(),
                command: "php artisan serve".into(),
                ..Default::default()
            },
        );
        manifest.items.insert(
            "nginx".into(),
            ManifestItem {
                kind: "os-unit".into(),
                unit: "nginx.service".into(),
                ..Default::default()
            },
        );
        manifest.groups.push(stasium_manifest::Group {
            name: "web".into(),
            items: vec!["serve".into(), "nginx".into()],
        });
        save(&manifest, &path).expect("seed");
        let store = ManifestStore::new();
        store.install(manifest).await;

        let (response, actions) = store.remove_item("serve").await;

        assert!(response.ok, "errors: {:?}", response.errors);
        assert!(matches!(&actions[..], [ReloadAction::Remove { name }] if name == "serve"));
        let manifest = store.manifest().await.expect("manifest");
        assert!(!manifest.items.contains_key("serve"));
        assert_eq!(manifest.groups[0].items, ["nginx"]);

        let on_disk = stasium_manifest::load(&path).expect("reload");
        assert_eq!(on_disk.groups[0].items, ["nginx"]);
    }

    #[tokio::test]
    async fn remove_unknown_item_fails() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_with_manifest(&dir).await;
        let (response, _) = store.remove_item("ghost").await;
        assert!(!response.ok);
        assert!(response.errors[0].contains("not found"));
    }

    #[tokio::test]
    async fn mutation_without_manifest_fails() {
        let store = ManifestStore::new();
        let (response, _) = store.remove_item("x").await;
        assert!(!response.ok);
        assert_eq!(response.errors, ["no manifest loaded"]);
    }
}
