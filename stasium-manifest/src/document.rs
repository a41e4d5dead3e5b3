//! Manifest document types, parsing, interpolation, and atomic persistence.
//!
//! `${root}` and `${project}` placeholders are expanded once, at load time,
//! against the document's own `root` and `project` fields. The `root` field
//! itself is never re-interpolated: a `root: /opt/${project}` stays literal,
//! and items referencing `${root}` receive that literal value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stasium_core::RestartPolicy;

use crate::error::{io_err, ManifestError};

/// Comment line prefixed to every persisted manifest.
pub const GENERATOR_HEADER: &str = "# Managed by stasiumd";

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// A `stasium.yaml` configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub version: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub items: BTreeMap<String, ManifestItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,

    /// Where this manifest was loaded from; not part of the document.
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// A named, ordered collection of item references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
}

/// A managed item definition. `kind` selects which of the optional fields are
/// required; [`crate::validate`] enforces the per-kind rules so that a bad
/// patch surfaces as validation messages, not a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ManifestItem {
    #[serde(default)]
    pub kind: String,
    /// os-unit: unit name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    /// supervised-process: command line, tokenized by whitespace at spawn.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// supervised-process: working directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// supervised-process: always | on-failure | never.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart: String,
    /// supervised-process: extra environment, wins over the daemon's.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// container: container name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    /// container: compose file path, paired with `service`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compose_file: String,
    /// container: compose service name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    /// log-source: files to tail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl ManifestItem {
    /// The restart policy, defaulting to on-failure when unset. Callers must
    /// have validated the document; an unparseable value falls back to the
    /// default here.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart.parse().unwrap_or_default()
    }
}

/// Reference to an external compose document for container auto-import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComposeRef {
    pub file: String,
}

/// A scoring rule: when every `match` key holds on an item, add `score`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rule {
    #[serde(rename = "match", default)]
    pub match_on: BTreeMap<String, String>,
    #[serde(default)]
    pub score: i64,
}

// ---------------------------------------------------------------------------
// Parse / load
// ---------------------------------------------------------------------------

/// Parse manifest YAML bytes and interpolate placeholders.
pub fn parse(bytes: &[u8]) -> Result<Manifest, ManifestError> {
    let mut manifest: Manifest = serde_yaml::from_slice(bytes)?;
    interpolate_manifest(&mut manifest);
    Ok(manifest)
}

/// Load a manifest from disk, remembering the source path.
pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
    if !path.exists() {
        return Err(ManifestError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    let mut manifest: Manifest = serde_yaml::from_slice(&bytes).map_err(|e| ManifestError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    interpolate_manifest(&mut manifest);
    manifest.file_path = path.to_path_buf();
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically persist the manifest: generator header plus serialized body,
/// written to a `.tmp` sibling and renamed into place.
pub fn save(manifest: &Manifest, path: &Path) -> Result<(), ManifestError> {
    let body = serde_yaml::to_string(manifest)?;
    let contents = format!("{GENERATOR_HEADER}\n{body}");

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

fn interpolate_manifest(manifest: &mut Manifest) {
    let root = manifest.root.clone();
    let project = manifest.project.clone();

    for item in manifest.items.values_mut() {
        interpolate_field(&mut item.unit, &root, &project);
        interpolate_field(&mut item.command, &root, &project);
        interpolate_field(&mut item.dir, &root, &project);
        interpolate_field(&mut item.container, &root, &project);
        interpolate_field(&mut item.compose_file, &root, &project);
        interpolate_field(&mut item.service, &root, &project);
        for value in item.env.values_mut() {
            interpolate_field(value, &root, &project);
        }
        for file in &mut item.files {
            interpolate_field(file, &root, &project);
        }
    }

    if let Some(compose) = &mut manifest.compose {
        interpolate_field(&mut compose.file, &root, &project);
    }
}

fn interpolate_field(field: &mut String, root: &str, project: &str) {
    if field.contains("${") {
        *field = interpolate(field, root, project);
    }
}

/// Expand `${root}` and `${project}` in a single pass. Substituted text is
/// never re-scanned, and unknown `${name}` placeholders stay literal.
fn interpolate(input: &str, root: &str, project: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                match &after[..end] {
                    "root" => out.push_str(root),
                    "project" => out.push_str(project),
                    name => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interpolates_item_fields() {
        let yaml = br#"
version: 1
project: my-app
root: /var/www/my-app
items:
  php-serve:
    kind: supervised-process
    command: "php artisan serve"
    dir: "${root}"
  app-log:
    kind: log-source
    files:
      - "${root}/storage/logs/laravel.log"
"#;
        let m = parse(yaml).expect("parse");
        assert_eq!(m.items["php-serve"].dir, "/var/www/my-app");
        assert_eq!(
            m.items["app-log"].files[0],
            "/var/www/my-app/storage/logs/laravel.log"
        );
    }

    #[test]
    fn root_itself_is_never_interpolated() {
        // root contains ${project}; items using ${root} get the literal value.
        let yaml = br#"
version: 1
project: testproj
root: /opt/${project}
items:
  serve:
    kind: supervised-process
    command: run
    dir: "${root}"
"#;
        let m = parse(yaml).expect("parse");
        assert_eq!(m.root, "/opt/${project}");
        assert_eq!(m.items["serve"].dir, "/opt/${project}");
    }

    #[test]
    fn compose_ref_is_interpolated() {
        let yaml = br#"
version: 1
project: app
root: /var/www/app
compose:
  file: "${root}/compose.yml"
items:
  db:
    kind: container
    container: mysql
"#;
        let m = parse(yaml).expect("parse");
        assert_eq!(m.compose.expect("compose").file, "/var/www/app/compose.yml");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        assert_eq!(
            interpolate("${root}/x/${unknown}/y", "/r", "p"),
            "/r/x/${unknown}/y"
        );
        assert_eq!(interpolate("no placeholders", "/r", "p"), "no placeholders");
        assert_eq!(interpolate("${unclosed", "/r", "p"), "${unclosed");
    }

    #[test]
    fn env_values_are_interpolated() {
        let yaml = br#"
version: 1
project: app
root: /srv/app
items:
  worker:
    kind: supervised-process
    command: run worker
    env:
      APP_HOME: "${root}"
      APP_NAME: "${project}"
"#;
        let m = parse(yaml).expect("parse");
        let env = &m.items["worker"].env;
        assert_eq!(env["APP_HOME"], "/srv/app");
        assert_eq!(env["APP_NAME"], "app");
    }

    #[test]
    fn serialize_then_parse_is_equivalent() {
        let yaml = br#"
version: 1
project: my-app
root: /var/www/my-app
groups:
  - name: web
    items: [nginx, php-serve]
items:
  nginx:
    kind: os-unit
    unit: nginx.service
  php-serve:
    kind: supervised-process
    command: "php artisan serve"
    dir: /var/www/my-app
    restart: on-failure
rules:
  - match: { kind: os-unit }
    score: 10
"#;
        let m = parse(yaml).expect("parse");
        let serialized = serde_yaml::to_string(&m).expect("serialize");
        let back = parse(serialized.as_bytes()).expect("reparse");
        assert_eq!(m, back);
    }

    #[test]
    fn restart_policy_accessor_defaults() {
        let mut item = ManifestItem {
            kind: "supervised-process".into(),
            command: "run".into(),
            ..Default::default()
        };
        assert_eq!(item.restart_policy(), RestartPolicy::OnFailure);
        item.restart = "always".into();
        assert_eq!(item.restart_policy(), RestartPolicy::Always);
    }
}
