//! Container engine provider, driven through the `docker` CLI.
//!
//! Availability is probed once at construction. When the engine is
//! unreachable the provider is inert: `list` yields nothing and actions fail
//! with *unavailable*.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use stasium_core::{parse_item_id, CoreError, Item, Kind, LogLine, LogProvider, Provider, Status};

const PROVIDER_SEGMENT: &str = "engine";
const STREAM_LABEL: &str = "container";

/// Deadline for engine probe and stats subcalls.
const STATS_DEADLINE: Duration = Duration::from_secs(2);
/// Seconds the engine gets to stop a container before it kills it.
const STOP_TIMEOUT_SECS: &str = "10";
const LOG_TAIL: &str = "50";
const LOG_CHANNEL_DEPTH: usize = 100;

/// The compose service label attached by the engine.
const SERVICE_LABEL: &str = "com.docker.compose.service";

/// A container to monitor, declared in the manifest or auto-imported from a
/// compose document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct ContainerTarget {
    name: String,
    container: String,
    service: String,
    compose_file: String,
}

struct LogForward {
    sender: broadcast::Sender<LogLine>,
    cancel: CancellationToken,
}

/// Lists, acts on, and streams logs for declared containers.
pub struct ContainerProvider {
    targets: Mutex<Vec<ContainerTarget>>,
    available: bool,
    forwards: Mutex<HashMap<String, LogForward>>,
}

impl ContainerProvider {
    /// Probe the engine; an unreachable engine yields a disabled provider.
    pub async fn detect() -> Self {
        let available = match run_engine(&["version", "--format", "{{.Server.Version}}"], STATS_DEADLINE).await
        {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "container engine not available, provider disabled");
                false
            }
        };
        if available {
            tracing::info!("container provider enabled");
        }
        Self {
            targets: Mutex::new(Vec::new()),
            available,
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// A provider that never talks to the engine.
    pub fn disabled() -> Self {
        Self {
            targets: Mutex::new(Vec::new()),
            available: false,
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// `(item name, container name)` pairs currently monitored.
    pub fn target_names(&self) -> Vec<(String, String)> {
        self.targets
            .lock()
            .iter()
            .map(|target| (target.name.clone(), target.container.clone()))
            .collect()
    }

    /// Register a container to monitor.
    pub fn add_container(&self, name: &str, container: &str, service: &str, compose_file: &str) {
        self.targets.lock().push(ContainerTarget {
            name: name.to_owned(),
            container: container.to_owned(),
            service: service.to_owned(),
            compose_file: compose_file.to_owned(),
        });
    }

    async fn find_container_id(&self, name: &str) -> Result<String, CoreError> {
        let target = self
            .targets
            .lock()
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| CoreError::not_found("container item", name))?;

        let summaries = self.list_engine_containers().await?;
        let index = ContainerIndex::new(&summaries);
        index
            .resolve(&target)
            .map(|summary| summary.id.clone())
            .ok_or_else(|| CoreError::not_found("container", name))
    }

    async fn list_engine_containers(&self) -> Result<Vec<PsEntry>, CoreError> {
        let stdout = run_engine(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"], STATS_DEADLINE).await?;
        let mut entries = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<PsEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::debug!(error = %err, "unparseable ps line"),
            }
        }
        Ok(entries)
    }

    async fn populate_stats(&self, container_id: &str, item: &mut Item) {
        let stdout = match run_engine(
            &["stats", "--no-stream", "--format", "{{json .}}", container_id],
            STATS_DEADLINE,
        )
        .await
        {
            Ok(stdout) => stdout,
            Err(_) => return,
        };
        let Ok(stats) = serde_json::from_str::<StatsEntry>(stdout.trim()) else {
            return;
        };
        if let Some(cpu) = parse_percent(&stats.cpu_perc) {
            item.cpu_pct = cpu;
        }
        if let Some(mem) = parse_mem_usage(&stats.mem_usage) {
            item.mem_bytes = mem;
        }
    }
}

#[async_trait]
impl Provider for ContainerProvider {
    fn name(&self) -> &'static str {
        Kind::Container.as_str()
    }

    async fn list(&self, _cancel: CancellationToken) -> Result<Vec<Item>, CoreError> {
        if !self.available {
            return Ok(Vec::new());
        }

        let summaries = self.list_engine_containers().await?;
        let index = ContainerIndex::new(&summaries);
        let targets = self.targets.lock().clone();

        let mut items = Vec::with_capacity(targets.len());
        for target in &targets {
            let mut item =
                Item::new(Kind::Container, PROVIDER_SEGMENT, &target.name, target.name.as_str());
            item.source.insert("container".to_owned(), target.container.clone());
            item.source.insert("service".to_owned(), target.service.clone());
            item.source.insert("compose".to_owned(), target.compose_file.clone());

            match index.resolve(target) {
                None => item.status = Status::Stopped,
                Some(summary) => {
                    item.status = map_container_state(&summary.state);
                    let short_id: String = summary.id.chars().take(12).collect();
                    item.source.insert("container_id".to_owned(), short_id);
                    item.source.insert("image".to_owned(), summary.image.clone());
                    if item.status == Status::Running {
                        self.populate_stats(&summary.id, &mut item).await;
                    }
                }
            }
            items.push(item);
        }
        Ok(items)
    }

    async fn action(
        &self,
        _cancel: CancellationToken,
        item_id: &str,
        action: &str,
    ) -> Result<(), CoreError> {
        if !self.available {
            return Err(CoreError::Unavailable("container"));
        }

        let (_, _, name) = parse_item_id(item_id)?;
        let container_id = self.find_container_id(name).await?;

        let args: Vec<&str> = match action {
            "start" => vec!["start", container_id.as_str()],
            "stop" => vec!["stop", "-t", STOP_TIMEOUT_SECS, container_id.as_str()],
            "restart" => vec!["restart", "-t", STOP_TIMEOUT_SECS, container_id.as_str()],
            other => return Err(CoreError::unsupported_action(other, "container")),
        };
        run_engine(&args, Duration::from_secs(30)).await.map(|_| ())
    }
}

#[async_trait]
impl LogProvider for ContainerProvider {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        item_id: &str,
    ) -> Result<broadcast::Receiver<LogLine>, CoreError> {
        if !self.available {
            return Err(CoreError::Unavailable("container"));
        }

        {
            let forwards = self.forwards.lock();
            if let Some(forward) = forwards.get(item_id) {
                return Ok(forward.sender.subscribe());
            }
        }

        let (_, _, name) = parse_item_id(item_id)?;
        let container_id = self.find_container_id(name).await?;

        let mut child = tokio::process::Command::new("docker")
            .args(["logs", "-f", "--tail", LOG_TAIL, &container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CoreError::Io)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Unavailable("container"))?;

        let (sender, receiver) = broadcast::channel(LOG_CHANNEL_DEPTH);
        let forward_cancel = cancel.child_token();

        let task_sender = sender.clone();
        let task_cancel = forward_cancel.clone();
        let task_item_id = item_id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let entry = LogLine {
                                item_id: task_item_id.clone(),
                                ts_unix_ms: chrono::Utc::now().timestamp_millis(),
                                stream: STREAM_LABEL.to_owned(),
                                line: strip_multiplex_header(&line).to_owned(),
                            };
                            let _ = task_sender.send(entry);
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
            let _ = child.kill().await;
        });

        self.forwards.lock().insert(
            item_id.to_owned(),
            LogForward {
                sender,
                cancel: forward_cancel,
            },
        );
        Ok(receiver)
    }

    fn unsubscribe(&self, item_id: &str) {
        if let Some(forward) = self.forwards.lock().remove(item_id) {
            forward.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Engine plumbing
// ---------------------------------------------------------------------------

/// One line of `ps --format {{json .}}` output.
#[derive(Debug, Clone, Deserialize, Default)]
struct PsEntry {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct StatsEntry {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
}

/// Containers indexed by name and by compose service label.
struct ContainerIndex<'a> {
    by_name: HashMap<&'a str, &'a PsEntry>,
    by_service: HashMap<&'a str, &'a PsEntry>,
}

impl<'a> ContainerIndex<'a> {
    fn new(entries: &'a [PsEntry]) -> Self {
        let mut by_name = HashMap::new();
        let mut by_service = HashMap::new();
        for entry in entries {
            for name in entry.names.split(',') {
                let name = name.trim().trim_start_matches('/');
                if !name.is_empty() {
                    by_name.insert(name, entry);
                }
            }
            for label in entry.labels.split(',') {
                if let Some((key, value)) = label.split_once('=') {
                    if key == SERVICE_LABEL {
                        by_service.insert(value, entry);
                    }
                }
            }
        }
        Self { by_name, by_service }
    }

    fn resolve(&self, target: &ContainerTarget) -> Option<&'a PsEntry> {
        if !target.container.is_empty() {
            if let Some(entry) = self.by_name.get(target.container.as_str()).copied() {
                return Some(entry);
            }
        }
        if !target.service.is_empty() {
            if let Some(entry) = self.by_service.get(target.service.as_str()).copied() {
                return Some(entry);
            }
        }
        self.by_name.get(target.name.as_str()).copied()
    }
}

async fn run_engine(args: &[&str], deadline: Duration) -> Result<String, CoreError> {
    let output = tokio::time::timeout(
        deadline,
        tokio::process::Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| CoreError::Unavailable("container"))?
    .map_err(CoreError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::InvalidRequest(format!(
            "docker {}: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn map_container_state(state: &str) -> Status {
    match state {
        "running" => Status::Running,
        "exited" | "dead" | "created" | "paused" => Status::Stopped,
        "restarting" => Status::Restarting,
        _ => Status::Unknown,
    }
}

/// Engine log frames may carry an 8-byte multiplex header (stream byte 1 or
/// 2, three zero bytes, four length bytes); strip it when present.
fn strip_multiplex_header(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 8 && (bytes[0] == 1 || bytes[0] == 2) && bytes[1..4] == [0, 0, 0] {
        if let Ok(rest) = std::str::from_utf8(&bytes[8..]) {
            return rest;
        }
    }
    line
}

fn parse_percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').parse().ok()
}

/// Parse the used side of `MemUsage` (e.g. `"10.5MiB / 7.775GiB"`) to bytes.
fn parse_mem_usage(value: &str) -> Option<u64> {
    let used = value.split('/').next()?.trim();
    let suffixes: [(&str, f64); 9] = [
        ("TiB", 1024f64.powi(4)),
        ("GiB", 1024f64.powi(3)),
        ("MiB", 1024f64.powi(2)),
        ("KiB", 1024.0),
        ("TB", 1e12),
        ("GB", 1e9),
        ("MB", 1e6),
        ("kB", 1e3),
        ("B", 1.0),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = used.strip_suffix(suffix) {
            let parsed: f64 = number.trim().parse().ok()?;
            return Some((parsed * factor) as u64);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, names: &str, state: &str, labels: &str) -> PsEntry {
        PsEntry {
            id: id.to_owned(),
            names: names.to_owned(),
            state: state.to_owned(),
            image: "img:latest".to_owned(),
            labels: labels.to_owned(),
        }
    }

    #[test]
    fn index_resolves_by_container_name_first() {
        let entries = vec![
            entry("aaa", "mailpit", "running", ""),
            entry("bbb", "myapp-redis-1", "running", "com.docker.compose.service=redis"),
        ];
        let index = ContainerIndex::new(&entries);

        let by_container = ContainerTarget {
            name: "mail".into(),
            container: "mailpit".into(),
            ..Default::default()
        };
        assert_eq!(index.resolve(&by_container).map(|e| e.id.as_str()), Some("aaa"));

        let by_service = ContainerTarget {
            name: "redis".into(),
            service: "redis".into(),
            ..Default::default()
        };
        assert_eq!(index.resolve(&by_service).map(|e| e.id.as_str()), Some("bbb"));
    }

    #[test]
    fn index_falls_back_to_item_name() {
        let entries = vec![entry("ccc", "/mailpit", "running", "")];
        let index = ContainerIndex::new(&entries);
        let target = ContainerTarget {
            name: "mailpit".into(),
            ..Default::default()
        };
        assert_eq!(index.resolve(&target).map(|e| e.id.as_str()), Some("ccc"));
    }

    #[test]
    fn container_states_map_to_statuses() {
        assert_eq!(map_container_state("running"), Status::Running);
        assert_eq!(map_container_state("exited"), Status::Stopped);
        assert_eq!(map_container_state("dead"), Status::Stopped);
        assert_eq!(map_container_state("created"), Status::Stopped);
        assert_eq!(map_container_state("paused"), Status::Stopped);
        assert_eq!(map_container_state("restarting"), Status::Restarting);
        assert_eq!(map_container_state("weird"), Status::Unknown);
    }

    #[test]
    fn multiplex_header_is_stripped() {
        let mut framed = vec![1u8, 0, 0, 0, 0, 0, 0, 5];
        framed.extend_from_slice(b"hello");
        let line = String::from_utf8(framed).expect("utf8");
        assert_eq!(strip_multiplex_header(&line), "hello");
        assert_eq!(strip_multiplex_header("plain line"), "plain line");
    }

    #[test]
    fn stats_parsing() {
        assert_eq!(parse_percent("1.52%"), Some(1.52));
        assert_eq!(parse_percent("0.00%"), Some(0.0));
        assert_eq!(parse_percent("n/a"), None);

        assert_eq!(parse_mem_usage("512B / 1GiB"), Some(512));
        assert_eq!(parse_mem_usage("10MiB / 7.775GiB"), Some(10 * 1024 * 1024));
        assert_eq!(
            parse_mem_usage("1.5GiB / 16GiB"),
            Some((1.5 * 1024.0 * 1024.0 * 1024.0) as u64)
        );
        assert_eq!(parse_mem_usage("2kB / 1GB"), Some(2000));
        assert_eq!(parse_mem_usage("garbage"), None);
    }
}
