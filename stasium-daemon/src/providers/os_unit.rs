//! OS service-unit provider, driven through `systemctl`, with journal log
//! streaming via `journalctl -f`.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use stasium_core::{parse_item_id, CoreError, Item, Kind, LogLine, LogProvider, Provider, Status};

const PROVIDER_SEGMENT: &str = "system";
const STREAM_LABEL: &str = "journal";
const SHOW_DEADLINE: Duration = Duration::from_secs(2);
const ACTION_DEADLINE: Duration = Duration::from_secs(10);
const LOG_TAIL: &str = "50";
const LOG_CHANNEL_DEPTH: usize = 100;

const SHOW_PROPERTIES: &str = "ActiveState,SubState,LoadState,MainPID,MemoryCurrent";

struct LogForward {
    sender: broadcast::Sender<LogLine>,
    cancel: CancellationToken,
}

/// Monitors the OS units named in the manifest.
pub struct OsUnitProvider {
    units: Vec<String>,
    forwards: Mutex<HashMap<String, LogForward>>,
}

impl OsUnitProvider {
    pub fn new(units: Vec<String>) -> Self {
        Self {
            units,
            forwards: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Provider for OsUnitProvider {
    fn name(&self) -> &'static str {
        Kind::OsUnit.as_str()
    }

    async fn list(&self, _cancel: CancellationToken) -> Result<Vec<Item>, CoreError> {
        let mut items = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let stdout = run_systemctl(
                &["show", unit.as_str(), "--property", SHOW_PROPERTIES],
                SHOW_DEADLINE,
            )
            .await?;
            let props = parse_properties(&stdout);

            let mut item = Item::new(Kind::OsUnit, PROVIDER_SEGMENT, unit, trim_unit_suffix(unit));
            let active = props.get("ActiveState").map(String::as_str).unwrap_or("");
            let sub = props.get("SubState").map(String::as_str).unwrap_or("");
            item.status = map_unit_status(active, sub);
            item.source.insert("unit".to_owned(), unit.clone());
            item.source.insert("activeState".to_owned(), active.to_owned());
            item.source.insert("subState".to_owned(), sub.to_owned());
            if let Some(load) = props.get("LoadState") {
                item.source.insert("loadState".to_owned(), load.clone());
            }

            if active == "active" {
                if let Some(pid) = props.get("MainPID").and_then(|v| v.parse::<i32>().ok()) {
                    if pid > 0 {
                        item.pids = vec![pid];
                    }
                }
                if let Some(mem) = props.get("MemoryCurrent").and_then(|v| v.parse::<u64>().ok()) {
                    item.mem_bytes = mem;
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
        let (_, _, unit) = parse_item_id(item_id)?;
        let verb = match action {
            "start" => "start",
            "stop" => "stop",
            "restart" => "restart",
            other => return Err(CoreError::unsupported_action(other, "os unit")),
        };
        run_systemctl(&[verb, unit], ACTION_DEADLINE).await.map(|_| ())
    }
}

#[async_trait]
impl LogProvider for OsUnitProvider {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        item_id: &str,
    ) -> Result<broadcast::Receiver<LogLine>, CoreError> {
        {
            let forwards = self.forwards.lock();
            if let Some(forward) = forwards.get(item_id) {
                return Ok(forward.sender.subscribe());
            }
        }

        let (_, _, unit) = parse_item_id(item_id)?;

        let mut child = tokio::process::Command::new("journalctl")
            .args(["-f", "-u", unit, "-o", "cat", "-n", LOG_TAIL])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(CoreError::Io)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Unavailable("journal"))?;

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
                                line,
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
        tracing::info!(unit, "subscribed to journal");
        Ok(receiver)
    }

    fn unsubscribe(&self, item_id: &str) {
        if let Some(forward) = self.forwards.lock().remove(item_id) {
            forward.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// systemctl plumbing
// ---------------------------------------------------------------------------

async fn run_systemctl(args: &[&str], deadline: Duration) -> Result<String, CoreError> {
    let output = tokio::time::timeout(
        deadline,
        tokio::process::Command::new("systemctl")
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| CoreError::Unavailable("os-unit"))?
    .map_err(CoreError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::InvalidRequest(format!(
            "systemctl {}: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `Key=Value` lines from `systemctl show`.
fn parse_properties(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

fn map_unit_status(active: &str, sub: &str) -> Status {
    match (active, sub) {
        ("active", _) => Status::Running,
        ("inactive", _) | ("deactivating", _) => Status::Stopped,
        ("failed", _) => Status::Failed,
        ("activating", "auto-restart") => Status::Restarting,
        _ => Status::Unknown,
    }
}

fn trim_unit_suffix(unit: &str) -> &str {
    unit.strip_suffix(".service").unwrap_or(unit)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
