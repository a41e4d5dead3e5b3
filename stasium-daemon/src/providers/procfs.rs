//! Generic-process discovery from `/proc`.
//!
//! Only development-relevant processes are surfaced; everything else on the
//! machine stays out of the item table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stasium_core::{parse_item_id, CoreError, Item, Kind, Provider, Status};

const PROVIDER_SEGMENT: &str = "procfs";

const INTERESTING: [&str; 21] = [
    "nginx",
    "php-fpm",
    "php",
    "node",
    "npm",
    "redis",
    "mysql",
    "mariadbd",
    "postgres",
    "docker",
    "artisan",
    "queue:work",
    "schedule:",
    "python",
    "gunicorn",
    "uvicorn",
    "java",
    "reverb",
    "caddy",
    "bun",
    "deno",
];

/// Scans `/proc` for interesting processes.
pub struct ProcfsProvider {
    proc_root: PathBuf,
}

impl ProcfsProvider {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    #[cfg(test)]
    fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ProcfsProvider {
    fn name(&self) -> &'static str {
        Kind::GenericProcess.as_str()
    }

    async fn list(&self, _cancel: CancellationToken) -> Result<Vec<Item>, CoreError> {
        let proc_root = self.proc_root.clone();
        tokio::task::spawn_blocking(move || scan(&proc_root))
            .await
            .map_err(|err| {
                CoreError::Io(std::io::Error::other(format!("procfs scan join: {err}")))
            })?
    }

    async fn action(
        &self,
        _cancel: CancellationToken,
        item_id: &str,
        action: &str,
    ) -> Result<(), CoreError> {
        let (_, _, native_id) = parse_item_id(item_id)?;
        let pid: i32 = native_id
            .parse()
            .map_err(|_| CoreError::InvalidRequest(format!("invalid PID: {native_id}")))?;

        let signal = match action {
            "term" => libc::SIGTERM,
            "kill" => libc::SIGKILL,
            other => return Err(CoreError::unsupported_action(other, "process")),
        };

        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            return Err(CoreError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn scan(proc_root: &Path) -> Result<Vec<Item>, CoreError> {
    let entries = std::fs::read_dir(proc_root)?;
    let mut items = Vec::new();

    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        let cmdline = cmdline.trim();
        if cmdline.is_empty() || !is_interesting(cmdline) {
            continue;
        }

        let name = cmdline.split_whitespace().next().unwrap_or(cmdline);
        let mut item = Item::new(Kind::GenericProcess, PROVIDER_SEGMENT, &pid.to_string(), name);
        item.status = Status::Running;
        item.pids = vec![pid];
        item.source.insert("cmdline".to_owned(), cmdline.to_owned());
        items.push(item);
    }

    items.sort_by(|a, b| a.pids.cmp(&b.pids));
    Ok(items)
}

/// Heuristic filter for processes worth showing.
fn is_interesting(cmdline: &str) -> bool {
    let lower = cmdline.to_lowercase();
    INTERESTING.iter().any(|keyword| lower.contains(keyword))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
