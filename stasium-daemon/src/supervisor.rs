//! Child-process supervision: spawn, wait, restart with backoff, stop with
//! SIGTERM→SIGKILL escalation, and per-stream log capture.
//!
//! Each child runs in its own process group so signals reach descendants.
//! The wait task owns the [`tokio::process::Child`]; everything else observes
//! exits through a per-process watch channel.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use stasium_core::{item_id, CoreError, Kind, LogLine, RestartPolicy, Status};

use crate::log_ring::{LogRing, SUBSCRIBER_BUFFER};

/// Provider segment used in supervised-process item IDs.
pub const PROVIDER_SEGMENT: &str = "supervisor";

/// Settling delay between stop and start on a user-initiated restart.
const RESTART_SETTLE: Duration = Duration::from_millis(100);

/// How long a stopping process gets to honour SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Configuration for one supervised process. Replaced wholesale on
/// re-register; a running process picks the new configuration up on its next
/// respawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub command: String,
    pub dir: String,
    pub env: BTreeMap<String, String>,
    pub restart: RestartPolicy,
}

/// Snapshot of a process's runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub status: Status,
    /// 0 when not running.
    pub pid: i32,
    pub started_at: Option<Instant>,
}

struct ProcState {
    status: Status,
    pid: i32,
    started_at: Option<Instant>,
    failures: u32,
    /// Set by stop/unregister for the current lifecycle; cleared on spawn.
    /// While set, the wait handler must not resurrect the process.
    stop_requested: bool,
    /// Present while a backoff respawn is pending; cancelling it aborts the
    /// respawn. The respawn task clears it before re-entering spawn.
    backoff_cancel: Option<CancellationToken>,
}

impl Default for ProcState {
    fn default() -> Self {
        Self {
            status: Status::Stopped,
            pid: 0,
            started_at: None,
            failures: 0,
            stop_requested: false,
            backoff_cancel: None,
        }
    }
}

/// One supervised child process: configuration, state, and log rings.
pub struct SupervisedProcess {
    name: String,
    config: Mutex<ProcessConfig>,
    state: Mutex<ProcState>,
    stdout: Arc<LogRing>,
    stderr: Arc<LogRing>,
    /// Bumped once per reaped exit; stop waits on this.
    exit_seq: watch::Sender<u64>,
}

impl SupervisedProcess {
    fn new(name: String, config: ProcessConfig) -> Self {
        let (exit_seq, _) = watch::channel(0);
        Self {
            name,
            config: Mutex::new(config),
            state: Mutex::new(ProcState::default()),
            stdout: Arc::new(LogRing::new()),
            stderr: Arc::new(LogRing::new()),
            exit_seq,
        }
    }

    fn item_id(&self) -> String {
        item_id(Kind::SupervisedProcess, PROVIDER_SEGMENT, &self.name)
    }
}

/// Manages the lifecycle of supervised child processes.
pub struct Supervisor {
    processes: RwLock<HashMap<String, Arc<SupervisedProcess>>>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// `cancel` is the daemon's token; when it fires, exits no longer respawn.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Add a process to be supervised without starting it. Idempotent by
    /// name: an existing entry keeps its state and log rings and only the
    /// configuration is replaced, effective on the next respawn if the
    /// process is currently running.
    pub fn register(
        &self,
        name: &str,
        command: &str,
        dir: &str,
        env: BTreeMap<String, String>,
        restart: RestartPolicy,
    ) {
        let config = ProcessConfig {
            command: command.to_owned(),
            dir: dir.to_owned(),
            env,
            restart,
        };

        let mut processes = self.processes.write();
        match processes.entry(name.to_owned()) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                *entry.get().config.lock() = config;
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Arc::new(SupervisedProcess::new(name.to_owned(), config)));
            }
        }
    }

    /// Stop and remove a process.
    pub async fn unregister(&self, name: &str) {
        let process = self.processes.write().remove(name);
        if let Some(process) = process {
            stop_process(&process).await;
        }
    }

    /// Start a registered process.
    pub async fn start(&self, name: &str) -> Result<(), CoreError> {
        let process = self.get(name)?;
        spawn_process(process, self.cancel.clone()).await
    }

    /// Stop a running process via SIGTERM, escalating to SIGKILL after the
    /// grace period.
    pub async fn stop(&self, name: &str) -> Result<(), CoreError> {
        let process = self.get(name)?;
        stop_process(&process).await;
        Ok(())
    }

    /// Stop then start, with a brief settling delay. Does not reset the
    /// failure counter, so rapid manual thrash stays visible in the backoff.
    pub async fn restart(&self, name: &str) -> Result<(), CoreError> {
        if let Err(err) = self.stop(name).await {
            tracing::warn!(name, error = %err, "stop before restart");
        }
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start(name).await
    }

    /// Start every registered process; individual failures are logged.
    pub async fn start_all(&self) {
        for name in self.names() {
            if let Err(err) = self.start(&name).await {
                tracing::error!(name = %name, error = %err, "start process");
            }
        }
    }

    /// Stop every process. Also cancels respawns for the daemon's lifetime.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        let processes: Vec<Arc<SupervisedProcess>> =
            self.processes.read().values().cloned().collect();
        for process in processes {
            stop_process(&process).await;
        }
    }

    /// Registered names, sorted for stable listing order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Current status snapshot, or None for an unknown name.
    pub fn status(&self, name: &str) -> Option<ProcessStatus> {
        let process = self.processes.read().get(name).cloned()?;
        let state = process.state.lock();
        Some(ProcessStatus {
            status: state.status,
            pid: state.pid,
            started_at: state.started_at,
        })
    }

    /// Failure count for a process (drives backoff; never auto-reset).
    pub fn failures(&self, name: &str) -> Option<u32> {
        let process = self.processes.read().get(name).cloned()?;
        let failures = process.state.lock().failures;
        Some(failures)
    }

    /// A merged channel of future stdout+stderr lines. Each call attaches a
    /// fresh subscriber to both per-stream rings.
    pub fn log_channel(&self, name: &str) -> Result<mpsc::Receiver<LogLine>, CoreError> {
        let process = self.get(name)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        process.stdout.attach(tx.clone());
        process.stderr.attach(tx);
        Ok(rx)
    }

    /// The most recent `n` stdout+stderr ring lines, interleaved by stream.
    pub fn tail(&self, name: &str, n: usize) -> Result<Vec<LogLine>, CoreError> {
        let process = self.get(name)?;
        let mut lines = process.stdout.tail(n);
        lines.extend(process.stderr.tail(n));
        lines.sort_by_key(|l| l.ts_unix_ms);
        let skip = lines.len().saturating_sub(n);
        Ok(lines.split_off(skip))
    }

    fn get(&self, name: &str) -> Result<Arc<SupervisedProcess>, CoreError> {
        self.processes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found("process", name))
    }
}

// ---------------------------------------------------------------------------
// Spawn / wait / stop
// ---------------------------------------------------------------------------

async fn spawn_process(
    process: Arc<SupervisedProcess>,
    cancel: CancellationToken,
) -> Result<(), CoreError> {
    {
        let state = process.state.lock();
        if state.status == Status::Running || state.status == Status::Starting {
            return Ok(());
        }
        // A pending backoff respawn owns a Restarting process; the respawn
        // task clears `backoff_cancel` before re-entering here. Spawning
        // around it would put two children under one name.
        if state.status == Status::Restarting && state.backoff_cancel.is_some() {
            return Ok(());
        }
    }

    let config = process.config.lock().clone();
    let argv: Vec<String> = config.command.split_whitespace().map(str::to_owned).collect();
    let Some(program) = argv.first() else {
        return Err(CoreError::InvalidConfiguration(format!(
            "process {:?}: empty command",
            process.name
        )));
    };

    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    if !config.dir.is_empty() {
        cmd.current_dir(&config.dir);
    }
    // Parent environment is inherited; item entries win on collision.
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Own process group so stop signals reach descendants.
    cmd.process_group(0);

    {
        let mut state = process.state.lock();
        state.status = Status::Starting;
        state.stop_requested = false;
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            // Spawn failures surface as the process entering `failed`, with
            // the error recorded as a stderr line — not as an operation error.
            process.state.lock().status = Status::Failed;
            process.stderr.write(
                &process.item_id(),
                "stderr",
                format!("spawn {:?}: {err}", config.command),
            );
            tracing::error!(name = %process.name, error = %err, "spawn failed");
            return Ok(());
        }
    };

    let pid = child.id().map(|id| id as i32).unwrap_or_default();
    {
        let mut state = process.state.lock();
        state.status = Status::Running;
        state.pid = pid;
        state.started_at = Some(Instant::now());
    }
    tracing::info!(name = %process.name, pid, command = %config.command, "process started");

    let id = process.item_id();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, Arc::clone(&process.stdout), id.clone(), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, Arc::clone(&process.stderr), id.clone(), "stderr"));
    }

    tokio::spawn(wait_and_restart(process, child, cancel));
    Ok(())
}

/// Read one pipe to exhaustion, appending each line to its ring. A read error
/// ends only this stream; the process keeps running.
async fn pump_lines(
    reader: impl AsyncRead + Unpin,
    ring: Arc<LogRing>,
    item_id: String,
    stream: &'static str,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => ring.write(&item_id, stream, line),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(item_id = %item_id, stream, error = %err, "pipe read error");
                break;
            }
        }
    }
}

async fn wait_and_restart(
    process: Arc<SupervisedProcess>,
    mut child: Child,
    cancel: CancellationToken,
) {
    let wait_result = child.wait().await;
    let exit_code = wait_result
        .as_ref()
        .ok()
        .and_then(|status| status.code())
        .unwrap_or(-1);

    let restart = process.config.lock().restart;
    let (should_restart, failures) = {
        let mut state = process.state.lock();
        state.pid = 0;
        if cancel.is_cancelled() {
            state.status = Status::Stopped;
            drop(state);
            process.exit_seq.send_modify(|n| *n += 1);
            return;
        }
        state.status = if exit_code == 0 {
            Status::Stopped
        } else {
            Status::Failed
        };
        // Every exit counts, clean or not; backoff grows accordingly.
        state.failures += 1;
        let should_restart = !state.stop_requested
            && match restart {
                RestartPolicy::Always => true,
                RestartPolicy::OnFailure => exit_code != 0,
                RestartPolicy::Never => false,
            };
        (should_restart, state.failures)
    };
    process.exit_seq.send_modify(|n| *n += 1);
    tracing::info!(name = %process.name, exit_code, "process exited");

    if !should_restart {
        return;
    }

    let delay = backoff(failures);
    let backoff_cancel = CancellationToken::new();
    {
        let mut state = process.state.lock();
        // A stop that landed since the exit bookkeeping wins outright.
        if state.stop_requested {
            state.status = Status::Stopped;
            return;
        }
        state.status = Status::Restarting;
        state.backoff_cancel = Some(backoff_cancel.clone());
    }
    tracing::info!(
        name = %process.name,
        delay_ms = delay.as_millis() as u64,
        attempt = failures,
        "restarting process"
    );

    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => return,
        _ = backoff_cancel.cancelled() => {
            // A stop or unregister aborted this respawn. Only settle the
            // status if nothing else has taken the lifecycle over since.
            let mut state = process.state.lock();
            if state.status == Status::Restarting {
                state.status = Status::Stopped;
            }
            return;
        }
    }

    // Hand the lifecycle back before re-entering spawn; a stop issued during
    // the backoff still wins.
    {
        let mut state = process.state.lock();
        state.backoff_cancel = None;
        if state.stop_requested {
            state.status = Status::Stopped;
            return;
        }
    }
    if let Err(err) = spawn_process(Arc::clone(&process), cancel).await {
        tracing::error!(name = %process.name, error = %err, "restart failed");
    }
}

async fn stop_process(process: &Arc<SupervisedProcess>) {
    // Subscribe before signalling so an immediate exit cannot be missed.
    let mut exited = process.exit_seq.subscribe();

    let pid = {
        let mut state = process.state.lock();
        // Mark the lifecycle stopped before anything else: a process waiting
        // out its backoff has no pid to signal, but the pending respawn must
        // still be cancelled and must never resurrect it.
        state.stop_requested = true;
        if let Some(backoff) = state.backoff_cancel.take() {
            backoff.cancel();
        }
        if state.status == Status::Restarting {
            state.status = Status::Stopped;
        }
        if state.status != Status::Running || state.pid == 0 {
            return;
        }
        state.pid
    };

    signal_group(pid, libc::SIGTERM);

    if tokio::time::timeout(STOP_GRACE, exited.changed()).await.is_err() {
        tracing::warn!(name = %process.name, pid, "stop grace expired, sending SIGKILL");
        signal_group(pid, libc::SIGKILL);
        let _ = exited.changed().await;
    }

    let mut state = process.state.lock();
    state.status = Status::Stopped;
    state.pid = 0;
}

fn signal_group(pid: i32, signal: i32) {
    // Negative pid addresses the whole process group.
    unsafe {
        libc::kill(-pid, signal);
    }
}

/// Exponential restart backoff: 1 s doubling per failure, capped at 30 s.
pub fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(5);
    Duration::from_secs((1u64 << exponent).min(30))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table() {
        let cases = [
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (5, 16),
            (6, 30),
            (7, 30),
            (10, 30),
        ];
        for (failures, want_secs) in cases {
            assert_eq!(
                backoff(failures),
                Duration::from_secs(want_secs),
                "backoff({failures})"
            );
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let mut previous = Duration::ZERO;
        for failures in 1..=20 {
            let delay = backoff(failures);
            assert!(delay >= previous, "backoff must not decrease");
            previous = delay;
        }
        for failures in 6..=64 {
            assert_eq!(backoff(failures), Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_and_replaces_config() {
        let supervisor = Supervisor::new(CancellationToken::new());
        supervisor.register("svc", "echo one", "", BTreeMap::new(), RestartPolicy::Never);
        supervisor.register("svc", "echo two", "/tmp", BTreeMap::new(), RestartPolicy::Always);

        assert_eq!(supervisor.names(), ["svc"]);
        let process = supervisor.get("svc").expect("registered");
        let config = process.config.lock().clone();
        assert_eq!(config.command, "echo two");
        assert_eq!(config.dir, "/tmp");
        assert_eq!(config.restart, RestartPolicy::Always);
    }

    #[tokio::test]
    async fn start_unknown_name_is_not_found() {
        let supervisor = Supervisor::new(CancellationToken::new());
        let err = supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn empty_command_is_invalid_configuration() {
        let supervisor = Supervisor::new(CancellationToken::new());
        supervisor.register("blank", "   ", "", BTreeMap::new(), RestartPolicy::Never);
        let err = supervisor.start("blank").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration(_)), "got: {err}");
    }

    #[tokio::test]
    async fn spawn_failure_enters_failed_with_stderr_line() {
        let supervisor = Supervisor::new(CancellationToken::new());
        supervisor.register(
            "missing",
            "/nonexistent/binary-for-sure",
            "",
            BTreeMap::new(),
            RestartPolicy::Never,
        );

        supervisor.start("missing").await.expect("not an operation error");

        let status = supervisor.status("missing").expect("known");
        assert_eq!(status.status, Status::Failed);
        let tail = supervisor.tail("missing", 10).expect("tail");
        assert!(
            tail.iter().any(|l| l.stream == "stderr" && l.line.contains("spawn")),
            "expected a spawn error line, got: {tail:?}"
        );
    }
}
