//! Supervisor lifecycle tests against real child processes.
//!
//! Commands are tokenized by whitespace (no shell), so each test writes a
//! small executable script and supervises that.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stasium_core::{RestartPolicy, Status};
use stasium_daemon::supervisor::ProcessStatus;
use stasium_daemon::Supervisor;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }
    path
}

async fn wait_for(
    supervisor: &Supervisor,
    name: &str,
    deadline: Duration,
    predicate: impl Fn(ProcessStatus) -> bool,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if let Some(status) = supervisor.status(name) {
            if predicate(status) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn running_process_reports_pid_and_stops_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "sleeper.sh", "sleep 30");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "sleeper",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::Never,
    );

    supervisor.start("sleeper").await.expect("start");
    assert!(
        wait_for(&supervisor, "sleeper", Duration::from_secs(5), |s| {
            s.status == Status::Running && s.pid > 0
        })
        .await,
        "process never reached running"
    );

    supervisor.stop("sleeper").await.expect("stop");
    let status = supervisor.status("sleeper").expect("status");
    assert_eq!(status.status, Status::Stopped);
    assert_eq!(status.pid, 0);
}

#[tokio::test]
async fn clean_exit_with_on_failure_policy_does_not_respawn() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "ok.sh", "exit 0");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "ok",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::OnFailure,
    );

    supervisor.start("ok").await.expect("start");
    assert!(
        wait_for(&supervisor, "ok", Duration::from_secs(5), |s| {
            s.status == Status::Stopped
        })
        .await,
        "process never reached stopped"
    );
    assert_eq!(supervisor.failures("ok"), Some(1), "clean exits still count");

    // The first-respawn backoff would be 1 s; outwait it.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let status = supervisor.status("ok").expect("status");
    assert_eq!(status.status, Status::Stopped, "no respawn on clean exit");
    assert_eq!(supervisor.failures("ok"), Some(1));
}

#[tokio::test]
async fn failing_exit_with_on_failure_policy_respawns() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "fail.sh", "exit 1");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "fail",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::OnFailure,
    );

    supervisor.start("fail").await.expect("start");

    // First exit fails, backoff 1 s, respawn, second exit increments again.
    let start = std::time::Instant::now();
    while supervisor.failures("fail") < Some(2) && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(
        supervisor.failures("fail") >= Some(2),
        "expected a respawn after non-zero exit, failures: {:?}",
        supervisor.failures("fail")
    );
}

#[tokio::test]
async fn always_policy_respawns_after_clean_exit() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "always.sh", "exit 0");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "always",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::Always,
    );

    supervisor.start("always").await.expect("start");

    let start = std::time::Instant::now();
    while supervisor.failures("always") < Some(2) && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(
        supervisor.failures("always") >= Some(2),
        "always policy must respawn after clean exit"
    );
}

#[tokio::test]
async fn manual_stop_wins_over_always_policy() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "sleeper.sh", "sleep 30");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "sleeper",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::Always,
    );

    supervisor.start("sleeper").await.expect("start");
    assert!(
        wait_for(&supervisor, "sleeper", Duration::from_secs(5), |s| {
            s.status == Status::Running
        })
        .await
    );

    supervisor.stop("sleeper").await.expect("stop");
    assert_eq!(supervisor.status("sleeper").map(|s| s.status), Some(Status::Stopped));

    // Outwait the would-be backoff; the stop must stick.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(
        supervisor.status("sleeper").map(|s| s.status),
        Some(Status::Stopped),
        "stopped process must not be resurrected"
    );
}

#[tokio::test]
async fn captured_output_lands_in_rings_and_channel() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        "chatty.sh",
        "echo hello-out\necho hello-err 1>&2\nexit 0",
    );
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "chatty",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::Never,
    );

    // Subscribe before starting so the merged channel sees both lines.
    let mut merged = supervisor.log_channel("chatty").expect("log channel");

    supervisor.start("chatty").await.expect("start");
    assert!(
        wait_for(&supervisor, "chatty", Duration::from_secs(5), |s| {
            s.status == Status::Stopped
        })
        .await
    );

    let mut streams = Vec::new();
    for _ in 0..2 {
        let line = tokio::time::timeout(Duration::from_secs(5), merged.recv())
            .await
            .expect("line in time")
            .expect("channel open");
        assert_eq!(line.item_id, "supervised-process:supervisor:chatty");
        streams.push((line.stream, line.line));
    }
    streams.sort();
    assert_eq!(
        streams,
        [
            ("stderr".to_owned(), "hello-err".to_owned()),
            ("stdout".to_owned(), "hello-out".to_owned()),
        ]
    );

    let tail = supervisor.tail("chatty", 10).expect("tail");
    assert!(tail.iter().any(|l| l.line == "hello-out"));
    assert!(tail.iter().any(|l| l.line == "hello-err"));
}

#[tokio::test]
async fn child_environment_merges_with_item_overrides() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "env.sh", "echo value=$STASIUM_TEST_VALUE");
    let supervisor = Supervisor::new(CancellationToken::new());
    let env: BTreeMap<String, String> =
        [("STASIUM_TEST_VALUE".to_owned(), "from-item".to_owned())].into();
    supervisor.register(
        "env",
        &script.display().to_string(),
        "",
        env,
        RestartPolicy::Never,
    );

    supervisor.start("env").await.expect("start");
    assert!(
        wait_for(&supervisor, "env", Duration::from_secs(5), |s| {
            s.status == Status::Stopped
        })
        .await
    );

    let tail = supervisor.tail("env", 10).expect("tail");
    assert!(
        tail.iter().any(|l| l.line == "value=from-item"),
        "item env must reach the child, got: {tail:?}"
    );
}

#[tokio::test]
async fn unregister_stops_and_removes() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "sleeper.sh", "sleep 30");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "gone",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::Always,
    );
    supervisor.start("gone").await.expect("start");
    assert!(
        wait_for(&supervisor, "gone", Duration::from_secs(5), |s| {
            s.status == Status::Running
        })
        .await
    );

    supervisor.unregister("gone").await;
    assert!(supervisor.names().is_empty());
    assert!(supervisor.start("gone").await.is_err());
}

#[tokio::test]
async fn stop_during_backoff_aborts_the_pending_respawn() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "crash.sh", "echo spawn\nexit 1");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "crash",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::OnFailure,
    );

    supervisor.start("crash").await.expect("start");
    assert!(
        wait_for(&supervisor, "crash", Duration::from_secs(5), |s| {
            s.status == Status::Restarting
        })
        .await,
        "process never entered backoff"
    );

    supervisor.stop("crash").await.expect("stop");
    assert_eq!(
        supervisor.status("crash").map(|s| s.status),
        Some(Status::Stopped),
        "stop during backoff must settle immediately"
    );

    // Outwait the cancelled backoff (1 s for the first failure).
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        supervisor.status("crash").map(|s| s.status),
        Some(Status::Stopped),
        "the aborted respawn must not resurrect the process"
    );
    let spawns = supervisor
        .tail("crash", 50)
        .expect("tail")
        .iter()
        .filter(|l| l.line == "spawn")
        .count();
    assert_eq!(spawns, 1, "exactly one lifecycle ran");
}

#[tokio::test]
async fn restart_during_backoff_spawns_exactly_one_child() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "crash.sh", "echo spawn\nexit 1");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "crash",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::OnFailure,
    );

    supervisor.start("crash").await.expect("start");
    assert!(
        wait_for(&supervisor, "crash", Duration::from_secs(5), |s| {
            s.status == Status::Restarting
        })
        .await,
        "process never entered backoff"
    );

    // Restart cancels the pending respawn and starts a fresh lifecycle.
    supervisor.restart("crash").await.expect("restart");

    let spawn_count = || {
        supervisor
            .tail("crash", 50)
            .expect("tail")
            .iter()
            .filter(|l| l.line == "spawn")
            .count()
    };
    let start = std::time::Instant::now();
    while spawn_count() < 2 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(spawn_count(), 2, "restart must have started a second lifecycle");

    // The cancelled respawn would have fired within 1 s of the first exit;
    // the second lifecycle's own backoff is 2 s, so inside this window a
    // third spawn can only come from the stale respawn.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(
        spawn_count(),
        2,
        "the cancelled respawn must not spawn a second child"
    );

    supervisor.stop_all().await;
}

#[tokio::test]
async fn restart_keeps_failure_counter() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "sleeper.sh", "sleep 30");
    let supervisor = Supervisor::new(CancellationToken::new());
    supervisor.register(
        "svc",
        &script.display().to_string(),
        "",
        BTreeMap::new(),
        RestartPolicy::Never,
    );

    supervisor.start("svc").await.expect("start");
    assert!(
        wait_for(&supervisor, "svc", Duration::from_secs(5), |s| {
            s.status == Status::Running
        })
        .await
    );

    supervisor.restart("svc").await.expect("restart");
    assert!(
        wait_for(&supervisor, "svc", Duration::from_secs(5), |s| {
            s.status == Status::Running
        })
        .await,
        "process must be running again after restart"
    );
    // The stop inside restart reaped one exit; the counter keeps it.
    assert_eq!(supervisor.failures("svc"), Some(1));

    supervisor.stop_all().await;
}
