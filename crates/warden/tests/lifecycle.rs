#![cfg(unix)]

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use warden::{NO_ACTIVE_LOG, ObservedStatus, SupervisorConfig, Warden, WardenError};

const POLL_MS: u64 = 200;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("warden-it-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config(dir: &PathBuf, script: &str) -> SupervisorConfig {
    SupervisorConfig::builder()
        .command("sh")
        .args(["-c", script])
        .working_directory(dir.clone())
        .log_directory(dir.join("logs"))
        .poll_interval_ms(POLL_MS)
        .stop_grace_ms(500u64)
        .build()
        .unwrap()
}

async fn boot(name: &str, script: &str) -> Warden {
    init_tracing();
    Warden::boot(config(&scratch_dir(name), script)).await.unwrap()
}

/// Zombies count as gone; orphans may never be reaped inside a container
fn pid_exists(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_tail_before_any_start_is_placeholder() {
    let warden = boot("tail-empty", "exec sleep 30").await;

    assert_eq!(warden.tail(None).await.unwrap(), NO_ACTIVE_LOG);
    assert_eq!(warden.tail(Some(5)).await.unwrap(), NO_ACTIVE_LOG);
    assert!(warden.list_logs().await.unwrap().is_empty());
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_boot_rejects_invalid_config() {
    init_tracing();
    let dir = scratch_dir("invalid-config");
    let mut config = config(&dir, "exec sleep 30");
    config.poll_interval_ms = 0;

    let err = Warden::boot(config).await.err().unwrap();
    assert!(matches!(err, WardenError::Configuration(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unreadable_state_file_does_not_abort_boot() {
    init_tracing();
    let dir = scratch_dir("bad-state");
    let mut config = config(&dir, "exec sleep 30");
    let state_file = dir.join("state.json");
    std::fs::write(&state_file, "not json").unwrap();
    config.state_file = Some(state_file);

    let warden = Warden::boot(config).await.unwrap();
    let status = warden.status().await;
    assert_eq!(status.state, ObservedStatus::Stopped);
    assert!(!status.auto_restart_enabled);
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_when_not_running_leaves_state_unchanged() {
    let warden = boot("stop-idle", "exec sleep 30").await;
    let before = warden.status().await;

    assert!(matches!(warden.stop().await, Err(WardenError::NotRunning)));
    assert_eq!(warden.status().await, before);
    assert_eq!(before.state, ObservedStatus::Stopped);
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let warden = boot("double-start", "exec sleep 30").await;

    let started = warden.start().await.unwrap();
    assert!(matches!(
        warden.start().await,
        Err(WardenError::AlreadyRunning)
    ));

    let status = warden.status().await;
    assert_eq!(status.state, ObservedStatus::Running);
    assert_eq!(status.pid, Some(started.pid));
    assert_eq!(warden.list_logs().await.unwrap().len(), 1);

    warden.stop().await.unwrap();
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_stop_keeps_complete_log() {
    let warden = boot("start-stop", "echo one; echo two >&2; echo three; exec sleep 30").await;

    let started = warden.start().await.unwrap();
    assert!(started.log_file.starts_with("app-") && started.log_file.ends_with(".log"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    warden.stop().await.unwrap();
    let status = warden.status().await;
    assert_eq!(status.state, ObservedStatus::Stopped);
    assert_eq!(status.pid, None);
    assert_eq!(status.log_file.as_deref(), Some(started.log_file.as_str()));
    assert!(!pid_exists(started.pid));

    let log = warden.config().log_directory.join(&started.log_file);
    assert_eq!(std::fs::read_to_string(log).unwrap(), "one\ntwo\nthree\n");
    assert_eq!(warden.tail(Some(2)).await.unwrap(), "two\nthree\n");

    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_guardian_replaces_killed_worker() {
    let warden = boot("auto-restart", "exec sleep 30").await;
    assert!(warden.toggle_auto_restart().await);

    let first = warden.start().await.unwrap();
    let first_status = warden.status().await;
    // Log names carry one-second stamps
    tokio::time::sleep(Duration::from_millis(1100)).await;

    signal::kill(Pid::from_raw(first.pid as i32), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(POLL_MS * 3)).await;

    let status = warden.status().await;
    assert_eq!(status.state, ObservedStatus::Running);
    let second = status.pid.unwrap();
    assert_ne!(second, first.pid);
    assert!(status.started_at > first_status.started_at);
    assert_ne!(status.log_file.as_deref(), Some(first.log_file.as_str()));

    let logs = warden.list_logs().await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(Some(&logs[0]), status.log_file.as_ref());

    warden.stop().await.unwrap();
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crashed_worker_stays_down_without_auto_restart() {
    let warden = boot("no-restart", "exec sleep 30").await;

    let first = warden.start().await.unwrap();
    signal::kill(Pid::from_raw(first.pid as i32), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(POLL_MS * 3)).await;

    let status = warden.status().await;
    assert_eq!(status.state, ObservedStatus::Crashed);
    assert_eq!(status.pid, None);

    let second = warden.start().await.unwrap();
    assert_ne!(second.pid, first.pid);
    assert_eq!(warden.status().await.state, ObservedStatus::Running);

    warden.stop().await.unwrap();
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_terminates_grandchildren() {
    let dir = scratch_dir("grandchildren");
    let pid_file = dir.join("helper.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    init_tracing();
    let warden = Warden::boot(config(&dir, &script)).await.unwrap();

    warden.start().await.unwrap();
    assert!(wait_for(|| pid_file.exists() && std::fs::metadata(&pid_file).is_ok_and(|m| m.len() > 0)).await);
    let helper: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(pid_exists(helper));

    warden.stop().await.unwrap();
    assert!(wait_for(|| !pid_exists(helper)).await);
    warden.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persisted_flags_resume_worker_on_boot() {
    init_tracing();
    let dir = scratch_dir("persist");
    let mut config = config(&dir, "exec sleep 30");
    config.state_file = Some(dir.join("state.json"));

    let first = Warden::boot(config.clone()).await.unwrap();
    first.toggle_auto_restart().await;
    let old = first.start().await.unwrap();
    first.shutdown().await.unwrap();
    assert!(!pid_exists(old.pid));

    let second = Warden::boot(config).await.unwrap();
    let status = second.status().await;
    assert_eq!(status.state, ObservedStatus::Running);
    assert!(status.auto_restart_enabled);
    assert_ne!(status.pid, Some(old.pid));

    second.stop().await.unwrap();
    second.shutdown().await.unwrap();
}
