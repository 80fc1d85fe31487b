use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::fs::File;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::capture::{self, LogCapture};
use crate::config::SupervisorConfig;
use crate::error::WardenError;
use crate::logs::{self, log_file_name};
use crate::persist::{PersistedState, StateStore};
use crate::process::{PlatformManager, ProcessId, TerminationResult};
use crate::state::{DesiredState, StatusReport, SupervisorState, WorkerProcess};

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedWorker {
    pub pid: ProcessId,
    pub log_file: String,
}

/// What one guardian tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Auto-restart disabled or the worker is not supposed to run
    Idle,
    /// Worker alive
    Healthy,
    /// Worker dead but the restart policy asks to wait this much longer
    BackingOff(Duration),
    Restarted(StartedWorker),
    RestartFailed,
}

/// Owns start/stop of exactly one worker process at a time.
///
/// `lifecycle` serializes start, stop and guardian restarts so at most one
/// worker is ever tracked. `state` is the single lock guarding the supervisor
/// record and is only held for short, non-blocking sections, so status and
/// tail queries never wait on an in-flight termination.
pub struct ProcessController<Manager> {
    config: SupervisorConfig,
    platform: Arc<Manager>,
    state: Mutex<SupervisorState>,
    lifecycle: Mutex<()>,
    store: Option<StateStore>,
}

impl<Manager: PlatformManager> ProcessController<Manager> {
    pub fn new(config: SupervisorConfig, platform: Arc<Manager>) -> Self {
        let store = config.state_file.clone().map(StateStore::new);
        Self {
            config,
            platform,
            state: Mutex::new(SupervisorState::new()),
            lifecycle: Mutex::new(()),
            store,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Load the persisted flags, if a state file is configured and present
    pub async fn restore(&self) -> Result<Option<PersistedState>, WardenError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(saved) = store.load().await? else {
            return Ok(None);
        };

        self.state.lock().await.apply(saved);
        info!(
            desired = ?saved.desired,
            auto_restart_enabled = saved.auto_restart_enabled,
            "Restored supervisor state"
        );
        Ok(Some(saved))
    }

    pub async fn start(&self) -> Result<StartedWorker, WardenError> {
        let _lifecycle = self.lifecycle.lock().await;
        let started = self.start_locked().await?;
        self.state.lock().await.restarts.reset();
        Ok(started)
    }

    async fn start_locked(&self) -> Result<StartedWorker, WardenError> {
        if self.state.lock().await.worker_alive() {
            return Err(WardenError::AlreadyRunning);
        }

        let worker = self.spawn_worker().await?;
        let started = StartedWorker {
            pid: worker.pid(),
            log_file: log_file_name(worker.log_file()),
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.install(worker) {
                debug!(pid = previous.pid(), "Dropped record of dead worker");
            }
            state.set_desired(DesiredState::ShouldRun);
            state.persisted()
        };
        self.persist(snapshot).await;

        info!(pid = started.pid, log_file = %started.log_file, "Worker started");
        Ok(started)
    }

    async fn spawn_worker(&self) -> Result<WorkerProcess, WardenError> {
        let log_dir = &self.config.log_directory;
        tokio::fs::create_dir_all(log_dir).await.map_err(|e| {
            WardenError::SpawnFailure(format!(
                "cannot create log directory {}: {e}",
                log_dir.display()
            ))
        })?;

        let started_at = Local::now();
        let (log_file, file) = logs::create_log_file(log_dir, &self.config.log_prefix, started_at)
            .await
            .map_err(|e| {
                WardenError::SpawnFailure(format!(
                    "cannot create log file in {}: {e}",
                    log_dir.display()
                ))
            })?;

        match self.launch(&log_file, file).await {
            Ok((pid, child, capture)) => {
                Ok(WorkerProcess::new(pid, started_at, log_file, child, capture))
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&log_file).await {
                    debug!(log_file = %log_file.display(), error = %remove_err, "Unused log file left behind");
                }
                Err(e)
            }
        }
    }

    /// Spawn and contain the worker, wiring its output into `file`
    async fn launch(
        &self,
        log_file: &Path,
        file: File,
    ) -> Result<(ProcessId, Child, LogCapture), WardenError> {
        // stdout and stderr share one pipe so the log keeps their interleaving
        let (reader, writer) = std::io::pipe()
            .map_err(|e| WardenError::SpawnFailure(format!("cannot create output pipe: {e}")))?;
        let stderr = writer
            .try_clone()
            .map_err(|e| WardenError::SpawnFailure(format!("cannot create output pipe: {e}")))?;
        let stream = async_reader(reader)
            .map_err(|e| WardenError::SpawnFailure(format!("cannot read worker output: {e}")))?;

        // The command holds the pipe's write ends; it must be dropped right
        // after spawn or the capture never sees end-of-stream.
        let mut child = {
            let mut command = Command::new(&self.config.command);
            command
                .args(&self.config.args)
                .current_dir(&self.config.working_directory)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr);
            self.platform.prepare(&mut command);

            command.spawn().map_err(|e| {
                WardenError::SpawnFailure(format!("{}: {e}", self.config.command))
            })?
        };

        let Some(pid) = child.id() else {
            return Err(WardenError::SpawnFailure(
                "worker exited before it could be tracked".to_string(),
            ));
        };

        if let Err(e) = self.platform.adopt(&child) {
            warn!(pid, error = %e, "Containment failed; killing uncontained worker");
            if let Err(kill_err) = child.kill().await {
                warn!(pid, error = %kill_err, "Failed to kill uncontained worker");
            }
            return Err(WardenError::SpawnFailure(format!(
                "cannot contain worker {pid}: {e:#}"
            )));
        }

        let capture = LogCapture::spawn(stream, file, log_file.to_path_buf());

        Ok((pid, child, capture))
    }

    pub async fn stop(&self) -> Result<(), WardenError> {
        let _lifecycle = self.lifecycle.lock().await;

        let (pid, snapshot) = {
            let mut state = self.state.lock().await;
            if !state.worker_alive() {
                return Err(WardenError::NotRunning);
            }
            let Some(pid) = state.worker_pid() else {
                return Err(WardenError::NotRunning);
            };
            // Must precede the kill: the guardian reads this flag before
            // deciding to replace a dead worker.
            state.set_desired(DesiredState::ShouldStop);
            (pid, state.persisted())
        };
        self.persist(snapshot).await;

        info!(pid, "Stopping worker");
        let result = self.platform.terminate_process_tree(pid).await;
        if !result.is_terminated() {
            let snapshot = {
                let mut state = self.state.lock().await;
                state.set_desired(DesiredState::ShouldRun);
                state.persisted()
            };
            self.persist(snapshot).await;
            warn!(pid, result = %result, "Worker termination failed");
            return Err(WardenError::TerminationFailure(result.to_string()));
        }

        let worker = self.state.lock().await.take_worker();
        if let Some(worker) = worker {
            self.reclaim(worker).await;
        }
        info!(pid, "Worker stopped");
        Ok(())
    }

    /// Terminate the worker on supervisor shutdown, leaving the desired-run
    /// flag untouched so a persisted `ShouldRun` survives the restart.
    pub async fn release(&self) -> Result<(), WardenError> {
        let _lifecycle = self.lifecycle.lock().await;

        let worker = {
            let mut state = self.state.lock().await;
            if !state.worker_alive() {
                return Ok(());
            }
            state.take_worker()
        };
        let Some(worker) = worker else {
            return Ok(());
        };

        let pid = worker.pid();
        info!(pid, "Releasing worker on shutdown");
        let result = self.platform.terminate_process_tree(pid).await;
        self.reclaim(worker).await;

        match result {
            TerminationResult::Success | TerminationResult::ProcessNotFound => Ok(()),
            other => Err(WardenError::TerminationFailure(other.to_string())),
        }
    }

    /// Reap the terminated worker and let its capture flush
    async fn reclaim(&self, mut worker: WorkerProcess) {
        let pid = worker.pid();
        let timeout = self.config.capture_join_timeout();

        match tokio::time::timeout(timeout, worker.child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "Worker reaped"),
            Ok(Err(e)) => warn!(pid, error = %e, "Failed to reap worker"),
            Err(_) => {
                warn!(pid, "Worker outlived tree termination; killing directly");
                if let Err(e) = worker.child.kill().await {
                    warn!(pid, error = %e, "Direct kill failed");
                }
            }
        }

        if let Some(capture) = worker.capture.take() {
            if let Some(summary) = capture.join(timeout).await {
                debug!(pid, lines = summary.lines, "Log capture finished");
            }
        }
    }

    /// Read-only status; performs a live liveness check
    pub async fn status(&self) -> StatusReport {
        self.state.lock().await.observe()
    }

    /// Last `lines` lines (default from config) of the current log file
    pub async fn tail(&self, lines: Option<usize>) -> Result<String, WardenError> {
        let log_file = self.state.lock().await.active_log().map(|p| p.to_path_buf());
        let lines = lines.unwrap_or(self.config.tail_lines);
        capture::tail(log_file.as_deref(), lines).await
    }

    /// Flip the in-memory auto-restart flag; never touches the worker
    pub async fn toggle_auto_restart(&self) -> bool {
        let (enabled, snapshot) = {
            let mut state = self.state.lock().await;
            let enabled = state.toggle_auto_restart();
            (enabled, state.persisted())
        };
        self.persist(snapshot).await;
        info!(enabled, "Auto-restart toggled");
        enabled
    }

    pub async fn list_logs(&self) -> Result<Vec<String>, WardenError> {
        logs::list_logs(&self.config.log_directory, &self.config.log_prefix).await
    }

    /// One guardian check: at most one restart attempt
    pub async fn guardian_tick(&self) -> TickOutcome {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut state = self.state.lock().await;
            if !state.auto_restart_enabled() || state.desired() != DesiredState::ShouldRun {
                return TickOutcome::Idle;
            }
            if state.worker_alive() {
                state.restarts.reset();
                return TickOutcome::Healthy;
            }

            let now = Instant::now();
            if let Some(wait) = state.restarts.remaining(&self.config.restart_policy, now) {
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    attempts = state.restarts.consecutive(),
                    "Worker is down; backing off"
                );
                return TickOutcome::BackingOff(wait);
            }
            state.restarts.record_attempt(now);
            warn!(
                pid = ?state.worker_pid(),
                attempt = state.restarts.consecutive(),
                "Worker terminated unexpectedly; restarting"
            );
        }

        match self.start_locked().await {
            Ok(started) => TickOutcome::Restarted(started),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Restart failed; retrying on next tick");
                TickOutcome::RestartFailed
            }
        }
    }

    async fn persist(&self, snapshot: PersistedState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot).await {
                warn!(path = %store.path().display(), error = %e, "Failed to persist supervisor state");
            }
        }
    }
}

/// Hand the read end of the output pipe to the async runtime
#[cfg(unix)]
fn async_reader(
    reader: std::io::PipeReader,
) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    let fd = std::os::fd::OwnedFd::from(reader);
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(fd)?;
    Ok(Box::new(receiver))
}

#[cfg(windows)]
fn async_reader(
    reader: std::io::PipeReader,
) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    let handle = std::os::windows::io::OwnedHandle::from(reader);
    let file = tokio::fs::File::from_std(std::fs::File::from(handle));
    Ok(Box::new(file))
}
