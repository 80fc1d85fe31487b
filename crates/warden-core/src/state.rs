use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Child;
use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::capture::LogCapture;
use crate::config::RestartPolicy;
use crate::logs::log_file_name;
use crate::persist::PersistedState;
use crate::process::ProcessId;

/// Whether the worker should be running, independent of what the OS reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DesiredState {
    ShouldRun,
    ShouldStop,
}

/// Status derived from [`SupervisorState`] plus a live OS check; never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedStatus {
    Running,
    Crashed,
    Stopped,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedStatus::Running => write!(f, "Running"),
            ObservedStatus::Crashed => write!(f, "Crashed"),
            ObservedStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: ObservedStatus,
    /// Present only while the worker is alive
    pub pid: Option<ProcessId>,
    pub started_at: Option<DateTime<Local>>,
    /// Name of the most recent worker's log file
    pub log_file: Option<String>,
    pub auto_restart_enabled: bool,
}

/// One supervised worker lifetime
pub struct WorkerProcess {
    pid: ProcessId,
    started_at: DateTime<Local>,
    log_file: PathBuf,
    pub(crate) child: Child,
    pub(crate) capture: Option<LogCapture>,
}

impl WorkerProcess {
    pub(crate) fn new(
        pid: ProcessId,
        started_at: DateTime<Local>,
        log_file: PathBuf,
        child: Child,
        capture: LogCapture,
    ) -> Self {
        Self {
            pid,
            started_at,
            log_file,
            child,
            capture: Some(capture),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Non-blocking liveness check; reaps the process once it has exited
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to query worker status");
                false
            }
        }
    }
}

/// Consecutive guardian restarts, used to pace a crash-looping worker
#[derive(Debug, Default)]
pub(crate) struct RestartTracker {
    consecutive: u32,
    last_attempt: Option<Instant>,
}

impl RestartTracker {
    /// Time left before the next attempt is allowed, if any
    pub(crate) fn remaining(&self, policy: &RestartPolicy, now: Instant) -> Option<Duration> {
        let delay = policy.delay_after(self.consecutive)?;
        let ready = self.last_attempt? + delay;
        (ready > now).then(|| ready - now)
    }

    pub(crate) fn record_attempt(&mut self, now: Instant) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
        self.last_attempt = None;
    }

    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Everything the supervisor knows about its worker.
///
/// Lives behind the controller's single state lock; fields are only reachable
/// through the methods below.
pub struct SupervisorState {
    desired: DesiredState,
    auto_restart_enabled: bool,
    worker: Option<WorkerProcess>,
    last_log: Option<PathBuf>,
    pub(crate) restarts: RestartTracker,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorState {
    /// Fresh boot: worker not running, auto-restart disabled
    pub fn new() -> Self {
        Self {
            desired: DesiredState::ShouldStop,
            auto_restart_enabled: false,
            worker: None,
            last_log: None,
            restarts: RestartTracker::default(),
        }
    }

    pub fn desired(&self) -> DesiredState {
        self.desired
    }

    pub(crate) fn set_desired(&mut self, desired: DesiredState) {
        self.desired = desired;
    }

    pub fn auto_restart_enabled(&self) -> bool {
        self.auto_restart_enabled
    }

    pub(crate) fn toggle_auto_restart(&mut self) -> bool {
        self.auto_restart_enabled = !self.auto_restart_enabled;
        self.auto_restart_enabled
    }

    /// Log file of the most recent worker, kept after it stops
    pub fn active_log(&self) -> Option<&Path> {
        self.last_log.as_deref()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn worker_alive(&mut self) -> bool {
        self.worker.as_mut().is_some_and(WorkerProcess::is_alive)
    }

    pub fn worker_pid(&self) -> Option<ProcessId> {
        self.worker.as_ref().map(WorkerProcess::pid)
    }

    /// Record a new worker, returning the dead record it replaces
    pub(crate) fn install(&mut self, worker: WorkerProcess) -> Option<WorkerProcess> {
        self.last_log = Some(worker.log_file.clone());
        self.worker.replace(worker)
    }

    pub(crate) fn take_worker(&mut self) -> Option<WorkerProcess> {
        self.worker.take()
    }

    pub(crate) fn apply(&mut self, saved: PersistedState) {
        self.desired = saved.desired;
        self.auto_restart_enabled = saved.auto_restart_enabled;
    }

    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            desired: self.desired,
            auto_restart_enabled: self.auto_restart_enabled,
        }
    }

    /// Running if the worker is alive; Crashed if it is not but should be;
    /// Stopped otherwise.
    pub fn observe(&mut self) -> StatusReport {
        let alive = self.worker_alive();
        let state = match (alive, self.desired) {
            (true, _) => ObservedStatus::Running,
            (false, DesiredState::ShouldRun) => ObservedStatus::Crashed,
            (false, DesiredState::ShouldStop) => ObservedStatus::Stopped,
        };

        let running = self.worker.as_ref().filter(|_| alive);
        StatusReport {
            state,
            pid: running.map(WorkerProcess::pid),
            started_at: running.map(WorkerProcess::started_at),
            log_file: self.last_log.as_deref().map(log_file_name),
            auto_restart_enabled: self.auto_restart_enabled,
        }
    }
}
