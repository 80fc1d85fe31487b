use anyhow::Result;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid as NixPid, getpid};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, warn};
use warden_core::{ProcessId, ProcessTermination, SupervisorConfig, TerminationResult};

const EXIT_POLL: Duration = Duration::from_millis(50);
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Unix process manager.
///
/// Every worker leads its own process group; termination signals the group
/// and every descendant found through the process table, escalating from
/// SIGTERM to SIGKILL after the configured grace period.
///
/// On Linux the parent-death signal reaches only the direct worker. If the
/// supervisor is killed outright, descendants the worker started (a server
/// launched by a wrapper script, for example) are orphaned and keep running.
/// While the supervisor is alive, processes left behind by a crashed worker
/// stay in its group and are killed before the next worker is spawned.
pub struct UnixProcessManager {
    system: Mutex<System>,
    pub(crate) supervisor_pid: NixPid,
    stop_grace: Duration,
    /// Process groups owned by this supervisor, killed on drop
    pub(crate) members: Mutex<HashSet<ProcessId>>,
}

impl UnixProcessManager {
    pub fn new(config: &SupervisorConfig) -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use anyhow::Context;
            nix::sys::prctl::get_pdeathsig().context("Parent-death signal is not available")?;
        }

        let supervisor_pid = getpid();
        info!(
            supervisor_pid = supervisor_pid.as_raw(),
            "Unix containment group ready"
        );

        Ok(Self {
            system: Mutex::new(System::new()),
            supervisor_pid,
            stop_grace: config.stop_grace(),
            members: Mutex::new(HashSet::new()),
        })
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn members(&self) -> MutexGuard<'_, HashSet<ProcessId>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recursively find all descendants, children listed after their own
    /// descendants. Threads are skipped.
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }

    /// Subset of `pids` that still exist and are not zombies
    pub(crate) fn alive(&self, pids: &[ProcessId]) -> Vec<ProcessId> {
        let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::nothing(),
        );

        pids.iter()
            .copied()
            .filter(|pid| {
                system
                    .process(Pid::from_u32(*pid))
                    .is_some_and(|p| p.status() != ProcessStatus::Zombie)
            })
            .collect()
    }

    async fn wait_for_exit(&self, pids: &[ProcessId], timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.alive(pids).is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    fn signal_descendants(descendants: &[ProcessId], sig: Signal) {
        for pid in descendants {
            match signal::kill(NixPid::from_raw(*pid as i32), sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, signal = %sig, error = %e, "Failed to signal descendant"),
            }
        }
    }

    fn signal_group(root_pid: ProcessId, sig: Signal) -> Result<(), Errno> {
        signal::killpg(NixPid::from_raw(root_pid as i32), sig)
    }

    /// Whether `pid` is still a worker spawned by this supervisor, zombies included
    fn is_own_child(&self, pid: ProcessId) -> bool {
        let target = Pid::from_u32(pid);
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system.process(target).is_some_and(|process| {
            process
                .parent()
                .is_some_and(|ppid| ppid.as_u32() == self.supervisor_pid.as_raw() as u32)
        })
    }

    /// Forget groups whose leader has exited, killing whatever the dead
    /// worker left behind in them.
    ///
    /// A pgid is not reused while the group has members, so a recorded pid
    /// that now belongs to someone else marks an empty group and is dropped
    /// without a signal.
    pub(crate) fn sweep_dead_groups(&self) {
        let mut members = self.members();
        let before = members.len();
        members.retain(|&pid| {
            if self.is_own_child(pid) {
                return true;
            }
            if signal::kill(NixPid::from_raw(pid as i32), None) != Err(Errno::ESRCH) {
                debug!(pid, "Recorded worker pid was reused; forgetting its group");
                return false;
            }
            match Self::signal_group(pid, Signal::SIGKILL) {
                Ok(()) => warn!(pid, "Killed processes left behind by a dead worker"),
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "Failed to kill leftovers of a dead worker"),
            }
            false
        });

        let dropped = before - members.len();
        if dropped > 0 {
            debug!(dropped, remaining = members.len(), "Swept process groups of dead workers");
        }
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, parent_pid, &mut children);
        Ok(children)
    }

    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        info!(root_pid, "Terminating process tree");

        let descendants = match self.find_child_processes(root_pid).await {
            Ok(descendants) => descendants,
            Err(e) => {
                warn!(root_pid, error = %e, "Failed to enumerate descendants; signalling group only");
                Vec::new()
            }
        };

        match Self::signal_group(root_pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) if descendants.is_empty() => {
                info!(root_pid, "Process group not found (already terminated)");
                self.members().remove(&root_pid);
                return TerminationResult::ProcessNotFound;
            }
            Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                warn!(root_pid, "Permission denied to signal process group");
                return TerminationResult::AccessDenied;
            }
            Err(e) => {
                warn!(root_pid, error = %e, "Failed to send SIGTERM to process group");
                return TerminationResult::Failed(format!("SIGTERM failed: {e}"));
            }
        }
        Self::signal_descendants(&descendants, Signal::SIGTERM);

        let mut tree = descendants.clone();
        tree.push(root_pid);

        if !self.wait_for_exit(&tree, self.stop_grace).await {
            warn!(
                root_pid,
                grace_ms = self.stop_grace.as_millis() as u64,
                "Process tree outlived SIGTERM; sending SIGKILL"
            );
            match Self::signal_group(root_pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => return TerminationResult::AccessDenied,
                Err(e) => return TerminationResult::Failed(format!("SIGKILL failed: {e}")),
            }
            Self::signal_descendants(&descendants, Signal::SIGKILL);

            if !self.wait_for_exit(&tree, KILL_SETTLE).await {
                let survivors = self.alive(&tree);
                warn!(root_pid, ?survivors, "Processes survived SIGKILL");
                return TerminationResult::Failed(format!(
                    "processes {survivors:?} survived SIGKILL"
                ));
            }
        }

        self.members().remove(&root_pid);
        info!(root_pid, descendants = descendants.len(), "Process tree terminated");
        TerminationResult::Success
    }
}

impl Drop for UnixProcessManager {
    fn drop(&mut self) {
        self.sweep_dead_groups();

        // Emergency cleanup of every group still owned by this supervisor
        let groups: Vec<ProcessId> = self.members().drain().collect();
        if groups.is_empty() {
            return;
        }

        warn!(
            count = groups.len(),
            "Emergency cleanup: killing process groups during drop"
        );
        for pid in groups {
            if let Err(e) = Self::signal_group(pid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    warn!(pid, error = %e, "Failed to kill process group during drop");
                }
            }
        }
    }
}
