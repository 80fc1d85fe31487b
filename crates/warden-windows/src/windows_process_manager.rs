use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tracing::{info, warn};
use warden_core::*;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Threading::{CREATE_NO_WINDOW, CREATE_SUSPENDED};

use crate::job_object::{self, JobObject};

/// Windows process manager.
///
/// The supervisor and every worker share one kill-on-close job object.
/// Workers start suspended and only run once they are inside the job.
pub struct WindowsProcessManager {
    system: Mutex<System>,
    job: JobObject,
    stop_grace: Duration,
}

impl WindowsProcessManager {
    pub fn new(config: &SupervisorConfig) -> Result<Self> {
        let job = JobObject::create()?;
        info!("Windows job object ready");

        Ok(Self {
            system: Mutex::new(System::new()),
            job,
            stop_grace: config.stop_grace(),
        })
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self, pid: ProcessId) -> bool {
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system.process(Pid::from_u32(pid)).is_some()
    }

    /// Use taskkill to terminate a single process
    async fn taskkill(&self, pid: u32, force: bool) -> Result<bool> {
        let pid_string = pid.to_string();
        let mut args = vec!["/PID", &pid_string];
        if force {
            args.push("/F");
        }

        let output = Command::new("taskkill")
            .args(&args)
            .creation_flags(CREATE_NO_WINDOW.0)
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// Use taskkill with /T to terminate a process tree
    async fn taskkill_tree(&self, pid: u32) -> Result<bool> {
        let output = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW.0)
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// Terminate a single process, forcing it after the grace period
    async fn terminate_single_process(&self, pid: ProcessId) -> TerminationResult {
        match self.taskkill(pid, false).await {
            Ok(true) => {
                tokio::time::sleep(self.stop_grace).await;
                if !self.is_running(pid) {
                    return TerminationResult::Success;
                }
                match self.taskkill(pid, true).await {
                    Ok(_) => TerminationResult::Success,
                    Err(e) => {
                        warn!(pid, error = %e, "Failed to force kill process");
                        TerminationResult::Failed(format!("Force kill failed: {e}"))
                    }
                }
            }
            Ok(false) if !self.is_running(pid) => TerminationResult::ProcessNotFound,
            Ok(false) => match self.taskkill(pid, true).await {
                Ok(true) => TerminationResult::Success,
                Ok(false) => TerminationResult::AccessDenied,
                Err(e) => TerminationResult::Failed(format!("Force kill failed: {e}")),
            },
            Err(e) => {
                warn!(pid, error = %e, "Failed to run taskkill");
                TerminationResult::Failed(format!("taskkill failed: {e}"))
            }
        }
    }

    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

impl ContainmentGroup for WindowsProcessManager {
    fn prepare(&self, command: &mut Command) {
        command.creation_flags(CREATE_SUSPENDED.0 | CREATE_NO_WINDOW.0);
    }

    fn adopt(&self, child: &Child) -> Result<()> {
        let pid = child
            .id()
            .context("Worker exited before it could be contained")?;
        let raw = child
            .raw_handle()
            .context("Worker handle is no longer available")?;

        self.job.assign(HANDLE(raw))?;
        let threads = job_object::resume_threads(pid)?;
        info!(pid, threads, "Worker assigned to job object and resumed");
        Ok(())
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
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

        match self.taskkill_tree(root_pid).await {
            Ok(true) => {
                info!(root_pid, "Process tree terminated");
                TerminationResult::Success
            }
            Ok(false) if !self.is_running(root_pid) => {
                info!(root_pid, "Process tree not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            outcome => {
                if let Err(e) = &outcome {
                    warn!(root_pid, error = %e, "taskkill /T failed; terminating tree manually");
                } else {
                    warn!(root_pid, "taskkill /T reported failure; terminating tree manually");
                }

                let children = match self.find_child_processes(root_pid).await {
                    Ok(children) => children,
                    Err(e) => {
                        return TerminationResult::Failed(format!(
                            "Failed to enumerate children: {e}"
                        ));
                    }
                };

                // Descendants first, bottom-up
                for child_pid in children {
                    match self.terminate_single_process(child_pid).await {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!(pid = child_pid, %result, "Failed to terminate descendant")
                        }
                    }
                }

                self.terminate_single_process(root_pid).await
            }
        }
    }
}
