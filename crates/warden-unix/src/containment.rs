use anyhow::{Context, Result, bail};
use nix::unistd::{Pid as NixPid, getpgid};
use tokio::process::{Child, Command};
use tracing::info;
use warden_core::ContainmentGroup;

use crate::UnixProcessManager;

impl ContainmentGroup for UnixProcessManager {
    fn prepare(&self, command: &mut Command) {
        self.sweep_dead_groups();
        command.process_group(0);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use nix::sys::prctl;
            use nix::sys::signal::Signal;
            use nix::unistd::getppid;

            let supervisor = self.supervisor_pid;
            // The death signal follows the thread that forked, so spawns must
            // not happen on a short-lived blocking-pool thread.
            // SAFETY: only async-signal-safe syscalls run between fork and exec.
            unsafe {
                command.pre_exec(move || {
                    prctl::set_pdeathsig(Signal::SIGKILL)?;
                    if getppid() != supervisor {
                        return Err(std::io::Error::other("supervisor exited during spawn"));
                    }
                    Ok(())
                });
            }
        }
    }

    fn adopt(&self, child: &Child) -> Result<()> {
        let pid = child
            .id()
            .context("Worker exited before it could be contained")?;

        let group = getpgid(Some(NixPid::from_raw(pid as i32)))
            .with_context(|| format!("Failed to read process group of {pid}"))?;
        if group.as_raw() != pid as i32 {
            bail!("worker {pid} is in process group {group}, expected its own");
        }

        self.members().insert(pid);
        info!(pid, "Worker contained in its own process group");
        Ok(())
    }
}
