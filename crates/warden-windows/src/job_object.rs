use anyhow::{Context, Result, bail};
use std::ffi::c_void;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    SetInformationJobObject,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenThread, ResumeThread, THREAD_SUSPEND_RESUME,
};
use windows::core::PCWSTR;

/// Anonymous job object with kill-on-close, holding the supervisor itself.
///
/// The handle is intentionally never closed: the kernel closes it when the
/// supervisor exits, which kills every member process.
pub(crate) struct JobObject(HANDLE);

// SAFETY: a job handle is a process-wide kernel handle usable from any thread
unsafe impl Send for JobObject {}
unsafe impl Sync for JobObject {}

impl JobObject {
    pub(crate) fn create() -> Result<Self> {
        // SAFETY: plain Win32 calls on handles owned by this function
        unsafe {
            let handle = CreateJobObjectW(None, PCWSTR::null())
                .context("Failed to create job object")?;

            let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let configured = SetInformationJobObject(
                handle,
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const c_void,
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            );
            if let Err(e) = configured {
                let _ = CloseHandle(handle);
                return Err(e).context("Failed to set kill-on-close on job object");
            }

            if let Err(e) = AssignProcessToJobObject(handle, GetCurrentProcess()) {
                let _ = CloseHandle(handle);
                return Err(e).context("Failed to assign supervisor to job object");
            }

            Ok(Self(handle))
        }
    }

    pub(crate) fn assign(&self, process: HANDLE) -> Result<()> {
        // SAFETY: `process` is a live handle owned by the caller's Child
        unsafe { AssignProcessToJobObject(self.0, process) }
            .context("Failed to assign worker to job object")
    }
}

/// Resume every thread of a process created with `CREATE_SUSPENDED`
pub(crate) fn resume_threads(pid: u32) -> Result<usize> {
    // SAFETY: the snapshot and thread handles are closed before returning
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
            .context("Failed to snapshot threads")?;

        let mut entry = THREADENTRY32 {
            dwSize: size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut resumed = 0;
        let mut next = Thread32First(snapshot, &mut entry);
        while next.is_ok() {
            if entry.th32OwnerProcessID == pid {
                if let Ok(thread) = OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID) {
                    if ResumeThread(thread) != u32::MAX {
                        resumed += 1;
                    }
                    let _ = CloseHandle(thread);
                }
            }
            next = Thread32Next(snapshot, &mut entry);
        }
        let _ = CloseHandle(snapshot);

        if resumed == 0 {
            bail!("no thread of process {pid} could be resumed");
        }
        Ok(resumed)
    }
}
