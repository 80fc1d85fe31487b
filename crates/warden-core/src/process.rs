use crate::config::SupervisorConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::process::{Child, Command};

/// Unique identifier for a process
pub type ProcessId = u32;

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process tree was terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges to signal the process
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the tree is gone after this result
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

impl fmt::Display for TerminationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationResult::Success => write!(f, "terminated"),
            TerminationResult::ProcessNotFound => write!(f, "process not found"),
            TerminationResult::AccessDenied => write!(f, "access denied"),
            TerminationResult::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

/// OS-level group guaranteeing that every member process, including its
/// descendants, terminates when the owning supervisor terminates.
///
/// A worker joins the group in two steps: `prepare` configures the command
/// before spawn (the worker must not run user code until it is contained),
/// `adopt` completes membership on the freshly spawned child and lets it run.
pub trait ContainmentGroup: Send + Sync {
    /// Configure the command so the spawned process starts suspended or pre-contained
    fn prepare(&self, command: &mut Command);

    /// Assign a freshly spawned child to the group and resume it
    fn adopt(&self, child: &Child) -> Result<()>;
}

/// Trait for terminating a worker together with every process it spawned
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Find all descendants of a given process
    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Terminate an entire process tree (parent and all descendants)
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;
}

/// Everything the controller needs from the host OS
pub trait PlatformManager: ContainmentGroup + ProcessTermination + 'static {}

impl<T: ContainmentGroup + ProcessTermination + 'static> PlatformManager for T {}

/// Factory trait for creating the platform manager of the current OS.
///
/// Creating the manager establishes the containment group; it happens exactly
/// once per supervisor and any error is fatal to boot.
pub trait PlatformManagerFactory {
    /// The type of platform manager this factory creates
    type Manager: PlatformManager;

    /// Create and initialize the platform manager
    fn create_platform_manager(config: &SupervisorConfig) -> Result<Self::Manager>;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
