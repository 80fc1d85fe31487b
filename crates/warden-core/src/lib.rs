//! Warden Core - Platform-independent supervision of a single worker process
//!
//! This crate holds the supervisor state, the controller that starts and stops
//! the worker, the guardian that restarts it, and the capture of its output
//! into per-lifetime log files. OS specifics live behind [`PlatformManager`].

mod capture;
mod config;
mod controller;
mod error;
mod guardian;
mod logs;
mod persist;
mod process;
mod state;

pub use capture::{CaptureSummary, LogCapture, NO_ACTIVE_LOG, tail};
pub use config::*;
pub use controller::{ProcessController, StartedWorker, TickOutcome};
pub use error::*;
pub use guardian::Guardian;
pub use logs::{create_log_file, list_logs, log_file_name};
pub use persist::{PersistedState, StateStore};
pub use process::*;
pub use state::{DesiredState, ObservedStatus, StatusReport, SupervisorState, WorkerProcess};
