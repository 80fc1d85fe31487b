//! Warden - supervise one long-running worker process.
//!
//! [`Warden::boot`] sets up OS containment, restores persisted flags and
//! starts the background guardian. The returned handle is cheap to clone and
//! exposes the control operations.

mod factory;

pub use factory::{PlatformFactory, PlatformManagerImpl};

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Re-export core functionality
pub use warden_core::*;

struct WardenInner {
    controller: Arc<ProcessController<PlatformManagerImpl>>,
    cancel: CancellationToken,
    guardian: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a booted supervisor
#[derive(Clone)]
pub struct Warden {
    inner: Arc<WardenInner>,
}

impl Warden {
    /// Fails only on errors that are [fatal](WardenError::is_fatal); anything
    /// else met while restoring state or resuming the worker is logged.
    pub async fn boot(config: SupervisorConfig) -> Result<Self, WardenError> {
        config.validate()?;

        let platform = PlatformFactory::create_platform_manager(&config)
            .map_err(|e| WardenError::ContainmentSetupFailure(format!("{e:#}")))?;
        info!(
            platform = PlatformFactory::platform_name(),
            command = %config.command,
            root = %config.working_directory.display(),
            "Supervisor booting"
        );

        let controller = Arc::new(ProcessController::new(config, Arc::new(platform)));

        let restored = match controller.restore().await {
            Ok(restored) => restored,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable supervisor state");
                None
            }
        };
        if restored.is_some_and(|saved| saved.desired == DesiredState::ShouldRun) {
            match controller.start().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Failed to resume worker after boot"),
            }
        }

        let cancel = CancellationToken::new();
        let guardian = Guardian::new(Arc::clone(&controller)).spawn(cancel.child_token());

        Ok(Self {
            inner: Arc::new(WardenInner {
                controller,
                cancel,
                guardian: Mutex::new(Some(guardian)),
            }),
        })
    }

    pub async fn start(&self) -> Result<StartedWorker, WardenError> {
        self.inner.controller.start().await
    }

    pub async fn stop(&self) -> Result<(), WardenError> {
        self.inner.controller.stop().await
    }

    pub async fn status(&self) -> StatusReport {
        self.inner.controller.status().await
    }

    /// Last lines of the current log; `None` uses the configured default
    pub async fn tail(&self, lines: Option<usize>) -> Result<String, WardenError> {
        self.inner.controller.tail(lines).await
    }

    pub async fn toggle_auto_restart(&self) -> bool {
        self.inner.controller.toggle_auto_restart().await
    }

    pub async fn list_logs(&self) -> Result<Vec<String>, WardenError> {
        self.inner.controller.list_logs().await
    }

    pub fn config(&self) -> &SupervisorConfig {
        self.inner.controller.config()
    }

    /// Stop the guardian, then terminate the worker tree.
    ///
    /// The desired-run flag is left as is, so a persisted supervisor resumes
    /// the worker on its next boot.
    pub async fn shutdown(&self) -> Result<(), WardenError> {
        self.inner.cancel.cancel();
        if let Some(guardian) = self.inner.guardian.lock().await.take() {
            if let Err(e) = guardian.await {
                warn!(error = %e, "Guardian task failed");
            }
        }

        self.inner.controller.release().await?;
        info!("Supervisor shut down");
        Ok(())
    }
}
