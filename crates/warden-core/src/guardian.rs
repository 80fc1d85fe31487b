use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::{ProcessController, TickOutcome};
use crate::process::PlatformManager;

/// Periodic background check that restarts a dead worker.
///
/// Acts only while auto-restart is enabled and the worker is supposed to run.
/// Each tick makes at most one restart attempt; a failed attempt is retried
/// on the next tick.
pub struct Guardian<Manager> {
    controller: Arc<ProcessController<Manager>>,
}

impl<Manager: PlatformManager> Guardian<Manager> {
    pub fn new(controller: Arc<ProcessController<Manager>>) -> Self {
        Self { controller }
    }

    /// Run until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let period = self.controller.config().poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(poll_interval_ms = period.as_millis() as u64, "Guardian started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.controller.guardian_tick().await {
                        TickOutcome::Restarted(started) => {
                            info!(pid = started.pid, log_file = %started.log_file, "Guardian restarted worker");
                        }
                        outcome => debug!(?outcome, "Guardian tick"),
                    }
                }
            }
        }
        info!("Guardian stopped");
    }
}
