use thiserror::Error;

/// Error types surfaced by the supervisor
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Worker is not running")]
    NotRunning,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailure(String),

    #[error("Failed to terminate worker: {0}")]
    TerminationFailure(String),

    #[error("Failed to write worker log: {0}")]
    LogWriteFailure(String),

    #[error("Containment group setup failed: {0}")]
    ContainmentSetupFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("State persistence error: {0}")]
    Persistence(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    /// Check if the guardian should simply try again on its next tick
    pub fn is_retryable(&self) -> bool {
        matches!(self, WardenError::SpawnFailure(_))
    }

    /// Check if this error must abort supervisor boot
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WardenError::ContainmentSetupFailure(_) | WardenError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert!(WardenError::SpawnFailure("missing binary".to_string()).is_retryable());
        assert!(!WardenError::AlreadyRunning.is_retryable());
        assert!(!WardenError::TerminationFailure("denied".to_string()).is_retryable());

        assert!(WardenError::ContainmentSetupFailure("no job".to_string()).is_fatal());
        assert!(!WardenError::NotRunning.is_fatal());
        assert!(!WardenError::LogWriteFailure("disk full".to_string()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let error = WardenError::TerminationFailure("access denied".to_string());
        assert_eq!(format!("{error}"), "Failed to terminate worker: access denied");

        let error = WardenError::from(anyhow::anyhow!("boom"));
        assert!(format!("{error}").contains("boom"));
    }
}
