use crate::error::WardenError;
use backon::{BackoffBuilder, ExponentialBuilder};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exponential delay applied between consecutive guardian restarts of a crash-looping worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failed restart (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound for the delay (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied for every further consecutive restart
    #[serde(default = "default_factor")]
    pub factor: f32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(WardenError::Configuration(
                "backoff minDelayMs cannot be greater than maxDelayMs".to_string(),
            ));
        }

        if !(self.factor >= 1.0) {
            return Err(WardenError::Configuration(
                "backoff factor must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to honour after `consecutive` back-to-back restart attempts (1-based)
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        let mut delays = ExponentialBuilder::default()
            .with_min_delay(self.min_delay())
            .with_max_delay(self.max_delay())
            .with_factor(self.factor)
            .without_max_times()
            .build();

        let delay = delays
            .nth(consecutive.saturating_sub(1) as usize)
            .unwrap_or_else(|| self.max_delay());
        // backon computes in f32; snap to whole milliseconds
        Duration::from_millis((delay.as_secs_f64() * 1_000.0).round() as u64)
    }
}

/// How the guardian paces restarts of a worker that keeps dying
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    /// `None` restarts once per guardian tick, indefinitely
    #[serde(default)]
    pub backoff: Option<BackoffConfig>,
}

impl RestartPolicy {
    /// One restart attempt per tick, no backoff
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn with_backoff(backoff: BackoffConfig) -> Self {
        Self {
            backoff: Some(backoff),
        }
    }

    /// Time that must pass after the last attempt before the next one is allowed
    pub fn delay_after(&self, consecutive: u32) -> Option<Duration> {
        if consecutive == 0 {
            return None;
        }
        self.backoff.as_ref().map(|b| b.delay_for(consecutive))
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Fixed startup command of the worker
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    /// Application root, used as the worker's working directory
    pub working_directory: PathBuf,
    /// Directory receiving one log file per worker lifetime
    pub log_directory: PathBuf,
    #[builder(default = "default_log_prefix()")]
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    #[builder(default = "default_poll_interval_ms()")]
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[builder(default = "default_stop_grace_ms()")]
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[builder(default = "default_capture_join_timeout_ms()")]
    #[serde(default = "default_capture_join_timeout_ms")]
    pub capture_join_timeout_ms: u64,
    #[builder(default = "default_tail_lines()")]
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[builder(default)]
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Where the desired-run and auto-restart flags are kept across supervisor restarts
    #[builder(default)]
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), WardenError> {
        if self.command.trim().is_empty() {
            return Err(WardenError::Configuration(
                "worker command cannot be empty".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(WardenError::Configuration(
                "pollIntervalMs must be greater than zero".to_string(),
            ));
        }

        if self.tail_lines == 0 {
            return Err(WardenError::Configuration(
                "tailLines must be greater than zero".to_string(),
            ));
        }

        if self.log_prefix.is_empty() || self.log_prefix.contains(['/', '\\']) {
            return Err(WardenError::Configuration(format!(
                "invalid log prefix: {:?}",
                self.log_prefix
            )));
        }

        if let Some(backoff) = &self.restart_policy.backoff {
            backoff.validate()?;
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn capture_join_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_join_timeout_ms)
    }
}

impl SupervisorConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }
}

// Default value functions for serde
fn default_min_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_factor() -> f32 {
    2.0
}
fn default_log_prefix() -> String {
    "app".to_string()
}
fn default_poll_interval_ms() -> u64 {
    10_000
}
fn default_stop_grace_ms() -> u64 {
    2_000
}
fn default_capture_join_timeout_ms() -> u64 {
    2_000
}
fn default_tail_lines() -> usize {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SupervisorConfig {
        SupervisorConfig::builder()
            .command("sh")
            .args(["-c", "echo hi"])
            .working_directory("/tmp")
            .log_directory("/tmp/logs")
            .build()
            .expect("Failed to create test SupervisorConfig")
    }

    #[test]
    fn test_builder_defaults() {
        let config = base_config();
        assert_eq!(config.args, vec!["-c", "echo hi"]);
        assert_eq!(config.log_prefix, "app");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.tail_lines, 200);
        assert_eq!(config.restart_policy, RestartPolicy::flat());
        assert!(config.state_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = base_config();
        config.command = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.log_prefix = "../escape".to_string();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.restart_policy = RestartPolicy::with_backoff(BackoffConfig {
            min_delay_ms: 5_000,
            max_delay_ms: 1_000,
            factor: 2.0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delays_grow_and_cap() {
        let backoff = BackoffConfig {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_delays_are_whole_milliseconds() {
        let backoff = BackoffConfig {
            min_delay_ms: 150,
            max_delay_ms: 60_000,
            factor: 1.5,
        };
        for attempt in 1..=12 {
            let delay = backoff.delay_for(attempt);
            assert_eq!(delay.subsec_nanos() % 1_000_000, 0, "attempt {attempt}: {delay:?}");
        }
        assert_eq!(backoff.delay_for(2), Duration::from_millis(225));
    }

    #[test]
    fn test_flat_policy_never_delays() {
        let policy = RestartPolicy::flat();
        assert_eq!(policy.delay_after(0), None);
        assert_eq!(policy.delay_after(25), None);

        let policy = RestartPolicy::with_backoff(BackoffConfig::default());
        assert_eq!(policy.delay_after(0), None);
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "command": "start_server.sh",
            "workingDirectory": "/srv/app",
            "logDirectory": "/srv/app/logs",
            "restartPolicy": { "backoff": { "minDelayMs": 500 } }
        }"#;
        let config: SupervisorConfig = serde_json::from_str(json).unwrap();
        assert!(config.args.is_empty());
        assert_eq!(config.poll_interval_ms, 10_000);
        let backoff = config.restart_policy.backoff.unwrap();
        assert_eq!(backoff.min_delay_ms, 500);
        assert_eq!(backoff.max_delay_ms, 60_000);
    }
}
