//! Worker liveness tracking and recovery decisions.
//!
//! Circuit breaking gates individual calls; the health monitor gates the
//! worker lifecycle. It keeps a decaying error count and a last-seen
//! timestamp per worker, flags workers that went silent or keep failing, and
//! picks a recovery action for the embedding application to carry out.

use crate::breaker::saturating_millis;
use crate::table::KeyedTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use warden_core::{Clock, SystemClock, WardenError, WardenResult};

/// Configuration for health monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Error count at which a worker is no longer considered alive.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    /// Silence, in milliseconds, after which a worker is considered timed out.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_errors() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl HealthConfig {
    /// Silence allowed before a worker is flagged.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject zero limits.
    pub fn validate(&self) -> WardenResult<()> {
        if self.max_errors == 0 {
            return Err(WardenError::Config(
                "health.max_errors must be at least 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(WardenError::Config(
                "health.timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Why a worker is (or is not) considered healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTag {
    /// Seen recently with few errors.
    Healthy,
    /// Not seen within the configured timeout.
    Timeout,
    /// Error count reached `max_errors`.
    ErrorThreshold,
}

/// Recovery actions for unhealthy workers. Deciding is side-effect free;
/// carrying the action out is the caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Restart the worker process (it went silent).
    RestartProcess,
    /// Re-initialize the worker in place.
    Reinitialize,
    /// Remove the worker permanently; no further retries.
    Apoptosis,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryAction::RestartProcess => write!(f, "restart_process"),
            RecoveryAction::Reinitialize => write!(f, "reinitialize"),
            RecoveryAction::Apoptosis => write!(f, "apoptosis"),
        }
    }
}

/// Health record for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Worker name.
    pub name: String,
    /// False once the worker is flagged as failed.
    pub is_alive: bool,
    /// Last time the worker reported.
    #[serde(skip)]
    pub last_seen: Instant,
    /// Decaying count of recent errors.
    pub error_count: u32,
    /// Latency of the last report, in milliseconds.
    pub latency_ms: f64,
    /// Reason for the current verdict.
    pub status: HealthTag,
}

/// Tracks liveness and error history for every observed worker.
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    statuses: KeyedTable<HealthStatus>,
}

impl HealthMonitor {
    /// Create a monitor reading time from `clock`.
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            statuses: KeyedTable::new(),
        }
    }

    /// Monitor with default configuration on the system clock.
    pub fn with_defaults() -> Self {
        Self::new(HealthConfig::default(), Arc::new(SystemClock))
    }

    /// Settings in effect.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record the completion of a dispatch to `name`.
    ///
    /// Errors increment the error count; successes decay it by one, so a
    /// worker that recovers drifts back to health.
    pub fn update_health(&self, name: &str, latency: Duration, error: bool) {
        let now = self.clock.now();
        let entry = self.statuses.get_or_insert_with(name, || HealthStatus {
            name: name.to_string(),
            is_alive: true,
            last_seen: now,
            error_count: 0,
            latency_ms: 0.0,
            status: HealthTag::Healthy,
        });
        let mut status = entry.lock();

        status.last_seen = now;
        status.latency_ms = latency.as_secs_f64() * 1000.0;
        if error {
            status.error_count = status.error_count.saturating_add(1);
        } else {
            status.error_count = status.error_count.saturating_sub(1);
        }
        status.is_alive = status.error_count < self.config.max_errors;
        status.status = if status.is_alive {
            HealthTag::Healthy
        } else {
            HealthTag::ErrorThreshold
        };

        debug!(
            worker = %name,
            error_count = status.error_count,
            latency_ms = status.latency_ms,
            alive = status.is_alive,
            "Health updated"
        );
    }

    /// Names of workers that timed out or crossed the error threshold.
    ///
    /// Failed workers are marked not alive with a tag naming the cause.
    pub fn detect_failures(&self) -> Vec<String> {
        let now = self.clock.now();
        let timeout = self.config.timeout();
        let mut failed = Vec::new();

        for (name, entry) in self.statuses.entries() {
            let mut status = entry.lock();
            let silent_for = now.saturating_duration_since(status.last_seen);

            let cause = if silent_for > timeout {
                Some(HealthTag::Timeout)
            } else if status.error_count >= self.config.max_errors {
                Some(HealthTag::ErrorThreshold)
            } else {
                None
            };

            if let Some(cause) = cause {
                status.is_alive = false;
                status.status = cause;
                warn!(
                    worker = %name,
                    cause = ?cause,
                    error_count = status.error_count,
                    silent_ms = saturating_millis(silent_for),
                    "Worker failure detected"
                );
                failed.push(name);
            }
        }

        failed
    }

    /// Pick the recovery action for a worker. `None` if it was never observed.
    pub fn get_recovery_action(&self, name: &str) -> Option<RecoveryAction> {
        let entry = self.statuses.get(name)?;
        let status = entry.lock();

        let action = if status.status == HealthTag::Timeout {
            RecoveryAction::RestartProcess
        } else if status.error_count > self.config.max_errors.saturating_mul(2) {
            RecoveryAction::Apoptosis
        } else {
            RecoveryAction::Reinitialize
        };
        Some(action)
    }

    /// Health record of `name`, if it was ever observed.
    pub fn get_status(&self, name: &str) -> Option<HealthStatus> {
        self.statuses.get(name).map(|entry| entry.lock().clone())
    }

    /// All health records, sorted by worker name.
    pub fn snapshot(&self) -> Vec<HealthStatus> {
        self.statuses
            .entries()
            .into_iter()
            .map(|(_, entry)| entry.lock().clone())
            .collect()
    }

    /// Forget a worker.
    pub fn remove(&self, name: &str) -> bool {
        self.statuses.remove(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use warden_core::ManualClock;

    fn monitor(max_errors: u32) -> (HealthMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = HealthConfig {
            max_errors,
            timeout_ms: 30_000,
        };
        (HealthMonitor::new(config, clock.clone()), clock)
    }

    const FAST: Duration = Duration::from_millis(12);

    #[test]
    fn test_lazy_creation() {
        let (mon, _) = monitor(3);
        assert!(mon.get_status("w1").is_none());
        mon.update_health("w1", FAST, false);
        let status = mon.get_status("w1").unwrap();
        assert!(status.is_alive);
        assert_eq!(status.error_count, 0);
        assert_eq!(status.status, HealthTag::Healthy);
        assert!((status.latency_ms - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors_cross_threshold() {
        let (mon, _) = monitor(3);
        mon.update_health("w1", FAST, true);
        mon.update_health("w1", FAST, true);
        assert!(mon.get_status("w1").unwrap().is_alive);
        mon.update_health("w1", FAST, true);
        let status = mon.get_status("w1").unwrap();
        assert!(!status.is_alive);
        assert_eq!(status.status, HealthTag::ErrorThreshold);
    }

    #[test]
    fn test_success_decays_errors() {
        let (mon, _) = monitor(3);
        mon.update_health("w1", FAST, true);
        mon.update_health("w1", FAST, true);
        mon.update_health("w1", FAST, false);
        assert_eq!(mon.get_status("w1").unwrap().error_count, 1);
        mon.update_health("w1", FAST, false);
        mon.update_health("w1", FAST, false);
        assert_eq!(mon.get_status("w1").unwrap().error_count, 0);
    }

    #[test]
    fn test_alternating_updates_stay_bounded() {
        let (mon, _) = monitor(3);
        for i in 0..1000 {
            mon.update_health("w1", FAST, i % 2 == 0);
            let count = mon.get_status("w1").unwrap().error_count;
            assert!(count <= 1, "error_count drifted to {count}");
        }
    }

    #[test]
    fn test_detect_timeout_failure() {
        let (mon, clock) = monitor(3);
        mon.update_health("quiet", FAST, false);
        mon.update_health("chatty", FAST, false);

        clock.advance(Duration::from_secs(31));
        mon.update_health("chatty", FAST, false);

        assert_eq!(mon.detect_failures(), vec!["quiet".to_string()]);
        let status = mon.get_status("quiet").unwrap();
        assert!(!status.is_alive);
        assert_eq!(status.status, HealthTag::Timeout);
        assert_eq!(
            mon.get_recovery_action("quiet"),
            Some(RecoveryAction::RestartProcess)
        );
    }

    #[test]
    fn test_detect_error_threshold_failure() {
        let (mon, _) = monitor(2);
        mon.update_health("w1", FAST, true);
        mon.update_health("w1", FAST, true);
        assert_eq!(mon.detect_failures(), vec!["w1".to_string()]);
        assert_eq!(
            mon.get_recovery_action("w1"),
            Some(RecoveryAction::Reinitialize)
        );
    }

    #[test]
    fn test_apoptosis_beyond_double_threshold() {
        let (mon, _) = monitor(2);
        for _ in 0..5 {
            mon.update_health("w1", FAST, true);
        }
        mon.detect_failures();
        assert_eq!(mon.get_recovery_action("w1"), Some(RecoveryAction::Apoptosis));
    }

    #[test]
    fn test_recovery_action_unknown_worker() {
        let (mon, _) = monitor(2);
        assert!(mon.get_recovery_action("ghost").is_none());
    }

    #[test]
    fn test_snapshot_and_remove() {
        let (mon, _) = monitor(2);
        mon.update_health("b", FAST, false);
        mon.update_health("a", FAST, false);
        let names: Vec<String> = mon.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert!(mon.remove("a"));
        assert_eq!(mon.snapshot().len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(HealthConfig::default().validate().is_ok());
        let bad = HealthConfig {
            max_errors: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_recovery_action_display() {
        assert_eq!(RecoveryAction::RestartProcess.to_string(), "restart_process");
        assert_eq!(RecoveryAction::Reinitialize.to_string(), "reinitialize");
        assert_eq!(RecoveryAction::Apoptosis.to_string(), "apoptosis");
    }
}
