//! Per-worker circuit breaking with jittered exponential backoff.
//!
//! A breaker has three states:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls are rejected until the backoff window elapses
//! - HalfOpen: recovery probes pass through; enough successes close the circuit

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use warden_core::{Clock, SystemClock, WardenError, WardenResult};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing, calls are rejected until the backoff elapses.
    Open,
    /// Probing recovery, calls pass through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configures when a breaker trips and how long it stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Backoff in milliseconds when the circuit first opens.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    /// Cap for the exponential backoff, in milliseconds.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Floor applied after jitter, in milliseconds.
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    /// Growth factor per failure beyond the threshold.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Uniform jitter applied to the backoff, as a fraction (0.1 = ±10%).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_base_timeout_ms() -> u64 {
    10_000
}
fn default_max_timeout_ms() -> u64 {
    120_000
}
fn default_min_timeout_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            base_timeout_ms: default_base_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            min_timeout_ms: default_min_timeout_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl BreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the base backoff.
    #[must_use]
    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Set the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Reject settings that would make the breaker never trip or never recover.
    pub fn validate(&self) -> WardenResult<()> {
        if self.failure_threshold == 0 {
            return Err(WardenError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(WardenError::Config(
                "breaker.success_threshold must be at least 1".into(),
            ));
        }
        if self.max_timeout_ms < self.base_timeout_ms {
            return Err(WardenError::Config(format!(
                "breaker.max_timeout_ms ({}) is below base_timeout_ms ({})",
                self.max_timeout_ms, self.base_timeout_ms
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(WardenError::Config(
                "breaker.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(WardenError::Config(
                "breaker.jitter_ratio must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

/// Un-jittered backoff for a given failure count:
/// `min(max, base * multiplier ^ max(0, failures - threshold))`.
pub fn backoff_timeout(config: &BreakerConfig, failure_count: u32) -> Duration {
    let exponent = failure_count.saturating_sub(config.failure_threshold).min(64);
    let base = config.base_timeout_ms as f64;
    let grown = base * config.backoff_multiplier.powi(exponent as i32);
    let capped = grown.min(config.max_timeout_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Perturb `base` by `ratio * draw` (draw in `[-1, 1]`) and apply the floor.
pub fn apply_jitter(base: Duration, ratio: f64, draw: f64, floor: Duration) -> Duration {
    let factor = 1.0 + ratio * draw.clamp(-1.0, 1.0);
    let jittered = Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0));
    jittered.max(floor)
}

/// Outcome of a call dispatched through a [`CircuitBreaker`].
#[derive(Debug)]
pub enum Dispatch<T> {
    /// The call ran and succeeded.
    Ok(T),
    /// The call was rejected without running.
    CircuitOpen {
        /// Time left before a recovery probe is admitted.
        remaining: Duration,
    },
    /// The call ran and failed.
    Failed(WardenError),
}

impl<T> Dispatch<T> {
    /// Whether the call ran and succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Dispatch::Ok(_))
    }

    /// Collapse into a `Result`, naming `worker` in the circuit error.
    pub fn into_result(self, worker: &str) -> WardenResult<T> {
        match self {
            Dispatch::Ok(value) => Ok(value),
            Dispatch::CircuitOpen { remaining } => Err(WardenError::CircuitOpen {
                worker: worker.to_string(),
                remaining,
            }),
            Dispatch::Failed(err) => Err(err),
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Worker the breaker guards.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted since the last reset.
    pub failure_count: u32,
    /// Successful probes in the current half-open window.
    pub success_count: u32,
    /// Remaining backoff while open.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    /// Jittered backoff drawn when the circuit last opened.
    open_timeout: Duration,
}

/// Circuit breaker guarding a single worker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `name`.
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                open_timeout: Duration::ZERO,
            }),
        }
    }

    /// Breaker with default configuration on the system clock.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default(), Arc::new(SystemClock))
    }

    /// Worker the breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings in effect.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without advancing OPEN to HALF_OPEN.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted since the last reset.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Successful probes in the current half-open window.
    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Jittered backoff for the current failure count.
    pub fn current_timeout(&self) -> Duration {
        let failures = self.inner.lock().failure_count;
        self.jittered_timeout(failures)
    }

    fn jittered_timeout(&self, failure_count: u32) -> Duration {
        let draw = if self.config.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        apply_jitter(
            backoff_timeout(&self.config, failure_count),
            self.config.jitter_ratio,
            draw,
            Duration::from_millis(self.config.min_timeout_ms),
        )
    }

    /// Remaining backoff while the circuit is open.
    pub fn remaining_open(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        self.remaining_locked(&inner)
    }

    fn remaining_locked(&self, inner: &BreakerState) -> Option<Duration> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner
            .last_failure_time
            .map(|t| self.clock.now().saturating_duration_since(t))
            .unwrap_or_default();
        Some(inner.open_timeout.saturating_sub(elapsed))
    }

    /// Gate a call: `Ok(())` admits it, `Err(remaining)` rejects it.
    ///
    /// An open circuit whose backoff has elapsed moves to half-open here.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let now = self.clock.now();
        let elapsed = inner
            .last_failure_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();

        if elapsed > inner.open_timeout {
            info!(name = %self.name, "Circuit breaker entering half-open state");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            Ok(())
        } else {
            Err(inner.open_timeout - elapsed)
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                debug!(
                    name = %self.name,
                    successes = inner.success_count,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success in half-open state"
                );
                if inner.success_count >= self.config.success_threshold {
                    info!(name = %self.name, "Circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Open => {
                debug!(name = %self.name, "Ignoring late success while circuit is open");
            }
        }
    }

    /// Record a failed call. Returns `true` if this failure opened the circuit.
    pub fn on_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                debug!(
                    name = %self.name,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                warn!(
                    name = %self.name,
                    "Circuit breaker failure in half-open state, reopening"
                );
                self.trip(&mut inner);
                true
            }
            CircuitState::Open => {
                inner.last_failure_time = Some(self.clock.now());
                false
            }
        }
    }

    fn trip(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.last_failure_time = Some(self.clock.now());
        inner.open_timeout = self.jittered_timeout(inner.failure_count);
        info!(
            name = %self.name,
            failures = inner.failure_count,
            backoff_ms = saturating_millis(inner.open_timeout),
            "Circuit breaker opened"
        );
    }

    /// Run `f` through the breaker, recording its outcome.
    pub async fn call<T, F, Fut>(&self, f: F) -> Dispatch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        if let Err(remaining) = self.try_acquire() {
            return Dispatch::CircuitOpen { remaining };
        }
        match f().await {
            Ok(value) => {
                self.on_success();
                Dispatch::Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Dispatch::Failed(err)
            }
        }
    }

    /// Blocking counterpart of [`CircuitBreaker::call`].
    pub fn call_sync<T>(&self, f: impl FnOnce() -> WardenResult<T>) -> Dispatch<T> {
        if let Err(remaining) = self.try_acquire() {
            return Dispatch::CircuitOpen { remaining };
        }
        match f() {
            Ok(value) => {
                self.on_success();
                Dispatch::Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Dispatch::Failed(err)
            }
        }
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_after_ms: self
                .remaining_locked(&inner)
                .map(saturating_millis),
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(name = %self.name, "Circuit breaker reset");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.open_timeout = Duration::ZERO;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use warden_core::ManualClock;

    fn fixed_config(threshold: u32) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_base_timeout(Duration::from_secs(10))
            .with_max_timeout(Duration::from_secs(120))
            .with_jitter_ratio(0.0)
    }

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cb = CircuitBreaker::new("w1", fixed_config(threshold), clock.clone());
        (cb, clock)
    }

    #[test]
    fn test_config_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.max_timeout_ms, 120_000);
        assert_eq!(config.min_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default()
            .with_failure_threshold(0)
            .validate()
            .is_err());
        assert!(BreakerConfig::default()
            .with_jitter_ratio(1.5)
            .validate()
            .is_err());
        let inverted = BreakerConfig::default()
            .with_base_timeout(Duration::from_secs(300))
            .with_max_timeout(Duration::from_secs(60));
        assert!(inverted.validate().is_err());
        let shrinking = BreakerConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_initial_state() {
        let (cb, _) = breaker(3);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire().is_ok());
        assert!(cb.remaining_open().is_none());
    }

    #[test]
    fn test_opens_after_threshold() {
        let (cb, _) = breaker(3);
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.on_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.on_failure());
        let remaining = cb.try_acquire().unwrap_err();
        assert_eq!(remaining, Duration::from_secs(10));
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let (cb, _) = breaker(3);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        assert_eq!(cb.failure_count(), 0);
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_to_half_open_after_timeout() {
        let (cb, clock) = breaker(2);
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Exactly at the timeout the circuit is still open.
        clock.advance(Duration::from_secs(10));
        assert_eq!(cb.try_acquire(), Err(Duration::ZERO));

        clock.advance(Duration::from_millis(1));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn test_half_open_closes_after_two_successes() {
        let (cb, clock) = breaker(2);
        cb.on_failure();
        cb.on_failure();
        clock.advance(Duration::from_secs(11));
        cb.try_acquire().unwrap();

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_longer_backoff() {
        let (cb, clock) = breaker(2);
        cb.on_failure();
        cb.on_failure();
        clock.advance(Duration::from_secs(11));
        cb.try_acquire().unwrap();

        assert!(cb.on_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
        // One failure beyond the threshold doubles the backoff.
        assert_eq!(cb.remaining_open(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let config = fixed_config(3);
        let mut previous = Duration::ZERO;
        for failures in 0..40 {
            let timeout = backoff_timeout(&config, failures);
            assert!(timeout >= previous, "backoff decreased at {failures}");
            assert!(timeout <= Duration::from_secs(120));
            previous = timeout;
        }
        assert_eq!(backoff_timeout(&config, 3), Duration::from_secs(10));
        assert_eq!(backoff_timeout(&config, 5), Duration::from_secs(40));
        assert_eq!(backoff_timeout(&config, 39), Duration::from_secs(120));
    }

    #[test]
    fn test_oversized_timeouts_saturate() {
        let config = BreakerConfig::default()
            .with_base_timeout(Duration::MAX)
            .with_max_timeout(Duration::from_millis(1500));
        assert_eq!(config.base_timeout_ms, u64::MAX);
        assert_eq!(config.max_timeout_ms, 1500);
        assert_eq!(saturating_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_jitter_bounds_and_floor() {
        let base = Duration::from_secs(100);
        let floor = Duration::from_secs(5);
        let high = apply_jitter(base, 0.1, 1.0, floor).as_secs_f64();
        let low = apply_jitter(base, 0.1, -1.0, floor).as_secs_f64();
        assert!((high - 110.0).abs() < 1e-6, "got {high}");
        assert!((low - 90.0).abs() < 1e-6, "got {low}");
        assert_eq!(
            apply_jitter(Duration::from_secs(1), 0.1, 0.0, floor),
            Duration::from_secs(5)
        );

        let cb = CircuitBreaker::new(
            "jittery",
            BreakerConfig::default().with_failure_threshold(1),
            Arc::new(ManualClock::new()),
        );
        for _ in 0..200 {
            let t = cb.current_timeout();
            assert!(t >= Duration::from_secs(9) && t <= Duration::from_secs(11));
        }
    }

    #[tokio::test]
    async fn test_call_scenario() {
        let (cb, clock) = breaker(3);
        for _ in 0..3 {
            let d: Dispatch<()> = cb.call(|| async { Err(WardenError::worker("boom")) }).await;
            assert!(matches!(d, Dispatch::Failed(_)));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(rejected, Dispatch::CircuitOpen { .. }));
        let err = rejected.into_result("w1").unwrap_err();
        assert!(err.is_circuit_open());

        clock.advance(Duration::from_secs(11));
        assert!(cb.call(|| async { Ok(1) }).await.is_ok());
        assert!(cb.call(|| async { Ok(2) }).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_call_sync_propagates_original_error() {
        let (cb, _) = breaker(3);
        let d: Dispatch<u32> = cb.call_sync(|| Err(WardenError::worker("disk full")));
        match d {
            Dispatch::Failed(err) => assert_eq!(err.to_string(), "Worker error: disk full"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let (cb, clock) = breaker(1);
        cb.on_failure();
        clock.advance(Duration::from_secs(4));
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.retry_after_ms, Some(6_000));

        cb.reset();
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.retry_after_ms, None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
