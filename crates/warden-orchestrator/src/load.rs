use crate::table::KeyedTable;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use warden_core::{Clock, SystemClock, WardenError, WardenResult};

/// Kind of load sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Dispatch latency relative to `latency_reference_ms`.
    Latency,
    /// CPU utilisation fraction.
    Cpu,
    /// Memory utilisation fraction.
    Mem,
}

impl MetricType {
    /// Contribution of this metric to the weighted load.
    pub fn weight(self) -> f64 {
        match self {
            MetricType::Latency => 0.6,
            MetricType::Cpu => 0.3,
            MetricType::Mem => 0.1,
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricType::Latency => write!(f, "latency"),
            MetricType::Cpu => write!(f, "cpu"),
            MetricType::Mem => write!(f, "mem"),
        }
    }
}

/// Scale-out policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Samples kept per `(key, metric)` window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Weighted load above which scale-out is requested.
    #[serde(default = "default_scale_threshold")]
    pub scale_threshold: f64,
    /// Minimum interval between two scale decisions for the same key.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Dispatch latency that maps to a latency sample of `1.0`.
    #[serde(default = "default_latency_reference_ms")]
    pub latency_reference_ms: u64,
}

fn default_window_size() -> usize {
    10
}
fn default_scale_threshold() -> f64 {
    0.8
}
fn default_backoff_ms() -> u64 {
    60_000
}
fn default_latency_reference_ms() -> u64 {
    1_000
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            scale_threshold: default_scale_threshold(),
            backoff_ms: default_backoff_ms(),
            latency_reference_ms: default_latency_reference_ms(),
        }
    }
}

impl LoadConfig {
    /// Minimum time between two scale-out decisions for one key.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Normalise a dispatch latency against `latency_reference_ms`.
    pub fn normalize_latency(&self, latency: Duration) -> f64 {
        latency.as_secs_f64() * 1000.0 / self.latency_reference_ms.max(1) as f64
    }

    /// Reject empty windows, a zero latency reference and a non-finite threshold.
    pub fn validate(&self) -> WardenResult<()> {
        if self.window_size == 0 {
            return Err(WardenError::Config(
                "load.window_size must be at least 1".into(),
            ));
        }
        if self.latency_reference_ms == 0 {
            return Err(WardenError::Config(
                "load.latency_reference_ms must be greater than zero".into(),
            ));
        }
        if !self.scale_threshold.is_finite() {
            return Err(WardenError::Config(
                "load.scale_threshold must be a finite number".into(),
            ));
        }
        Ok(())
    }
}

/// One observation in a sliding window.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    /// Observed value.
    pub value: f64,
    /// When the value was observed.
    pub timestamp: Instant,
}

#[derive(Debug, Default)]
struct KeyLoad {
    windows: HashMap<MetricType, VecDeque<LoadSample>>,
    last_scale_event: Option<Instant>,
}

impl KeyLoad {
    fn average(&self, metric: MetricType) -> f64 {
        match self.windows.get(&metric) {
            Some(window) if !window.is_empty() => {
                window.iter().map(|s| s.value).sum::<f64>() / window.len() as f64
            }
            _ => 0.0,
        }
    }

    fn weighted(&self) -> f64 {
        [MetricType::Latency, MetricType::Cpu, MetricType::Mem]
            .into_iter()
            .map(|m| m.weight() * self.average(m))
            .sum()
    }
}

/// Sliding-window load scoring with anti-flapping scale decisions.
pub struct LoadController {
    config: LoadConfig,
    clock: Arc<dyn Clock>,
    keys: KeyedTable<KeyLoad>,
}

impl LoadController {
    /// Create a controller reading time from `clock`.
    pub fn new(config: LoadConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            keys: KeyedTable::new(),
        }
    }

    /// Controller with default configuration on the system clock.
    pub fn with_defaults() -> Self {
        Self::new(LoadConfig::default(), Arc::new(SystemClock))
    }

    /// Settings in effect.
    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn add_metric(&self, key: &str, value: f64, metric: MetricType) {
        let now = self.clock.now();
        let entry = self.keys.get_or_insert_with(key, KeyLoad::default);
        let mut load = entry.lock();
        let window = load.windows.entry(metric).or_default();
        window.push_back(LoadSample {
            value,
            timestamp: now,
        });
        while window.len() > self.config.window_size {
            window.pop_front();
        }
    }

    /// Mean of the samples currently in the `(key, metric)` window, 0 if empty.
    pub fn average(&self, key: &str, metric: MetricType) -> f64 {
        self.keys
            .get(key)
            .map(|entry| entry.lock().average(metric))
            .unwrap_or(0.0)
    }

    /// Samples currently in the window for `key`.
    pub fn sample_count(&self, key: &str, metric: MetricType) -> usize {
        self.keys
            .get(key)
            .and_then(|entry| entry.lock().windows.get(&metric).map(VecDeque::len))
            .unwrap_or(0)
    }

    /// `0.6 * latency + 0.3 * cpu + 0.1 * mem`, using window averages.
    pub fn calculate_weighted_load(&self, key: &str) -> f64 {
        self.keys
            .get(key)
            .map(|entry| entry.lock().weighted())
            .unwrap_or(0.0)
    }

    /// Decide whether `key` should scale out now.
    ///
    /// A positive decision stamps the key immediately, so no second positive
    /// decision can follow within `backoff_ms` regardless of load.
    pub fn should_scale(&self, key: &str) -> bool {
        let Some(entry) = self.keys.get(key) else {
            return false;
        };
        let now = self.clock.now();
        let mut load = entry.lock();

        let weighted = load.weighted();
        if weighted <= self.config.scale_threshold {
            return false;
        }

        if let Some(last) = load.last_scale_event {
            if now.saturating_duration_since(last) < self.config.backoff() {
                debug!(key = %key, load = weighted, "Scale-out suppressed by backoff");
                return false;
            }
        }

        load.last_scale_event = Some(now);
        info!(
            key = %key,
            load = weighted,
            threshold = self.config.scale_threshold,
            "Scale-out triggered"
        );
        true
    }

    /// Drop all windows for a key.
    pub fn remove(&self, key: &str) -> bool {
        self.keys.remove(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use warden_core::ManualClock;

    fn controller(window: usize) -> (LoadController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = LoadConfig {
            window_size: window,
            scale_threshold: 0.8,
            backoff_ms: 60_000,
            latency_reference_ms: 1_000,
        };
        (LoadController::new(config, clock.clone()), clock)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_window_evicts_oldest() {
        let (ctl, _) = controller(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            ctl.add_metric("w1", v, MetricType::Cpu);
        }
        assert_eq!(ctl.sample_count("w1", MetricType::Cpu), 3);
        assert!(approx(ctl.average("w1", MetricType::Cpu), 4.0));
    }

    #[test]
    fn test_weighted_load_formula() {
        let (ctl, _) = controller(10);
        ctl.add_metric("w1", 1.0, MetricType::Latency);
        ctl.add_metric("w1", 0.5, MetricType::Cpu);
        ctl.add_metric("w1", 0.2, MetricType::Mem);
        assert!(approx(ctl.calculate_weighted_load("w1"), 0.6 + 0.15 + 0.02));
    }

    #[test]
    fn test_missing_metrics_count_as_zero() {
        let (ctl, _) = controller(10);
        ctl.add_metric("w1", 2.0, MetricType::Latency);
        assert!(approx(ctl.calculate_weighted_load("w1"), 1.2));
        assert!(approx(ctl.calculate_weighted_load("unknown"), 0.0));
    }

    #[test]
    fn test_should_scale_above_threshold() {
        let (ctl, _) = controller(10);
        ctl.add_metric("w1", 0.5, MetricType::Latency);
        assert!(!ctl.should_scale("w1"));
        ctl.add_metric("w1", 3.5, MetricType::Latency);
        assert!(ctl.should_scale("w1"));
    }

    #[test]
    fn test_anti_flapping() {
        let (ctl, clock) = controller(10);
        ctl.add_metric("w1", 5.0, MetricType::Latency);
        assert!(ctl.should_scale("w1"));

        clock.advance(Duration::from_secs(59));
        ctl.add_metric("w1", 50.0, MetricType::Latency);
        assert!(!ctl.should_scale("w1"));

        clock.advance(Duration::from_secs(1));
        assert!(ctl.should_scale("w1"));
    }

    #[test]
    fn test_backoff_is_per_key() {
        let (ctl, _) = controller(10);
        ctl.add_metric("a", 5.0, MetricType::Latency);
        ctl.add_metric("b", 5.0, MetricType::Latency);
        assert!(ctl.should_scale("a"));
        assert!(ctl.should_scale("b"));
        assert!(!ctl.should_scale("a"));
    }

    #[test]
    fn test_normalize_latency() {
        let config = LoadConfig::default();
        assert!(approx(config.normalize_latency(Duration::from_millis(500)), 0.5));
        assert!(approx(config.normalize_latency(Duration::from_secs(2)), 2.0));
    }

    #[test]
    fn test_config_validation() {
        assert!(LoadConfig::default().validate().is_ok());
        let bad = LoadConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_remove_key() {
        let (ctl, _) = controller(10);
        ctl.add_metric("w1", 1.0, MetricType::Mem);
        assert!(ctl.remove("w1"));
        assert_eq!(ctl.sample_count("w1", MetricType::Mem), 0);
    }
}
