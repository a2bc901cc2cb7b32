use crate::breaker::BreakerConfig;
use crate::health::HealthConfig;
use crate::load::LoadConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use warden_core::{WardenError, WardenResult};

/// Settings for the orchestration engine itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Default aggregation deadline for `submit_workflow`; none waits forever.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl OrchestratorConfig {
    /// Default deadline for `submit_workflow`, if any.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Reject a zero deadline.
    pub fn validate(&self) -> WardenResult<()> {
        if self.deadline_ms == Some(0) {
            return Err(WardenError::Config(
                "orchestrator.deadline_ms must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Full runtime configuration, one TOML table per component.
///
/// ```toml
/// [breaker]
/// failure_threshold = 3
///
/// [orchestrator]
/// deadline_ms = 30000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Circuit breaker settings, shared by every worker's breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Health monitor settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Load controller settings.
    #[serde(default)]
    pub load: LoadConfig,
    /// Workflow execution settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl WardenConfig {
    /// Parse and validate a TOML document. Missing tables and keys take defaults.
    pub fn from_toml_str(source: &str) -> WardenResult<Self> {
        let config: WardenConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Validate every section.
    pub fn validate(&self) -> WardenResult<()> {
        self.breaker.validate()?;
        self.health.validate()?;
        self.load.validate()?;
        self.orchestrator.validate()
    }

    /// Render as pretty-printed TOML.
    pub fn to_toml_string(&self) -> WardenResult<String> {
        toml::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))
    }
}
