//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::middleware::RejectionPolicy;
use crate::ratelimit::{validate_batch, OperationLimitSpec};

/// Environment variable prefix for configuration overrides, e.g.
/// `FLOODGATE__CONTROLLER__PRESSURE_THRESHOLD=0.9`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the admission layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Global adaptive controller configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Per-operation limits, in configuration order
    #[serde(default)]
    pub operations: Vec<OperationLimitSpec>,
}

/// Adaptive admission controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Whether the global tier is installed at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Width of the rolling statistics window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Number of buckets the window is split into
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,

    /// Pressure (fraction of CPU capacity) above which the ceiling is enforced
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,

    /// How often resource pressure is sampled, in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// How long the ceiling stays enforced after an overload rejection
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Weight kept from the previous pressure value on each sample
    #[serde(default = "default_pressure_decay")]
    pub pressure_decay: f64,

    /// What the controller is told when the per-operation tier rejects
    #[serde(default)]
    pub rejection_policy: RejectionPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_ms: default_window_ms(),
            bucket_count: default_bucket_count(),
            pressure_threshold: default_pressure_threshold(),
            sample_interval_ms: default_sample_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            pressure_decay: default_pressure_decay(),
            rejection_policy: RejectionPolicy::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_bucket_count() -> usize {
    100
}

fn default_pressure_threshold() -> f64 {
    0.8
}

fn default_sample_interval_ms() -> u64 {
    500
}

fn default_cooldown_ms() -> u64 {
    1_000
}

fn default_pressure_decay() -> f64 {
    0.95
}

impl ControllerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(FloodgateError::Config("bucket_count must be at least 1".to_string()));
        }
        if self.window_ms < self.bucket_count as u64 {
            return Err(FloodgateError::Config(format!(
                "window_ms ({}) must allow at least 1ms per bucket ({} buckets)",
                self.window_ms, self.bucket_count
            )));
        }
        if !(self.pressure_threshold > 0.0 && self.pressure_threshold <= 1.0) {
            return Err(FloodgateError::Config(format!(
                "pressure_threshold must be in (0, 1], got {}",
                self.pressure_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.pressure_decay) {
            return Err(FloodgateError::Config(format!(
                "pressure_decay must be in [0, 1), got {}",
                self.pressure_decay
            )));
        }
        if self.sample_interval_ms == 0 {
            return Err(FloodgateError::Config("sample_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

impl FloodgateConfig {
    /// Load configuration from a file, layering `FLOODGATE__*` environment
    /// overrides on top. The file format follows its extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: FloodgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        validate_batch(&self.operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
controller:
  window_ms: 5000
  bucket_count: 50
  pressure_threshold: 0.75
  rejection_policy: report_failure
operations:
  - operation: /helloworld.v1.Greeter/SayHello
    rate: 2000
    burst: 2000
    wait_timeout_ms: 3000
  - operation: /helloworld.v1.Greeter/SayGoodbye
    rate: 5.5
    burst: 1
"#;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.window(), Duration::from_secs(10));
        assert_eq!(config.bucket_count, 100);
        assert_eq!(config.pressure_threshold, 0.8);
        assert_eq!(config.rejection_policy, RejectionPolicy::Exclude);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = FloodgateConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.controller.window_ms, 5000);
        assert_eq!(config.controller.bucket_count, 50);
        assert_eq!(config.controller.sample_interval_ms, 500);
        assert_eq!(config.controller.rejection_policy, RejectionPolicy::ReportFailure);
        assert_eq!(config.operations.len(), 2);
        assert_eq!(config.operations[0].operation, "/helloworld.v1.Greeter/SayHello");
        assert_eq!(config.operations[1].wait_timeout(), Duration::ZERO);
        assert_eq!(config.operations[0].wait_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FloodgateConfig::from_yaml("{}").unwrap();
        assert!(config.operations.is_empty());
        assert_eq!(config.controller.window_ms, 10_000);
    }

    #[test]
    fn test_duplicate_operation_rejected() {
        let yaml = r#"
operations:
  - { operation: a, rate: 1, burst: 1 }
  - { operation: a, rate: 2, burst: 2 }
"#;
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::DuplicateOperation(_)));
    }

    #[test]
    fn test_invalid_controller_rejected() {
        let mut config = ControllerConfig::default();
        config.bucket_count = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.window_ms = 10;
        config.bucket_count = 100;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.pressure_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.pressure_decay = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("floodgate-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("floodgate.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = FloodgateConfig::load(&path).unwrap();
        assert_eq!(config.controller.bucket_count, 50);
        assert_eq!(config.operations.len(), 2);
        assert_eq!(config.operations[0].burst, 2000);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = std::env::temp_dir().join(format!("floodgate-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("floodgate.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        std::env::set_var("FLOODGATE__CONTROLLER__PRESSURE_THRESHOLD", "0.9");
        let loaded = FloodgateConfig::load(&path);
        std::env::remove_var("FLOODGATE__CONTROLLER__PRESSURE_THRESHOLD");
        std::fs::remove_dir_all(&dir).ok();

        let config = loaded.unwrap();
        assert_eq!(config.controller.pressure_threshold, 0.9);
        assert_eq!(config.controller.window_ms, 5000);
        assert_eq!(config.operations.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = FloodgateConfig::load("/nonexistent/floodgate.yaml").unwrap_err();
        assert!(matches!(err, FloodgateError::ConfigSource(_)));
    }
}
