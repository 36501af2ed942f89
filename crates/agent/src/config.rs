//! Agent configuration

use anyhow::{Context, Result};
use meshwatch_lib::{flow::MAX_WINDOW_SECS, AggregatorConfig, DetectorConfig};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "MESHWATCH_CONFIG";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Cluster name attached to structured log records
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// API server port for health, metrics and read-out
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Detection tick interval in seconds
    #[serde(default = "default_detection_interval")]
    pub detection_interval_secs: u64,

    /// Per-producer ingest channel capacity
    #[serde(default = "default_ingest_channel_size")]
    pub ingest_channel_size: usize,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub detector: DetectorConfig,
}

fn default_cluster_name() -> String {
    std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "default".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_detection_interval() -> u64 {
    10
}

fn default_ingest_channel_size() -> usize {
    1024
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            api_port: default_api_port(),
            detection_interval_secs: default_detection_interval(),
            ingest_channel_size: default_ingest_channel_size(),
            aggregator: AggregatorConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional config file, then environment
    ///
    /// Environment variables use the `MESHWATCH_` prefix with `__` between
    /// nested keys, e.g. `MESHWATCH_DETECTOR__SPIKE_THRESHOLD=4.0`.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("MESHWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to build configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.detection_interval_secs == 0 {
            anyhow::bail!("detection_interval_secs must be greater than zero");
        }
        let window_secs = self.aggregator.window_secs;
        if window_secs == 0 || window_secs > MAX_WINDOW_SECS {
            anyhow::bail!(
                "aggregator.window_secs must be within 1..={}, got {}",
                MAX_WINDOW_SECS,
                window_secs
            );
        }
        if !(0.0..=1.0).contains(&self.aggregator.rate_smoothing) {
            anyhow::bail!(
                "aggregator.rate_smoothing must be within 0..=1, got {}",
                self.aggregator.rate_smoothing
            );
        }
        Ok(())
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.detection_interval_secs)
    }
}
