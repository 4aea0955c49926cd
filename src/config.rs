use crate::distance::DEFAULT_REFERENCE_POWER_DBM;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Calibrated signal strength at 1 meter (dBm), used when a sample carries none
    pub reference_power_dbm: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            reference_power_dbm: DEFAULT_REFERENCE_POWER_DBM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Records not seen for longer than this are evicted
    pub max_age_ms: u64,
    /// Background sweep period, defaults to half of `max_age_ms`
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            max_age_ms: 5000,
            sweep_interval_ms: None,
            smoothing: SmoothingConfig::default(),
        }
    }
}

impl TableConfig {
    pub fn sweep_interval(&self) -> Duration {
        let ms = self.sweep_interval_ms.unwrap_or(self.max_age_ms / 2).max(1);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Off means latest-sample-wins
    pub enabled: bool,
    /// Weight of the newest reading, in (0, 1]
    pub alpha: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        SmoothingConfig {
            enabled: false,
            alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Publish when the anchor changes or its distance moves past the threshold
    #[default]
    OnChange,
    /// Publish after every table mutation
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    pub policy: PublishPolicy,
    pub min_distance_delta_m: f64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        PublishConfig {
            policy: PublishPolicy::OnChange,
            min_distance_delta_m: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of the async broadcast feed
    pub feed_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig { feed_capacity: 64 }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let reference = self.estimator.reference_power_dbm;
        if !reference.is_finite() || reference == 0.0 {
            anyhow::bail!("estimator.reference_power_dbm must be a non-zero finite dBm value");
        }
        if self.table.max_age_ms == 0 {
            anyhow::bail!("table.max_age_ms must be positive");
        }
        if self.table.sweep_interval_ms == Some(0) {
            anyhow::bail!("table.sweep_interval_ms must be positive");
        }
        let alpha = self.table.smoothing.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            anyhow::bail!("table.smoothing.alpha must be in (0, 1], got {}", alpha);
        }
        let delta = self.publish.min_distance_delta_m;
        if !delta.is_finite() || delta < 0.0 {
            anyhow::bail!("publish.min_distance_delta_m must be a non-negative number");
        }
        if self.bus.feed_capacity == 0 {
            anyhow::bail!("bus.feed_capacity must be positive");
        }
        Ok(())
    }
}
