//! Service configuration
//!
//! Loaded from `config.toml` in the data directory. Every section falls back to its
//! defaults, so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::Policy;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub anonymizer: AnonymizerConfig,
    pub window: WindowConfig,
    pub engine: Policy,
    pub aggregator: AggregatorConfig,
    pub session: SessionConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizerConfig {
    /// Granularity interaction timestamps are floored to
    pub bucket_minutes: u32,
    /// How long a salt lives before fingerprints become unlinkable
    pub salt_rotation_hours: u32,
    /// Interactions stamped further than this from server time are rejected
    pub max_clock_skew_hours: u32,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: 15,
            salt_rotation_hours: 24,
            max_clock_skew_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Ring buffer capacity per fingerprint
    pub max_interactions: usize,
    /// Entries older than this (relative to the newest) are evicted
    pub max_span_minutes: u32,
    /// Below this count a summary is flagged low confidence
    pub min_interactions: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_interactions: 20,
            max_span_minutes: 30,
            min_interactions: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Length of an aggregation window
    pub window_minutes: u32,
    /// k-anonymity floor: distinct contributors required before release
    pub min_group_size: usize,
    /// Total privacy budget per release, split across the released statistics
    pub epsilon: f64,
    /// Truncation bound for the noise added to the mean severity
    pub noise_bound: f64,
    pub histogram_bins: usize,
    /// Times a suppressed bucket may roll into the next window before being dropped
    pub max_carry_windows: u32,
    /// Noised mean severity at or above which a report is surfaced as an alert
    pub alert_severity: f64,
    /// Published reports kept for the analytics endpoints
    pub report_retention: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            min_group_size: 20,
            epsilon: 3.0,
            noise_bound: 0.15,
            histogram_bins: 5,
            max_carry_windows: 4,
            alert_severity: 0.5,
            report_retention: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions without traffic for this long are closed by the reaper
    pub idle_timeout_secs: u64,
    /// Closed-session markers older than this are forgotten
    pub tombstone_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            tombstone_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Period of the flush/reap ticker
    pub flush_interval_secs: u64,
    pub incident_capacity: usize,
    /// Audit entries queued ahead of the writer before new ones are dropped
    pub audit_queue_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            incident_capacity: 256,
            audit_queue_capacity: crate::audit::AUDIT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        let body = toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        let content = format!("# Ananya configuration\n\n{}", body);
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Reject settings that would silently weaken the privacy guarantees
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregator;
        if !(agg.epsilon.is_finite() && agg.epsilon > 0.0) {
            return Err(Error::InvalidConfig("aggregator.epsilon must be > 0".to_string()));
        }
        if !(agg.noise_bound.is_finite() && agg.noise_bound > 0.0) {
            return Err(Error::InvalidConfig("aggregator.noise_bound must be > 0".to_string()));
        }
        if agg.min_group_size < 2 {
            return Err(Error::InvalidConfig(
                "aggregator.min_group_size must be at least 2".to_string(),
            ));
        }
        if agg.histogram_bins == 0 {
            return Err(Error::InvalidConfig("aggregator.histogram_bins must be > 0".to_string()));
        }
        if agg.window_minutes == 0 {
            return Err(Error::InvalidConfig("aggregator.window_minutes must be > 0".to_string()));
        }
        let anon = &self.anonymizer;
        if anon.bucket_minutes == 0 || anon.salt_rotation_hours == 0 || anon.max_clock_skew_hours == 0 {
            return Err(Error::InvalidConfig(
                "anonymizer bucket, rotation and skew periods must be > 0".to_string(),
            ));
        }
        if self.window.max_interactions == 0 {
            return Err(Error::InvalidConfig("window.max_interactions must be > 0".to_string()));
        }
        // A window the extractor calls sufficient must also satisfy the engine
        if self.window.min_interactions < self.engine.min_samples {
            return Err(Error::InvalidConfig(format!(
                "window.min_interactions ({}) must be at least engine.min_samples ({})",
                self.window.min_interactions, self.engine.min_samples
            )));
        }
        self.engine.validate()
    }
}

/// Data directory: `$ANANYA_DIR`, then `./.ananya` if present, then `~/.ananya`
pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("ANANYA_DIR") {
        return Ok(PathBuf::from(dir));
    }

    let cwd = std::env::current_dir()?;
    let project_dir = cwd.join(".ananya");
    if project_dir.exists() {
        return Ok(project_dir);
    }

    let home = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".ananya"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregator.min_group_size, 20);
        assert_eq!(config.anonymizer.bucket_minutes, 15);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [aggregator]
            min_group_size = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.aggregator.min_group_size, 5);
        assert_eq!(config.aggregator.epsilon, 3.0);
        assert_eq!(config.window.max_interactions, 20);
    }

    #[test]
    fn test_rejects_non_positive_epsilon() {
        let mut config = Config::default();
        config.aggregator.epsilon = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.aggregator.epsilon = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_trivial_group_size() {
        let mut config = Config::default();
        config.aggregator.min_group_size = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_window_minimum_below_engine_minimum() {
        let mut config = Config::default();
        config.window.min_interactions = 2;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.engine.min_samples = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.window.max_interactions = 7;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Config::default());
    }
}
