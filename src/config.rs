//! # Module: config
//!
//! Tunable thresholds for outlier checks, anomaly detection, insight
//! generation and the engine's retry loop, loaded from TOML.
//!
//! ```toml
//! [outliers]
//! z_threshold = 2.5
//!
//! [insights]
//! default_timeout_ms = 30000
//! timeout_overrides = { "format-check" = 5000 }
//!
//! [engine]
//! max_update_retries = 8
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LearningError, Result};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Per-record outlier detection against the hook's recent executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Minimum records in the comparison window.
    pub min_window: usize,
    pub z_threshold: f64,
    /// A failure is an outlier when the window's success rate exceeds this.
    pub success_rate_threshold: f64,
    /// How many recent executions the engine loads for the comparison.
    pub window: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self { min_window: 5, z_threshold: 2.5, success_rate_threshold: 0.9, window: 50 }
    }
}

/// Metric anomaly detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub min_history: usize,
    pub z_threshold: f64,
    /// `error_rate` family samples above this are anomalous.
    pub error_rate_threshold: f64,
    /// `execution_time` family samples above `multiplier × p95(history)` are anomalous.
    pub execution_time_p95_multiplier: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_history: 10,
            z_threshold: 3.0,
            error_rate_threshold: 0.1,
            execution_time_p95_multiplier: 2.0,
        }
    }
}

/// Thresholds used when deriving insights from pattern and metric state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    pub default_timeout_ms: u64,
    /// Hook name → currently configured timeout.
    pub timeout_overrides: BTreeMap<String, u64>,
    pub min_samples_for_timeout: usize,
    /// Multiplier applied to p99 when recommending a timeout.
    pub timeout_headroom: f64,
    pub false_positive_threshold: f64,
    pub degradation_threshold_pct: f64,
    pub correlation_block_rate: f64,
    pub failure_alert_threshold: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            timeout_overrides: BTreeMap::new(),
            min_samples_for_timeout: 20,
            timeout_headroom: 1.5,
            false_positive_threshold: 0.1,
            degradation_threshold_pct: 20.0,
            correlation_block_rate: 0.3,
            failure_alert_threshold: 0.3,
        }
    }
}

impl InsightConfig {
    pub fn current_timeout_ms(&self, hook_name: &str) -> u64 {
        self.timeout_overrides.get(hook_name).copied().unwrap_or(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Optimistic read-modify-write attempts per pattern key before giving up.
    pub max_update_retries: u32,
    /// Samples loaded for metric rollups and anomaly history.
    pub metric_window: usize,
    pub recent_insights: usize,
    pub top_blocked: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_update_retries: 5, metric_window: 100, recent_insights: 10, top_blocked: 10 }
    }
}

// ---------------------------------------------------------------------------
// LearningConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub outliers: OutlierConfig,
    pub anomaly: AnomalyConfig,
    pub insights: InsightConfig,
    pub engine: EngineConfig,
}

impl LearningConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: LearningConfig =
            toml::from_str(s).map_err(|e| LearningError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg = Self::from_toml_str(&raw)?;
        tracing::debug!(
            target: "learning::config",
            path = %path.as_ref().display(),
            "loaded learning config"
        );
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LearningError::Config(e.to_string()))
    }

    /// Reject thresholds that would make the detectors meaningless.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let unit = |v: f64| (0.0..=1.0).contains(&v);

        if self.outliers.min_window == 0 {
            errors.push("outliers.min_window must be > 0".to_string());
        }
        if self.outliers.window < self.outliers.min_window {
            errors.push("outliers.window must be >= outliers.min_window".to_string());
        }
        if !(self.outliers.z_threshold > 0.0) {
            errors.push("outliers.z_threshold must be > 0".to_string());
        }
        if !unit(self.outliers.success_rate_threshold) {
            errors.push("outliers.success_rate_threshold must be in [0, 1]".to_string());
        }
        if self.anomaly.min_history < 2 {
            errors.push("anomaly.min_history must be >= 2".to_string());
        }
        if !(self.anomaly.z_threshold > 0.0) {
            errors.push("anomaly.z_threshold must be > 0".to_string());
        }
        if !unit(self.anomaly.error_rate_threshold) {
            errors.push("anomaly.error_rate_threshold must be in [0, 1]".to_string());
        }
        if !(self.anomaly.execution_time_p95_multiplier >= 1.0) {
            errors.push("anomaly.execution_time_p95_multiplier must be >= 1".to_string());
        }
        if !(self.insights.timeout_headroom >= 1.0) {
            errors.push("insights.timeout_headroom must be >= 1".to_string());
        }
        for (name, v) in [
            ("insights.false_positive_threshold", self.insights.false_positive_threshold),
            ("insights.correlation_block_rate", self.insights.correlation_block_rate),
            ("insights.failure_alert_threshold", self.insights.failure_alert_threshold),
        ] {
            if !unit(v) {
                errors.push(format!("{name} must be in [0, 1]"));
            }
        }
        if self.engine.max_update_retries == 0 {
            errors.push("engine.max_update_retries must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LearningError::Config(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(LearningConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let cfg = LearningConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, LearningConfig::default());
    }

    #[test]
    fn test_partial_section_override() {
        let cfg = LearningConfig::from_toml_str(
            "[anomaly]\nz_threshold = 4.0\n\n[insights]\ntimeout_overrides = { \"lint\" = 5000 }\n",
        )
        .unwrap();
        assert_eq!(cfg.anomaly.z_threshold, 4.0);
        assert_eq!(cfg.anomaly.min_history, 10);
        assert_eq!(cfg.insights.current_timeout_ms("lint"), 5000);
        assert_eq!(cfg.insights.current_timeout_ms("other"), 30_000);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = LearningConfig::from_toml_str("[outliers]\nsuccess_rate_threshold = 1.5\n")
            .unwrap_err();
        assert!(matches!(err, LearningError::Config(_)));
        assert!(err.to_string().contains("success_rate_threshold"));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = LearningConfig::from_toml_str("[engine\n").unwrap_err();
        assert!(matches!(err, LearningError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = LearningConfig::default();
        cfg.insights.timeout_overrides.insert("format-check".into(), 1200);
        let s = cfg.to_toml_string().unwrap();
        assert_eq!(LearningConfig::from_toml_str(&s).unwrap(), cfg);
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[engine]\nmax_update_retries = 9").unwrap();
        let cfg = LearningConfig::load(f.path()).unwrap();
        assert_eq!(cfg.engine.max_update_retries, 9);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = LearningConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, LearningError::Io(_)));
    }
}
