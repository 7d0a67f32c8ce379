//! # Stage: Metric Aggregator
//!
//! ## Responsibility
//! Turns bags of numeric samples into gauge / counter / histogram summaries,
//! merges previously computed summaries, and flags anomalous samples against
//! a metric's history.
//!
//! Anomaly detection combines a z-score test with two domain thresholds:
//!
//! 1. **Z-score**: `|x - mean| / std_dev` above `z_threshold` (default 3).
//!    When the history has no spread, any deviation from it is an outlier.
//! 2. **Error rate**: samples of the `error_rate` family above 0.1.
//! 3. **Execution time**: samples of the `execution_time` family above
//!    2 × the history's p95.
//!
//! ## Merge semantics
//! Merging is approximate by construction:
//! - gauges re-summarize the constituent means (not the raw samples),
//! - counters sum,
//! - histograms combine `count`/`sum`/`min`/`max` exactly, pool the
//!   population variance exactly, and average each percentile weighted by
//!   count. Merged percentiles are NOT the percentiles of the union.
//!
//! ## Guarantees
//! - Non-panicking: empty value sets summarize to `None` statistics
//! - Fail fast on programmer error: merging or aggregating nothing is an `Err`

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats;
use super::validation::ValidationReport;
use crate::config::AnomalyConfig;
use crate::error::{LearningError, Result};

/// Percentile ranks reported for histograms.
pub const PERCENTILE_RANKS: [f64; 5] = [50.0, 75.0, 90.0, 95.0, 99.0];

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Single(f64),
    Series(Vec<f64>),
}

impl MetricValue {
    pub fn as_slice(&self) -> &[f64] {
        match self {
            MetricValue::Single(v) => std::slice::from_ref(v),
            MetricValue::Series(v) => v,
        }
    }
}

/// One gauge, counter or histogram observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: MetricValue,
    pub unit: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: MetricValue, timestamp: DateTime<Utc>) -> Self {
        Self { name: name.into(), kind, value, unit: None, tags: BTreeMap::new(), timestamp }
    }

    pub fn gauge(name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(name, MetricKind::Gauge, MetricValue::Single(value), timestamp)
    }

    pub fn counter(name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(name, MetricKind::Counter, MetricValue::Single(value), timestamp)
    }

    pub fn histogram(name: impl Into<String>, values: Vec<f64>, timestamp: DateTime<Utc>) -> Self {
        Self::new(name, MetricKind::Histogram, MetricValue::Series(values), timestamp)
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn values(&self) -> &[f64] {
        self.value.as_slice()
    }

    /// Name prefix before the first `.` (`execution_time.lint` → `execution_time`).
    pub fn family(&self) -> &str {
        metric_family(&self.name)
    }

    pub fn validate(&self) -> ValidationReport {
        let mut r = ValidationReport::new();
        r.require(!self.name.trim().is_empty(), "metric name is required");
        r.require(self.values().iter().all(|v| v.is_finite()), "metric values must be finite");
        if self.kind == MetricKind::Counter {
            r.require(self.values().iter().all(|v| *v >= 0.0), "counter values must be >= 0");
        }
        if self.values().is_empty() {
            r.warn("metric sample carries no values");
        }
        r
    }
}

pub fn metric_family(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Descriptive statistics of one value set. Statistics are `None` when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Population standard deviation.
    pub std_dev: Option<f64>,
    pub percentiles: Option<Percentiles>,
}

/// Sort once, then compute count/sum/mean/std-dev and interpolated percentiles.
pub fn summarize(values: &[f64]) -> HistogramStats {
    let sorted = stats::sorted(values);
    let count = sorted.len() as u64;
    let sum: f64 = sorted.iter().sum();
    let pct = |rank: f64| stats::percentile_sorted(&sorted, rank);
    let percentiles = match (pct(50.0), pct(75.0), pct(90.0), pct(95.0), pct(99.0)) {
        (Some(p50), Some(p75), Some(p90), Some(p95), Some(p99)) => Some(Percentiles { p50, p75, p90, p95, p99 }),
        _ => None,
    };
    HistogramStats {
        count,
        sum,
        min: sorted.first().copied(),
        max: sorted.last().copied(),
        mean: stats::mean(&sorted),
        std_dev: stats::population_std_dev(&sorted),
        percentiles,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub name: String,
    pub kind: MetricKind,
    pub unit: Option<String>,
    pub stats: HistogramStats,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

impl MetricSummary {
    pub fn from_values(name: impl Into<String>, kind: MetricKind, values: &[f64]) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: None,
            stats: summarize(values),
            window_start: None,
            window_end: None,
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let mut r = ValidationReport::new();
        if self.kind == MetricKind::Counter {
            r.require(self.stats.sum >= 0.0, "counter sum must be >= 0");
        }
        if let (Some(min), Some(mean), Some(max)) = (self.stats.min, self.stats.mean, self.stats.max) {
            // tolerate rounding in the mean
            let eps = 1e-9 * max.abs().max(1.0);
            r.require(min <= mean + eps && mean <= max + eps, "expected min <= mean <= max");
        }
        r
    }
}

// ---------------------------------------------------------------------------
// Anomaly report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    InsufficientData,
    StatisticalOutlier,
    ErrorRateThreshold,
    ExecutionTimeThreshold,
}

impl std::fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnomalyReason::InsufficientData => "insufficient_data",
            AnomalyReason::StatisticalOutlier => "statistical_outlier",
            AnomalyReason::ErrorRateThreshold => "error_rate",
            AnomalyReason::ExecutionTimeThreshold => "execution_time",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub is_anomaly: bool,
    pub reasons: Vec<AnomalyReason>,
    /// `None` when the history has no spread or is too short.
    pub z_score: Option<f64>,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
}

impl AnomalyReport {
    /// The first (most significant) reason, if any.
    pub fn reason(&self) -> Option<AnomalyReason> {
        self.reasons.first().copied()
    }

    fn insufficient() -> Self {
        Self {
            is_anomaly: false,
            reasons: vec![AnomalyReason::InsufficientData],
            z_score: None,
            mean: None,
            std_dev: None,
        }
    }
}

// ---------------------------------------------------------------------------
// MetricAggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MetricAggregator {
    config: AnomalyConfig,
}

impl MetricAggregator {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Group `samples` by `(name, kind)` and summarize each group.
    ///
    /// Counters summarize the per-sample totals; gauges and histograms
    /// summarize every value. An empty slice is an `InvalidInput` error.
    pub fn aggregate(&self, samples: &[MetricSample]) -> Result<Vec<MetricSummary>> {
        if samples.is_empty() {
            return Err(LearningError::InvalidInput("cannot aggregate an empty metrics array".into()));
        }
        let mut groups: BTreeMap<(String, MetricKind), Vec<&MetricSample>> = BTreeMap::new();
        for s in samples {
            s.validate().into_result(format!("metric {}", s.name))?;
            groups.entry((s.name.clone(), s.kind)).or_default().push(s);
        }

        let out = groups
            .into_iter()
            .map(|((name, kind), group)| {
                let values: Vec<f64> = match kind {
                    MetricKind::Counter => group.iter().map(|s| s.values().iter().sum()).collect(),
                    _ => group.iter().flat_map(|s| s.values().iter().copied()).collect(),
                };
                MetricSummary {
                    unit: group.iter().find_map(|s| s.unit.clone()),
                    window_start: group.iter().map(|s| s.timestamp).min(),
                    window_end: group.iter().map(|s| s.timestamp).max(),
                    stats: summarize(&values),
                    name,
                    kind,
                }
            })
            .collect();
        Ok(out)
    }

    /// Merge summaries of the same metric. See the module docs for the
    /// approximations involved.
    pub fn merge(&self, summaries: &[MetricSummary]) -> Result<MetricSummary> {
        let first = summaries
            .first()
            .ok_or_else(|| LearningError::InvalidInput("cannot merge an empty summaries array".into()))?;
        if let Some(odd) = summaries.iter().find(|s| s.kind != first.kind || s.name != first.name) {
            return Err(LearningError::InvalidInput(format!(
                "cannot merge {} '{}' with {} '{}'",
                first.kind, first.name, odd.kind, odd.name
            )));
        }

        let stats = match first.kind {
            MetricKind::Gauge => {
                let means: Vec<f64> = summaries.iter().filter_map(|s| s.stats.mean).collect();
                summarize(&means)
            }
            MetricKind::Counter => merge_counters(summaries),
            MetricKind::Histogram => merge_histograms(summaries),
        };

        Ok(MetricSummary {
            name: first.name.clone(),
            kind: first.kind,
            unit: summaries.iter().find_map(|s| s.unit.clone()),
            stats,
            window_start: summaries.iter().filter_map(|s| s.window_start).min(),
            window_end: summaries.iter().filter_map(|s| s.window_end).max(),
        })
    }

    /// Test `sample` of metric `metric_name` against `history`.
    pub fn detect_anomaly(&self, metric_name: &str, sample: f64, history: &[f64]) -> AnomalyReport {
        if history.len() < self.config.min_history {
            return AnomalyReport::insufficient();
        }
        let mean = stats::mean(history);
        let std_dev = stats::population_std_dev(history);
        let mut reasons = Vec::new();
        let mut z_score = None;

        if let (Some(m), Some(sd)) = (mean, std_dev) {
            let deviation = (sample - m).abs();
            if sd > 1e-12 {
                let z = deviation / sd;
                z_score = Some(z);
                if z > self.config.z_threshold {
                    reasons.push(AnomalyReason::StatisticalOutlier);
                }
            } else if deviation > 1e-12 * m.abs().max(1.0) {
                reasons.push(AnomalyReason::StatisticalOutlier);
            }
        }

        match metric_family(metric_name) {
            "error_rate" if sample > self.config.error_rate_threshold => {
                reasons.push(AnomalyReason::ErrorRateThreshold);
            }
            "execution_time" => {
                if let Some(p95) = stats::percentile(history, 95.0) {
                    if sample > self.config.execution_time_p95_multiplier * p95 {
                        reasons.push(AnomalyReason::ExecutionTimeThreshold);
                    }
                }
            }
            _ => {}
        }

        AnomalyReport { is_anomaly: !reasons.is_empty(), reasons, z_score, mean, std_dev }
    }
}

fn merge_counters(summaries: &[MetricSummary]) -> HistogramStats {
    let count: u64 = summaries.iter().map(|s| s.stats.count).sum();
    let sum: f64 = summaries.iter().map(|s| s.stats.sum).sum();
    HistogramStats {
        count,
        sum,
        min: summaries.iter().filter_map(|s| s.stats.min).reduce(f64::min),
        max: summaries.iter().filter_map(|s| s.stats.max).reduce(f64::max),
        mean: (count > 0).then(|| sum / count as f64),
        std_dev: None,
        percentiles: None,
    }
}

fn merge_histograms(summaries: &[MetricSummary]) -> HistogramStats {
    let parts: Vec<&HistogramStats> = summaries.iter().map(|s| &s.stats).filter(|s| s.count > 0).collect();
    let count: u64 = parts.iter().map(|s| s.count).sum();
    let sum: f64 = parts.iter().map(|s| s.sum).sum();
    if count == 0 {
        return summarize(&[]);
    }
    let n = count as f64;
    let mean = sum / n;

    // pooled population variance: within-part spread plus spread of part means
    let variance: f64 = parts
        .iter()
        .map(|s| {
            let m = s.mean.unwrap_or(mean);
            let sd = s.std_dev.unwrap_or(0.0);
            s.count as f64 * (sd * sd + (m - mean) * (m - mean))
        })
        .sum::<f64>()
        / n;
    let std_dev = variance.max(0.0).sqrt();

    let weighted: Vec<(f64, &Percentiles)> =
        parts.iter().filter_map(|s| s.percentiles.as_ref().map(|p| (s.count as f64, p))).collect();
    let total_w: f64 = weighted.iter().map(|(w, _)| w).sum();
    let avg = |f: fn(&Percentiles) -> f64| weighted.iter().map(|(w, p)| w * f(p)).sum::<f64>() / total_w;
    let percentiles = (total_w > 0.0).then(|| Percentiles {
        p50: avg(|p| p.p50),
        p75: avg(|p| p.p75),
        p90: avg(|p| p.p90),
        p95: avg(|p| p.p95),
        p99: avg(|p| p.p99),
    });

    HistogramStats {
        count,
        sum,
        min: parts.iter().filter_map(|s| s.min).reduce(f64::min),
        max: parts.iter().filter_map(|s| s.max).reduce(f64::max),
        mean: Some(mean),
        std_dev: Some(std_dev),
        percentiles,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, min, 0).unwrap()
    }

    fn agg() -> MetricAggregator {
        MetricAggregator::default()
    }

    // ===== summarize =====

    #[test]
    fn test_summarize_empty_returns_nones() {
        let s = summarize(&[]);
        assert_eq!(s.count, 0);
        assert_eq!(s.sum, 0.0);
        assert!(s.mean.is_none() && s.min.is_none() && s.percentiles.is_none());
    }

    #[test]
    fn test_summarize_basic() {
        let s = summarize(&[5.0, 1.0, 3.0, 2.0, 4.0]);
        assert_eq!(s.count, 5);
        assert_eq!(s.sum, 15.0);
        assert_eq!(s.min, Some(1.0));
        assert_eq!(s.max, Some(5.0));
        assert_eq!(s.mean, Some(3.0));
        assert!((s.std_dev.unwrap() - 2.0f64.sqrt()).abs() < 1e-12);
        let p = s.percentiles.unwrap();
        assert_eq!(p.p50, 3.0);
        assert_eq!(p.p75, 4.0);
        assert!((p.p99 - 4.96).abs() < 1e-12);
    }

    // ===== samples =====

    #[test]
    fn test_metric_family() {
        assert_eq!(metric_family("execution_time.lint"), "execution_time");
        assert_eq!(metric_family("error_rate"), "error_rate");
    }

    #[test]
    fn test_negative_counter_invalid() {
        assert!(!MetricSample::counter("blocks", -1.0, ts(0)).validate().is_valid);
        assert!(MetricSample::gauge("temp", -1.0, ts(0)).validate().is_valid);
    }

    // ===== aggregate =====

    #[test]
    fn test_aggregate_empty_fails_fast() {
        assert!(matches!(agg().aggregate(&[]), Err(LearningError::InvalidInput(_))));
    }

    #[test]
    fn test_aggregate_groups_by_name_and_kind() {
        let samples = vec![
            MetricSample::counter("blocks", 2.0, ts(0)),
            MetricSample::counter("blocks", 3.0, ts(5)),
            MetricSample::histogram("execution_time.lint", vec![10.0, 20.0], ts(1)).with_unit("ms"),
            MetricSample::histogram("execution_time.lint", vec![30.0], ts(2)),
        ];
        let out = agg().aggregate(&samples).unwrap();
        assert_eq!(out.len(), 2);
        let blocks = out.iter().find(|s| s.name == "blocks").unwrap();
        assert_eq!(blocks.stats.sum, 5.0);
        assert_eq!(blocks.window_start, Some(ts(0)));
        assert_eq!(blocks.window_end, Some(ts(5)));
        let lat = out.iter().find(|s| s.name == "execution_time.lint").unwrap();
        assert_eq!(lat.stats.count, 3);
        assert_eq!(lat.stats.mean, Some(20.0));
        assert_eq!(lat.unit.as_deref(), Some("ms"));
    }

    #[test]
    fn test_aggregate_rejects_invalid_sample() {
        let samples = vec![MetricSample::counter("blocks", -5.0, ts(0))];
        assert!(matches!(agg().aggregate(&samples), Err(LearningError::Validation { .. })));
    }

    // ===== merge =====

    #[test]
    fn test_merge_empty_fails_fast() {
        assert!(matches!(agg().merge(&[]), Err(LearningError::InvalidInput(_))));
    }

    #[test]
    fn test_merge_mixed_kinds_rejected() {
        let a = MetricSummary::from_values("x", MetricKind::Gauge, &[1.0]);
        let b = MetricSummary::from_values("x", MetricKind::Counter, &[1.0]);
        assert!(agg().merge(&[a, b]).is_err());
    }

    #[test]
    fn test_merge_counters_sum() {
        let a = MetricSummary::from_values("blocks", MetricKind::Counter, &[1.0, 2.0]);
        let b = MetricSummary::from_values("blocks", MetricKind::Counter, &[4.0]);
        let m = agg().merge(&[a, b]).unwrap();
        assert_eq!(m.stats.sum, 7.0);
        assert_eq!(m.stats.count, 3);
    }

    #[test]
    fn test_merge_gauges_resummarizes_means() {
        let a = MetricSummary::from_values("queue", MetricKind::Gauge, &[1.0, 3.0]);
        let b = MetricSummary::from_values("queue", MetricKind::Gauge, &[10.0]);
        let m = agg().merge(&[a, b]).unwrap();
        // means 2 and 10 re-summarized; raw mean would be 14/3
        assert_eq!(m.stats.count, 2);
        assert_eq!(m.stats.mean, Some(6.0));
    }

    #[test]
    fn test_merge_histograms_exact_count_sum_and_std_dev() {
        let all = [1.0, 2.0, 3.0, 4.0, 10.0, 20.0];
        let a = MetricSummary::from_values("h", MetricKind::Histogram, &all[..4]);
        let b = MetricSummary::from_values("h", MetricKind::Histogram, &all[4..]);
        let m = agg().merge(&[a, b]).unwrap();
        let direct = summarize(&all);
        assert_eq!(m.stats.count, direct.count);
        assert!((m.stats.sum - direct.sum).abs() < 1e-9);
        assert!((m.stats.std_dev.unwrap() - direct.std_dev.unwrap()).abs() < 1e-9);
        assert_eq!(m.stats.min, Some(1.0));
        assert_eq!(m.stats.max, Some(20.0));
        assert!(m.stats.percentiles.is_some());
    }

    #[test]
    fn test_merge_histogram_skips_empty_parts() {
        let a = MetricSummary::from_values("h", MetricKind::Histogram, &[]);
        let b = MetricSummary::from_values("h", MetricKind::Histogram, &[2.0, 4.0]);
        let m = agg().merge(&[a, b]).unwrap();
        assert_eq!(m.stats.count, 2);
        assert_eq!(m.stats.percentiles.unwrap().p50, 3.0);
    }

    #[test]
    fn test_summary_validate() {
        let s = MetricSummary::from_values("h", MetricKind::Histogram, &[1.0, 2.0]);
        assert!(s.validate().is_valid);
        let mut bad = s.clone();
        bad.stats.mean = Some(9.0);
        assert!(!bad.validate().is_valid);
    }

    // ===== detect_anomaly =====

    #[test]
    fn test_anomaly_insufficient_data() {
        let r = agg().detect_anomaly("x", 5.0, &[1.0; 9]);
        assert!(!r.is_anomaly);
        assert_eq!(r.reason(), Some(AnomalyReason::InsufficientData));
    }

    #[test]
    fn test_anomaly_constant_history_spike() {
        let r = agg().detect_anomaly("x", 700.0, &[7.0; 10]);
        assert!(r.is_anomaly);
        assert_eq!(r.reason(), Some(AnomalyReason::StatisticalOutlier));
        assert_eq!(r.reason().unwrap().to_string(), "statistical_outlier");
    }

    #[test]
    fn test_anomaly_constant_history_same_value() {
        let r = agg().detect_anomaly("x", 7.0, &[7.0; 10]);
        assert!(!r.is_anomaly);
        assert!(r.reasons.is_empty());
    }

    #[test]
    fn test_anomaly_z_score() {
        let history: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 90.0 } else { 110.0 }).collect();
        let normal = agg().detect_anomaly("queue_depth", 115.0, &history);
        assert!(!normal.is_anomaly);
        assert!((normal.z_score.unwrap() - 1.5).abs() < 1e-12);
        let spike = agg().detect_anomaly("queue_depth", 200.0, &history);
        assert_eq!(spike.reasons, vec![AnomalyReason::StatisticalOutlier]);
    }

    #[test]
    fn test_anomaly_error_rate_threshold_without_z() {
        let history: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 0.05 } else { 0.15 }).collect();
        let r = agg().detect_anomaly("error_rate.lint", 0.14, &history);
        assert!(r.is_anomaly);
        assert_eq!(r.reasons, vec![AnomalyReason::ErrorRateThreshold]);
    }

    #[test]
    fn test_anomaly_execution_time_threshold_without_z() {
        // one slow run inflates the std-dev; p95 interpolates to 145
        let mut history = vec![0.0; 10];
        history.extend([100.0; 9]);
        history.push(1_000.0);
        let r = agg().detect_anomaly("execution_time.lint", 300.0, &history);
        assert!(r.z_score.unwrap() < 3.0);
        assert_eq!(r.reasons, vec![AnomalyReason::ExecutionTimeThreshold]);
    }
}
