//! # Stage: Insight Analysis
//!
//! ## Responsibility
//! Turn pattern snapshots, metric windows and recent executions into
//! pending [`Insight`]s. Every detector is a pure function of its inputs and
//! the [`InsightConfig`] thresholds; nothing here touches storage.
//!
//! ## Guarantees
//! - Every emitted insight passes [`Insight::validate`]
//! - Deterministic: same inputs and `now` give the same insight payloads
//!   (ids are fresh uuids)
//!
//! ## NOT Responsible For
//! - Deduplicating against insights already stored (the engine)
//! - Applying anything

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::execution::ExecutionRecord;
use super::insight::{Insight, InsightKind, InsightPriority};
use super::pattern::{PatternModel, PatternType};
use super::stats;
use crate::config::InsightConfig;

/// Minimum recommended timeout.
pub const MIN_TIMEOUT_MS: u64 = 100;

/// A recommended timeout must differ from the current one by more than this
/// fraction to be worth an insight.
pub const TIMEOUT_CHANGE_THRESHOLD: f64 = 0.2;

/// Observations a pattern needs before its false-positive rate is trusted.
pub const MIN_REFINEMENT_SAMPLES: u64 = 10;

/// Points a window needs before it is split into older/recent halves.
pub const MIN_TREND_WINDOW: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct InsightAnalyzer {
    config: InsightConfig,
}

impl InsightAnalyzer {
    pub fn new(config: InsightConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    /// `ceil(p99 × headroom)` against the hook's configured timeout.
    pub fn timeout_optimization(&self, hook_name: &str, durations_ms: &[f64], now: DateTime<Utc>) -> Option<Insight> {
        if durations_ms.len() < self.config.min_samples_for_timeout {
            return None;
        }
        let p99 = stats::percentile(durations_ms, 99.0)?;
        let recommended = ((p99 * self.config.timeout_headroom).ceil() as u64).max(MIN_TIMEOUT_MS);
        let current = self.config.current_timeout_ms(hook_name);
        if current == 0 {
            return None;
        }
        let change = (recommended as f64 - current as f64).abs() / current as f64;
        if change <= TIMEOUT_CHANGE_THRESHOLD {
            return None;
        }
        // A timeout below the observed tail kills healthy runs.
        let priority = if recommended > current { InsightPriority::High } else { InsightPriority::Medium };
        let confidence = (0.5 + durations_ms.len() as f64 / 200.0).min(0.95);
        Some(
            Insight::new(InsightKind::timeout(current, recommended), confidence, priority, change.min(1.0), now)
                .for_hook(hook_name),
        )
    }

    /// One refinement per well-sampled pattern whose false-positive rate is
    /// above the threshold.
    pub fn pattern_refinements(&self, patterns: &[PatternModel], now: DateTime<Utc>) -> Vec<Insight> {
        patterns
            .iter()
            .filter(|m| m.total_count >= MIN_REFINEMENT_SAMPLES)
            .filter(|m| m.false_positive_rate() > self.config.false_positive_threshold)
            .map(|m| {
                let fp = m.false_positive_rate();
                let refinement = format!(
                    "narrow {} '{}': {:.0}% of matches were false positives",
                    m.key.pattern_type,
                    m.key.pattern_key,
                    fp * 100.0
                );
                let priority = if fp > 0.3 { InsightPriority::High } else { InsightPriority::Medium };
                Insight::new(
                    InsightKind::refinement(m.key.to_string(), refinement, fp),
                    m.confidence_at(now),
                    priority,
                    fp,
                    now,
                )
                .for_hook(m.key.hook_name.clone())
            })
            .collect()
    }

    /// `values` oldest first. Compares the mean of the recent half with the
    /// older half.
    pub fn performance_degradation(&self, metric_name: &str, values: &[f64], now: DateTime<Utc>) -> Option<Insight> {
        if values.len() < MIN_TREND_WINDOW {
            return None;
        }
        let (older, recent) = values.split_at(values.len() / 2);
        let baseline = stats::mean(older)?;
        let current = stats::mean(recent)?;
        if baseline <= 0.0 {
            return None;
        }
        let pct = (current - baseline) / baseline * 100.0;
        if pct <= self.config.degradation_threshold_pct {
            return None;
        }
        let priority = if pct > 50.0 { InsightPriority::High } else { InsightPriority::Medium };
        let confidence = 0.5 + 0.4 * (values.len() as f64 / 100.0).min(1.0);
        let mut insight = Insight::new(
            InsightKind::degradation(metric_name, baseline, current),
            confidence,
            priority,
            (pct / 100.0).min(1.0),
            now,
        );
        if let Some((_, hook)) = metric_name.split_once('.') {
            insight = insight.for_hook(hook);
        }
        Some(insight)
    }

    /// Patterns with the same type and key that block above the threshold in
    /// at least two hooks. Strength is the mean pairwise similarity.
    pub fn cross_hook_correlations(&self, patterns: &[PatternModel], now: DateTime<Utc>) -> Vec<Insight> {
        let mut groups: BTreeMap<(PatternType, &str), Vec<&PatternModel>> = BTreeMap::new();
        for m in patterns.iter().filter(|m| m.total_count > 0 && m.block_rate() > self.config.correlation_block_rate) {
            groups.entry((m.key.pattern_type, m.key.pattern_key.as_str())).or_default().push(m);
        }

        let mut out = Vec::new();
        for ((pattern_type, pattern_key), members) in groups {
            let mut hooks: Vec<String> = members.iter().map(|m| m.key.hook_name.clone()).collect();
            hooks.sort();
            hooks.dedup();
            if hooks.len() < 2 {
                continue;
            }

            let mut pairs = 0usize;
            let mut total = 0.0;
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    total += a.similarity(b);
                    pairs += 1;
                }
            }
            let strength = if pairs == 0 { 0.0 } else { total / pairs as f64 };
            let confidence = members.iter().map(|m| m.confidence_at(now)).sum::<f64>() / members.len() as f64;
            let priority = if strength > 0.7 { InsightPriority::Medium } else { InsightPriority::Low };

            out.push(Insight::new(
                InsightKind::correlation(hooks, strength, vec![format!("{pattern_type}:{pattern_key}")]),
                confidence,
                priority,
                0.5 * strength,
                now,
            ));
        }
        out
    }

    /// `recent` oldest first. Fires when the recent half fails more often
    /// than the threshold and more often than the older half.
    pub fn predictive_alert(&self, hook_name: &str, recent: &[ExecutionRecord], now: DateTime<Utc>) -> Option<Insight> {
        if recent.len() < MIN_TREND_WINDOW {
            return None;
        }
        let failure_rate = |rs: &[ExecutionRecord]| rs.iter().filter(|r| !r.success).count() as f64 / rs.len() as f64;
        let (older, newer) = recent.split_at(recent.len() / 2);
        let (before, after) = (failure_rate(older), failure_rate(newer));
        if after <= self.config.failure_alert_threshold || after <= before {
            return None;
        }
        let priority = if after > 0.5 { InsightPriority::Critical } else { InsightPriority::High };
        let confidence = 0.4 + 0.5 * (recent.len() as f64 / 50.0).min(1.0);
        Some(
            Insight::new(
                InsightKind::alert(after, "24h", format!("review recent failures of {hook_name}")),
                confidence,
                priority,
                after - before,
                now,
            )
            .for_hook(hook_name),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::execution::{FileContext, HookIdentity};
    use crate::learning::pattern::FeedbackKind;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn record(hook: &str, ms: f64, success: bool, blocked: bool, i: i64) -> ExecutionRecord {
        ExecutionRecord::new(HookIdentity::new(hook, "lint", 10), ms, success, t0() + Duration::seconds(i))
            .with_blocked(blocked)
            .with_file(FileContext::from_path("src/app.js"))
    }

    fn js_model(hook: &str, n: usize, blocked_every: usize) -> PatternModel {
        let first = record(hook, 50.0, true, false, 0);
        let data = first.extract_features()[1].clone();
        let mut model = PatternModel::for_record(&first, data);
        for i in 0..n {
            let blocked = blocked_every > 0 && i % blocked_every == 0;
            model = model.updated(&record(hook, 50.0, !blocked, blocked, i as i64)).model;
        }
        model
    }

    // ===== timeout =====

    #[test]
    fn test_timeout_needs_min_samples() {
        let a = InsightAnalyzer::default();
        assert!(a.timeout_optimization("lint", &[100.0; 5], t0()).is_none());
    }

    #[test]
    fn test_timeout_recommends_p99_with_headroom() {
        let a = InsightAnalyzer::default();
        let durations: Vec<f64> = (1..=100).map(|i| i as f64 * 10.0).collect();
        let insight = a.timeout_optimization("lint", &durations, t0()).unwrap();
        // p99 of 10..=1000 step 10 is 990.1, × 1.5 = 1485.15
        assert_eq!(insight.kind, InsightKind::timeout(30_000, 1486));
        assert_eq!(insight.hook_name.as_deref(), Some("lint"));
        assert!(insight.validate().is_valid);
    }

    #[test]
    fn test_timeout_floor_and_no_change() {
        let mut cfg = InsightConfig::default();
        cfg.timeout_overrides.insert("fast".into(), 110);
        let a = InsightAnalyzer::new(cfg);
        // p99 ≈ 1ms would recommend 2ms; the floor of 100 is within 20% of 110
        assert!(a.timeout_optimization("fast", &[1.0; 30], t0()).is_none());
    }

    // ===== refinement =====

    #[test]
    fn test_refinement_for_noisy_pattern() {
        let mut m = js_model("lint", 20, 0);
        for _ in 0..6 {
            m = m.with_feedback(FeedbackKind::FalsePositive, t0());
        }
        let out = InsightAnalyzer::default().pattern_refinements(&[m], t0());
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            InsightKind::PatternRefinement { false_positive_rate, pattern_id, .. } => {
                assert_eq!(*false_positive_rate, Some(0.3));
                assert_eq!(pattern_id.as_deref(), Some("lint/file_extension/js"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_refinement_skips_thin_patterns() {
        let mut m = js_model("lint", 5, 0);
        m = m.with_feedback(FeedbackKind::FalsePositive, t0());
        assert!(InsightAnalyzer::default().pattern_refinements(&[m], t0()).is_empty());
    }

    // ===== degradation =====

    #[test]
    fn test_degradation_detected() {
        let mut values = vec![100.0; 10];
        values.extend(vec![150.0; 10]);
        let insight = InsightAnalyzer::default()
            .performance_degradation("execution_time.lint", &values, t0())
            .unwrap();
        assert_eq!(insight.hook_name.as_deref(), Some("lint"));
        assert!(matches!(
            insight.kind,
            InsightKind::PerformanceDegradation { degradation_pct: Some(p), .. } if (p - 50.0).abs() < 1e-9
        ));
    }

    #[test]
    fn test_degradation_ignores_improvement() {
        let mut values = vec![150.0; 10];
        values.extend(vec![100.0; 10]);
        assert!(InsightAnalyzer::default().performance_degradation("execution_time.lint", &values, t0()).is_none());
    }

    // ===== correlation =====

    #[test]
    fn test_correlation_across_hooks() {
        let a = js_model("lint", 10, 2);
        let b = js_model("format-check", 10, 2);
        let out = InsightAnalyzer::default().cross_hook_correlations(&[a, b], t0());
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            InsightKind::CrossHookCorrelation { hooks, strength, shared_patterns } => {
                assert_eq!(hooks, &vec!["format-check".to_string(), "lint".to_string()]);
                // identical stats, different hooks: 0.5 + 0.2 + 0.2
                assert!((strength.unwrap() - 0.9).abs() < 1e-9);
                assert_eq!(shared_patterns, &vec!["file_extension:js".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out[0].validate().is_valid);
    }

    #[test]
    fn test_correlation_single_hook_ignored() {
        let a = js_model("lint", 10, 2);
        assert!(InsightAnalyzer::default().cross_hook_correlations(&[a], t0()).is_empty());
    }

    // ===== predictive alert =====

    #[test]
    fn test_alert_on_rising_failures() {
        let recent: Vec<ExecutionRecord> = (0..20)
            .map(|i| record("lint", 50.0, i < 10 || i % 2 == 0, false, i))
            .collect();
        let insight = InsightAnalyzer::default().predictive_alert("lint", &recent, t0()).unwrap();
        assert!(matches!(insight.kind, InsightKind::PredictiveAlert { probability: Some(p), .. } if (p - 0.5).abs() < 1e-9));
        assert_eq!(insight.priority, InsightPriority::High);
    }

    #[test]
    fn test_no_alert_when_failures_flat() {
        let recent: Vec<ExecutionRecord> = (0..20).map(|i| record("lint", 50.0, i % 2 == 0, false, i)).collect();
        assert!(InsightAnalyzer::default().predictive_alert("lint", &recent, t0()).is_none());
    }
}
