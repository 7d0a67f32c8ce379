//! # Stage: Learning Engine
//!
//! ## Responsibility
//! Coordinate one ingestion pass per execution record and every insight
//! transition against a [`PersistenceGateway`]:
//!
//! ```text
//! ingest(record)
//!   validate ─► outlier check vs recent window
//!   ─► for each extracted feature: load ─► updated() ─► upsert(expected version)
//!        (skipped when the model already folded record.id; retry on
//!         VersionConflict, bounded by engine.max_update_retries)
//!   ─► anomaly check vs execution_time.<hook> history ─► insert metric
//!   ─► insert execution
//! ```
//!
//! ## Guarantees
//! - Per-key atomicity: a pattern snapshot is only written over the version
//!   it was derived from, so concurrent ingestions never lose an update
//! - Compare-and-set transitions: an insight is only written back over the
//!   revision it was loaded at, including writes that keep its status
//!   (ratings, repeat validations)
//! - Errors leave stored insights unchanged
//! - Retryable ingestion: a record whose ingest failed can be ingested again
//!   without double-counting the patterns that already folded it; the
//!   execution row is written last
//!
//! ## NOT Responsible For
//! - Cross-key transactions (each feature is updated independently, so
//!   patterns may lead the execution table after a failed ingest)
//! - Scheduling `expire_insights` or `generate_insights`

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregator::{AnomalyReport, MetricAggregator, MetricSample, MetricSummary};
use super::analysis::InsightAnalyzer;
use super::execution::{ExecutionRecord, OutlierReason};
use super::insight::{Insight, InsightKind, InsightStatus, ValidationOutcome};
use super::pattern::{FeedbackKind, PatternKey, PatternModel, PatternUpdate};
use super::report::LearningReport;
use super::storage::PersistenceGateway;
use super::validation::IntegrityWarning;
use crate::config::LearningConfig;
use crate::error::{LearningError, Result};

/// Insights scanned when deduplicating or expiring.
pub const INSIGHT_SCAN_LIMIT: usize = 1_000;

/// Metric name carrying per-execution durations for `hook_name`.
pub fn execution_time_metric(hook_name: &str) -> String {
    format!("execution_time.{hook_name}")
}

/// Outcome of one [`LearningEngine::ingest`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub record_id: String,
    pub outlier: Option<OutlierReason>,
    pub patterns_updated: usize,
    /// Features whose model already held this record.
    pub patterns_skipped: usize,
    /// Version conflicts retried across all features.
    pub retries: u32,
    pub validation_warnings: Vec<String>,
    pub integrity_warnings: Vec<IntegrityWarning>,
    pub anomaly: AnomalyReport,
}

pub struct LearningEngine<G: PersistenceGateway> {
    gateway: G,
    config: LearningConfig,
    aggregator: MetricAggregator,
    analyzer: InsightAnalyzer,
}

impl<G: PersistenceGateway> std::fmt::Debug for LearningEngine<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<G: PersistenceGateway> LearningEngine<G> {
    pub fn new(gateway: G, config: LearningConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(gateway, config))
    }

    /// Engine over the default configuration, which always validates.
    pub fn with_defaults(gateway: G) -> Self {
        Self::assemble(gateway, LearningConfig::default())
    }

    fn assemble(gateway: G, config: LearningConfig) -> Self {
        Self {
            aggregator: MetricAggregator::new(config.anomaly.clone()),
            analyzer: InsightAnalyzer::new(config.insights.clone()),
            gateway,
            config,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    pub fn ingest(&self, record: &ExecutionRecord) -> Result<IngestReport> {
        let validation_warnings = record.validate().into_result(format!("execution {}", record.id))?;
        let hook = record.hook.name.as_str();

        let recent = self.gateway.query_recent_executions(hook, self.config.outliers.window)?;
        let outlier = record.outlier_reason(&recent, &self.config.outliers);
        if let Some(reason) = &outlier {
            tracing::info!(target: "learning::engine", hook, record = %record.id, ?reason, "outlier execution");
        }

        let mut retries = 0;
        let mut patterns_updated = 0;
        let mut patterns_skipped = 0;
        let mut integrity_warnings = Vec::new();
        for data in record.extract_features() {
            let key = PatternKey::for_data(hook, &data);
            let (update, attempts) = self.update_pattern(&key, |current| match current {
                Some(model) if model.has_folded(&record.id) => Ok(None),
                current => {
                    let base = current.unwrap_or_else(|| PatternModel::new(key.clone(), data.clone(), record.timestamp));
                    Ok(Some(base.updated(record)))
                }
            })?;
            retries += attempts;
            match update {
                Some(update) => {
                    patterns_updated += 1;
                    integrity_warnings.extend(update.warnings);
                }
                None => patterns_skipped += 1,
            }
        }
        if patterns_skipped > 0 {
            tracing::info!(target: "learning::engine", hook, record = %record.id, patterns_skipped, "record already folded into some patterns");
        }

        let metric = execution_time_metric(hook);
        let history: Vec<f64> = self
            .gateway
            .query_recent_metrics(&metric, self.config.engine.metric_window)?
            .iter()
            .flat_map(|s| s.values().iter().copied())
            .collect();
        let anomaly = self.aggregator.detect_anomaly(&metric, record.duration_ms, &history);
        if anomaly.is_anomaly {
            tracing::warn!(
                target: "learning::engine",
                hook,
                duration_ms = record.duration_ms,
                reasons = ?anomaly.reasons,
                "execution time anomaly"
            );
        }
        self.gateway
            .insert_metric(&MetricSample::gauge(metric, record.duration_ms, record.timestamp).with_unit("ms"))?;
        self.gateway.insert_execution(record)?;

        tracing::debug!(
            target: "learning::engine",
            hook,
            patterns = patterns_updated,
            retries,
            "ingested execution"
        );
        Ok(IngestReport {
            record_id: record.id.clone(),
            outlier,
            patterns_updated,
            patterns_skipped,
            retries,
            validation_warnings,
            integrity_warnings,
            anomaly,
        })
    }

    /// Apply feedback to one stored pattern.
    pub fn record_pattern_feedback(
        &self,
        key: &PatternKey,
        kind: FeedbackKind,
        at: DateTime<Utc>,
    ) -> Result<PatternModel> {
        let (update, _) = self.update_pattern(key, |current| {
            let model = current.ok_or_else(|| LearningError::not_found("pattern", key.to_string()))?;
            Ok(Some(PatternUpdate { model: model.with_feedback(kind, at), warnings: Vec::new() }))
        })?;
        update
            .map(|u| u.model)
            .ok_or_else(|| LearningError::not_found("pattern", key.to_string()))
    }

    /// Optimistic read-modify-write of one pattern key. `step` returning
    /// `None` leaves the key unwritten. Returns the written update and the
    /// number of conflicts retried.
    fn update_pattern<F>(&self, key: &PatternKey, mut step: F) -> Result<(Option<PatternUpdate>, u32)>
    where
        F: FnMut(Option<PatternModel>) -> Result<Option<PatternUpdate>>,
    {
        let max = self.config.engine.max_update_retries;
        for attempt in 0..max {
            let (current, version) = match self.gateway.load_pattern(key)? {
                Some(v) => (Some(v.value), Some(v.version)),
                None => (None, None),
            };
            let Some(update) = step(current)? else {
                return Ok((None, attempt));
            };
            match self.gateway.upsert_pattern(&update.model, version) {
                Ok(_) => return Ok((Some(update), attempt)),
                Err(e) if e.is_version_conflict() => {
                    tracing::debug!(target: "learning::engine", key = %key, attempt, "pattern update conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(target: "learning::engine", key = %key, retries = max, "pattern update gave up");
        Err(LearningError::VersionConflict { key: key.to_string() })
    }

    // -----------------------------------------------------------------------
    // Insights
    // -----------------------------------------------------------------------

    /// Run every detector for `hook_name` and store the insights that do not
    /// duplicate a live (pending, applied or validated) one.
    pub fn generate_insights(&self, hook_name: &str, now: DateTime<Utc>) -> Result<Vec<Insight>> {
        let metric = execution_time_metric(hook_name);
        let durations: Vec<f64> = self
            .gateway
            .query_recent_metrics(&metric, self.config.engine.metric_window)?
            .iter()
            .flat_map(|s| s.values().iter().copied())
            .collect();
        let patterns = self.gateway.query_patterns_by_hook(hook_name)?;
        let recent = self.gateway.query_recent_executions(hook_name, self.config.outliers.window)?;

        let mut all_patterns = Vec::new();
        for hook in self.gateway.list_hooks()? {
            all_patterns.extend(self.gateway.query_patterns_by_hook(&hook)?);
        }

        let mut candidates = Vec::new();
        candidates.extend(self.analyzer.timeout_optimization(hook_name, &durations, now));
        candidates.extend(self.analyzer.pattern_refinements(&patterns, now));
        candidates.extend(self.analyzer.performance_degradation(&metric, &durations, now));
        candidates.extend(
            self.analyzer
                .cross_hook_correlations(&all_patterns, now)
                .into_iter()
                .filter(|i| matches!(&i.kind, InsightKind::CrossHookCorrelation { hooks, .. } if hooks.iter().any(|h| h == hook_name))),
        );
        candidates.extend(self.analyzer.predictive_alert(hook_name, &recent, now));

        let mut live: BTreeSet<String> = self
            .gateway
            .query_insights(INSIGHT_SCAN_LIMIT)?
            .iter()
            .filter(|i| matches!(i.status, InsightStatus::Pending) || i.status.is_active())
            .map(dedup_key)
            .collect();

        let mut stored = Vec::new();
        for insight in candidates {
            if !live.insert(dedup_key(&insight)) {
                continue;
            }
            self.gateway.insert_insight(&insight)?;
            tracing::info!(
                target: "learning::engine",
                hook = hook_name,
                id = %insight.id,
                kind = insight.kind.type_name(),
                confidence = insight.confidence,
                "insight generated"
            );
            stored.push(insight);
        }
        Ok(stored)
    }

    pub fn apply_insight(&self, id: &str, now: DateTime<Utc>) -> Result<Insight> {
        self.transition(id, "apply", |i| i.apply(now).map(|_| ()))
    }

    pub fn rollback_insight(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<Insight> {
        self.transition(id, "rollback", |i| i.rollback(reason, now).map(|_| ()))
    }

    pub fn validate_insight(&self, id: &str, outcome: ValidationOutcome) -> Result<Insight> {
        self.transition(id, "validate", |i| i.add_validation_result(outcome))
    }

    pub fn rate_insight(&self, id: &str, rating: u8, comment: Option<String>, at: DateTime<Utc>) -> Result<Insight> {
        self.transition(id, "rate", |i| i.add_user_feedback(rating, comment, at))
    }

    /// Expire every pending insight due at `now`. Returns the expired ids.
    /// Insights moved by another writer in the meantime are skipped.
    pub fn expire_insights(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        for insight in self.gateway.query_insights(INSIGHT_SCAN_LIMIT)? {
            if !insight.should_expire(now) {
                continue;
            }
            match self.transition(&insight.id, "expire", |i| i.expire(now)) {
                Ok(i) => expired.push(i.id),
                Err(e) if e.is_version_conflict() => {
                    tracing::debug!(target: "learning::engine", id = %insight.id, "insight changed before expiry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    fn transition<F>(&self, id: &str, operation: &'static str, f: F) -> Result<Insight>
    where
        F: FnOnce(&mut Insight) -> Result<()>,
    {
        let mut insight = self
            .gateway
            .load_insight(id)?
            .ok_or_else(|| LearningError::not_found("insight", id))?;
        let expected = insight.status;
        f(&mut insight)?;
        insight.revision = self.gateway.update_insight(&insight)?;
        tracing::info!(
            target: "learning::engine",
            id,
            operation,
            from = %expected,
            to = %insight.status,
            "insight transition"
        );
        Ok(insight)
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    /// One summary per kind recorded under `name` over the metric window.
    pub fn summarize_metric(&self, name: &str) -> Result<Vec<MetricSummary>> {
        let samples = self.gateway.query_recent_metrics(name, self.config.engine.metric_window)?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        self.aggregator.aggregate(&samples)
    }

    pub fn stale_patterns(&self, hook_name: &str, now: DateTime<Utc>) -> Result<Vec<PatternModel>> {
        Ok(self
            .gateway
            .query_patterns_by_hook(hook_name)?
            .into_iter()
            .filter(|m| m.is_stale_at(now))
            .collect())
    }

    pub fn export_report(&self, now: DateTime<Utc>) -> Result<LearningReport> {
        let mut by_hook = Vec::new();
        for hook in self.gateway.list_hooks()? {
            let patterns = self.gateway.query_patterns_by_hook(&hook)?;
            by_hook.push((hook, patterns));
        }
        let insights = self.gateway.query_insights(self.config.engine.recent_insights)?;
        Ok(LearningReport::build(&by_hook, &insights, now, self.config.engine.top_blocked))
    }
}

/// Identity used to avoid storing the same recommendation twice.
fn dedup_key(insight: &Insight) -> String {
    let subject = match &insight.kind {
        InsightKind::PatternRefinement { pattern_id, .. } => pattern_id.clone().unwrap_or_default(),
        InsightKind::PerformanceDegradation { metric, .. } => metric.clone().unwrap_or_default(),
        InsightKind::CrossHookCorrelation { hooks, shared_patterns, .. } => {
            format!("{}|{}", hooks.join(","), shared_patterns.join(","))
        }
        InsightKind::TimeoutOptimization { .. } | InsightKind::PredictiveAlert { .. } => String::new(),
    };
    format!(
        "{}|{}|{}",
        insight.hook_name.as_deref().unwrap_or(""),
        insight.kind.type_name(),
        subject
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
