//! # Stage: Insights
//!
//! ## Responsibility
//! A recommendation derived from pattern or metric analysis, together with
//! its lifecycle:
//!
//! ```text
//! pending --apply()--> applied --add_validation_result()--> validated
//! applied | validated --rollback(reason)--> rolled_back
//! pending --expire() when should_expire()--> expired
//! ```
//!
//! `apply()` stamps a deterministic, variant-specific list of
//! [`AutomaticAction`]s; `rollback()` produces the mirror image of that list
//! with every action tagged `rollback_<type>`.
//!
//! ## Guarantees
//! - Apply-once: an insight is applied at most once; failed transitions leave
//!   the insight untouched
//! - Closed variant set: payload validation is exhaustive over [`InsightKind`]
//! - Passive expiry: `should_expire()` is a pure predicate; scheduling belongs
//!   to the caller
//!
//! ## NOT Responsible For
//! - Executing the actions against a live hook runner
//! - Atomicity across processes (the engine's compare-and-set via the gateway)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::validation::ValidationReport;
use crate::error::{LearningError, Result};

/// Pending insights older than this expire.
pub const INSIGHT_MAX_AGE_DAYS: i64 = 30;

/// Pending insights below this confidence expire.
pub const MIN_INSIGHT_CONFIDENCE: f64 = 0.1;

// ---------------------------------------------------------------------------
// Status / priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    Pending,
    Applied,
    Validated,
    RolledBack,
    Expired,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::Pending => "pending",
            InsightStatus::Applied => "applied",
            InsightStatus::Validated => "validated",
            InsightStatus::RolledBack => "rolled_back",
            InsightStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            InsightStatus::Pending,
            InsightStatus::Applied,
            InsightStatus::Validated,
            InsightStatus::RolledBack,
            InsightStatus::Expired,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
    }

    /// Applied or validated: the actions are live.
    pub fn is_active(&self) -> bool {
        matches!(self, InsightStatus::Applied | InsightStatus::Validated)
    }
}

impl std::fmt::Display for InsightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightPriority {
    Low,
    Medium,
    High,
    Critical,
}

// ---------------------------------------------------------------------------
// InsightKind: closed variant set
// ---------------------------------------------------------------------------

/// Variant-specific payload. Fields are optional so an insight can exist in
/// an invalid state until [`Insight::validate`] is called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InsightKind {
    TimeoutOptimization {
        current: Option<u64>,
        recommended: Option<u64>,
    },
    PatternRefinement {
        pattern_id: Option<String>,
        refinement: Option<String>,
        false_positive_rate: Option<f64>,
    },
    PerformanceDegradation {
        metric: Option<String>,
        degradation_pct: Option<f64>,
        baseline: Option<f64>,
        current: Option<f64>,
    },
    CrossHookCorrelation {
        hooks: Vec<String>,
        strength: Option<f64>,
        shared_patterns: Vec<String>,
    },
    PredictiveAlert {
        probability: Option<f64>,
        timeframe: Option<String>,
        preventive_action: Option<String>,
    },
}

fn unit_range(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl InsightKind {
    pub fn timeout(current: u64, recommended: u64) -> Self {
        InsightKind::TimeoutOptimization { current: Some(current), recommended: Some(recommended) }
    }

    pub fn refinement(pattern_id: impl Into<String>, refinement: impl Into<String>, false_positive_rate: f64) -> Self {
        InsightKind::PatternRefinement {
            pattern_id: Some(pattern_id.into()),
            refinement: Some(refinement.into()),
            false_positive_rate: Some(false_positive_rate),
        }
    }

    pub fn degradation(metric: impl Into<String>, baseline: f64, current: f64) -> Self {
        let degradation_pct = if baseline.abs() > f64::EPSILON {
            (current - baseline) / baseline.abs() * 100.0
        } else {
            0.0
        };
        InsightKind::PerformanceDegradation {
            metric: Some(metric.into()),
            degradation_pct: Some(degradation_pct),
            baseline: Some(baseline),
            current: Some(current),
        }
    }

    pub fn correlation(hooks: Vec<String>, strength: f64, shared_patterns: Vec<String>) -> Self {
        InsightKind::CrossHookCorrelation { hooks, strength: Some(strength), shared_patterns }
    }

    pub fn alert(probability: f64, timeframe: impl Into<String>, preventive_action: impl Into<String>) -> Self {
        InsightKind::PredictiveAlert {
            probability: Some(probability),
            timeframe: Some(timeframe.into()),
            preventive_action: Some(preventive_action.into()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            InsightKind::TimeoutOptimization { .. } => "timeout_optimization",
            InsightKind::PatternRefinement { .. } => "pattern_refinement",
            InsightKind::PerformanceDegradation { .. } => "performance_degradation",
            InsightKind::CrossHookCorrelation { .. } => "cross_hook_correlation",
            InsightKind::PredictiveAlert { .. } => "predictive_alert",
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let mut r = ValidationReport::new();
        match self {
            InsightKind::TimeoutOptimization { current, recommended } => {
                r.require(current.is_some(), "timeout_optimization requires 'current'");
                r.require(recommended.is_some(), "timeout_optimization requires 'recommended'");
                if let Some(0) = recommended {
                    r.error("recommended timeout must be > 0");
                }
                if current.is_some() && current == recommended {
                    r.warn("recommended timeout equals the current one");
                }
            }
            InsightKind::PatternRefinement { pattern_id, refinement, false_positive_rate } => {
                r.require(pattern_id.is_some(), "pattern_refinement requires 'pattern_id'");
                r.require(refinement.is_some(), "pattern_refinement requires 'refinement'");
                match false_positive_rate {
                    None => r.error("pattern_refinement requires 'false_positive_rate'"),
                    Some(v) => r.require(unit_range(*v), "false_positive_rate must be in [0, 1]"),
                }
            }
            InsightKind::PerformanceDegradation { metric, degradation_pct, baseline, current } => {
                r.require(metric.is_some(), "performance_degradation requires 'metric'");
                r.require(degradation_pct.is_some(), "performance_degradation requires 'degradation_pct'");
                r.require(baseline.is_some(), "performance_degradation requires 'baseline'");
                r.require(current.is_some(), "performance_degradation requires 'current'");
            }
            InsightKind::CrossHookCorrelation { hooks, strength, shared_patterns } => {
                r.require(hooks.len() >= 2, "cross_hook_correlation requires at least 2 hooks");
                match strength {
                    None => r.error("cross_hook_correlation requires 'strength'"),
                    Some(v) => r.require(unit_range(*v), "strength must be in [0, 1]"),
                }
                if shared_patterns.is_empty() {
                    r.warn("cross_hook_correlation lists no shared patterns");
                }
            }
            InsightKind::PredictiveAlert { probability, timeframe, preventive_action } => {
                match probability {
                    None => r.error("predictive_alert requires 'probability'"),
                    Some(v) => r.require(unit_range(*v), "probability must be in [0, 1]"),
                }
                r.require(timeframe.is_some(), "predictive_alert requires 'timeframe'");
                r.require(preventive_action.is_some(), "predictive_alert requires 'preventive_action'");
            }
        }
        r
    }

    /// Actions stamped by `apply()`. Only meaningful on a valid payload.
    fn actions(&self, at: DateTime<Utc>) -> Vec<AutomaticAction> {
        let act = |kind: ActionKind, target: String| AutomaticAction {
            kind,
            rollback: false,
            target,
            previous: None,
            value: None,
            message: None,
            executed_at: at,
        };
        match self {
            InsightKind::TimeoutOptimization { current, recommended } => vec![AutomaticAction {
                previous: current.map(|v| v as f64),
                value: recommended.map(|v| v as f64),
                ..act(ActionKind::UpdateParameter, "timeout_ms".into())
            }],
            InsightKind::PatternRefinement { pattern_id, refinement, false_positive_rate } => vec![AutomaticAction {
                value: *false_positive_rate,
                message: refinement.clone(),
                ..act(ActionKind::RefinePattern, pattern_id.clone().unwrap_or_default())
            }],
            InsightKind::PerformanceDegradation { metric, degradation_pct, baseline, current } => {
                let metric = metric.clone().unwrap_or_default();
                vec![
                    AutomaticAction {
                        message: Some(format!(
                            "{} degraded by {:.1}%",
                            metric,
                            degradation_pct.unwrap_or_default()
                        )),
                        ..act(ActionKind::Alert, metric.clone())
                    },
                    AutomaticAction {
                        previous: *baseline,
                        value: *current,
                        ..act(ActionKind::EnableMonitoring, metric)
                    },
                ]
            }
            InsightKind::CrossHookCorrelation { hooks, strength, shared_patterns } => vec![AutomaticAction {
                value: *strength,
                message: (!shared_patterns.is_empty()).then(|| shared_patterns.join(", ")),
                ..act(ActionKind::LinkHooks, hooks.join(","))
            }],
            InsightKind::PredictiveAlert { probability, timeframe, preventive_action } => {
                let timeframe = timeframe.clone().unwrap_or_default();
                vec![
                    AutomaticAction {
                        value: *probability,
                        message: Some(format!(
                            "failure predicted within {} (p={:.2})",
                            timeframe,
                            probability.unwrap_or_default()
                        )),
                        ..act(ActionKind::Alert, timeframe.clone())
                    },
                    AutomaticAction {
                        message: preventive_action.clone(),
                        ..act(ActionKind::SchedulePreventiveAction, timeframe)
                    },
                ]
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actions, validations, feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    UpdateParameter,
    RefinePattern,
    Alert,
    EnableMonitoring,
    LinkHooks,
    SchedulePreventiveAction,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::UpdateParameter => "update_parameter",
            ActionKind::RefinePattern => "refine_pattern",
            ActionKind::Alert => "alert",
            ActionKind::EnableMonitoring => "enable_monitoring",
            ActionKind::LinkHooks => "link_hooks",
            ActionKind::SchedulePreventiveAction => "schedule_preventive_action",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticAction {
    pub kind: ActionKind,
    /// Mirror of an applied action produced by `rollback()`.
    pub rollback: bool,
    pub target: String,
    pub previous: Option<f64>,
    pub value: Option<f64>,
    pub message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl AutomaticAction {
    /// Snake-case action name, `rollback_`-prefixed on mirrored actions.
    pub fn action_type(&self) -> String {
        if self.rollback {
            format!("rollback_{}", self.kind.as_str())
        } else {
            self.kind.as_str().to_string()
        }
    }

    fn mirrored(&self, at: DateTime<Utc>) -> Self {
        Self {
            kind: self.kind,
            rollback: true,
            target: self.target.clone(),
            previous: self.value,
            value: self.previous,
            message: self.message.clone(),
            executed_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    Success,
    Failure,
    Inconclusive,
}

/// Post-apply measurement of whether the insight helped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub verdict: ValidationVerdict,
    pub measured_impact: Option<f64>,
    pub notes: Option<String>,
    pub at: DateTime<Utc>,
}

impl ValidationOutcome {
    pub fn new(verdict: ValidationVerdict, at: DateTime<Utc>) -> Self {
        Self { verdict, measured_impact: None, notes: None, at }
    }

    pub fn with_impact(mut self, impact: f64) -> Self {
        self.measured_impact = Some(impact);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    /// 1 (useless) to 5 (excellent).
    pub rating: u8,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Insight
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub hook_name: Option<String>,
    pub kind: InsightKind,
    pub confidence: f64,
    pub priority: InsightPriority,
    pub estimated_impact: f64,
    pub actual_impact: Option<f64>,
    pub status: InsightStatus,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub automatic_actions: Vec<AutomaticAction>,
    pub rollback_actions: Vec<AutomaticAction>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
    pub validation_results: Vec<ValidationOutcome>,
    pub user_feedback: Vec<UserFeedback>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Stored writes since insert. Gateways only accept an update carrying
    /// the revision they currently hold.
    pub revision: u64,
}

impl Insight {
    pub fn new(
        kind: InsightKind,
        confidence: f64,
        priority: InsightPriority,
        estimated_impact: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hook_name: None,
            kind,
            confidence,
            priority,
            estimated_impact,
            actual_impact: None,
            status: InsightStatus::Pending,
            applied: false,
            applied_at: None,
            automatic_actions: Vec::new(),
            rollback_actions: Vec::new(),
            rolled_back_at: None,
            rollback_reason: None,
            validation_results: Vec::new(),
            user_feedback: Vec::new(),
            created_at,
            expires_at: None,
            revision: 0,
        }
    }

    pub fn for_hook(mut self, hook_name: impl Into<String>) -> Self {
        self.hook_name = Some(hook_name.into());
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn validate(&self) -> ValidationReport {
        let mut r = self.kind.validate();
        r.require(unit_range(self.confidence), "confidence must be in [0, 1]");
        r.require(self.estimated_impact.is_finite(), "estimated_impact must be finite");
        if let Some(exp) = self.expires_at {
            r.require(exp > self.created_at, "expires_at must be after created_at");
        }
        let applied_status = matches!(
            self.status,
            InsightStatus::Applied | InsightStatus::Validated | InsightStatus::RolledBack
        );
        r.require(self.applied == applied_status, format!("applied flag inconsistent with status {}", self.status));
        r
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stamp the variant's automatic actions. Rejected when already applied,
    /// expired, or the payload is invalid; the insight is untouched then.
    pub fn apply(&mut self, now: DateTime<Utc>) -> Result<&[AutomaticAction]> {
        if self.applied {
            return Err(LearningError::conflict("apply", format!("insight {} already applied", self.id)));
        }
        if self.status != InsightStatus::Pending {
            return Err(LearningError::conflict("apply", format!("insight {} is {}", self.id, self.status)));
        }
        self.validate().into_result(format!("insight {}", self.id))?;

        self.automatic_actions = self.kind.actions(now);
        self.applied = true;
        self.applied_at = Some(now);
        self.status = InsightStatus::Applied;
        tracing::info!(
            target: "learning::insight",
            id = %self.id,
            kind = self.kind.type_name(),
            actions = self.automatic_actions.len(),
            "insight applied"
        );
        Ok(&self.automatic_actions)
    }

    /// Reverse an applied insight. Returns the mirrored actions.
    pub fn rollback(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<&[AutomaticAction]> {
        if !self.applied {
            return Err(LearningError::conflict("rollback", format!("insight {} was never applied", self.id)));
        }
        if !self.status.is_active() {
            return Err(LearningError::conflict("rollback", format!("insight {} is {}", self.id, self.status)));
        }
        let reason = reason.into();
        self.rollback_actions = self.automatic_actions.iter().rev().map(|a| a.mirrored(now)).collect();
        self.status = InsightStatus::RolledBack;
        self.rolled_back_at = Some(now);
        tracing::warn!(target: "learning::insight", id = %self.id, reason = %reason, "insight rolled back");
        self.rollback_reason = Some(reason);
        Ok(&self.rollback_actions)
    }

    pub fn add_validation_result(&mut self, outcome: ValidationOutcome) -> Result<()> {
        if !self.status.is_active() {
            return Err(LearningError::conflict(
                "add_validation_result",
                format!("insight {} is {}", self.id, self.status),
            ));
        }
        if let Some(impact) = outcome.measured_impact {
            if !impact.is_finite() {
                return Err(LearningError::validation("validation result", vec!["measured_impact must be finite".into()]));
            }
            self.actual_impact = Some(impact);
        }
        self.validation_results.push(outcome);
        self.status = InsightStatus::Validated;
        Ok(())
    }

    pub fn add_user_feedback(&mut self, rating: u8, comment: Option<String>, at: DateTime<Utc>) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(LearningError::validation("user feedback", vec![format!("rating {rating} not in 1..=5")]));
        }
        self.user_feedback.push(UserFeedback { rating, comment, at });
        Ok(())
    }

    pub fn should_expire(&self, now: DateTime<Utc>) -> bool {
        if self.status != InsightStatus::Pending {
            return false;
        }
        now - self.created_at > Duration::days(INSIGHT_MAX_AGE_DAYS)
            || self.confidence < MIN_INSIGHT_CONFIDENCE
            || self.expires_at.is_some_and(|e| now >= e)
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.should_expire(now) {
            return Err(LearningError::conflict("expire", format!("insight {} is not due to expire", self.id)));
        }
        self.status = InsightStatus::Expired;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scoring
    // -----------------------------------------------------------------------

    /// Blend of impact accuracy (0.5), mean user rating (0.3) and validation
    /// success fraction (0.2). Zero if never applied.
    pub fn effectiveness(&self) -> f64 {
        if !self.applied {
            return 0.0;
        }
        let accuracy = match self.actual_impact {
            Some(actual) => {
                let denom = self.estimated_impact.abs().max(1e-9);
                (1.0 - (actual - self.estimated_impact).abs() / denom).clamp(0.0, 1.0)
            }
            None => 0.0,
        };
        let rating = if self.user_feedback.is_empty() {
            0.0
        } else {
            self.user_feedback.iter().map(|f| (f.rating as f64 - 1.0) / 4.0).sum::<f64>()
                / self.user_feedback.len() as f64
        };
        let success = if self.validation_results.is_empty() {
            0.0
        } else {
            self.validation_results.iter().filter(|v| v.verdict == ValidationVerdict::Success).count() as f64
                / self.validation_results.len() as f64
        };
        (0.5 * accuracy + 0.3 * rating + 0.2 * success).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
