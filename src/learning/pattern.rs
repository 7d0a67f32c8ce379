//! # Stage: Pattern Models
//!
//! ## Responsibility
//! Online statistics for one `(hook, pattern type, pattern key)` triple:
//! outcome counters, Welford running mean/variance of execution time,
//! false-positive/false-negative feedback, and the derived confidence,
//! staleness, effectiveness and similarity scores.
//!
//! A [`PatternModel`] is an immutable snapshot. [`PatternModel::updated`]
//! returns the next snapshot plus any integrity warnings, so the invariants
//! are checked once per transition.
//!
//! ## Guarantees
//! - Bounded: the adaptation history keeps the last [`HISTORY_CAPACITY`] entries
//! - Pure scoring: confidence and effectiveness are functions of the snapshot
//!   and a caller-supplied `now`
//! - Non-blocking validation: [`PatternModel::validate`] is explicit and never
//!   runs inside `updated`
//!
//! ## NOT Responsible For
//! - Per-key atomicity (the engine's optimistic retry over the gateway)
//! - Deleting stale models (staleness is advisory)

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{ExecutionRecord, TimeBucket};
use super::stats::RunningStats;
use super::validation::{IntegrityWarning, ValidationReport};

/// Adaptation history entries retained per model.
pub const HISTORY_CAPACITY: usize = 100;

/// A model unseen for longer than this is stale.
pub const STALE_AFTER_DAYS: i64 = 30;

// ---------------------------------------------------------------------------
// PatternType / PatternData / PatternKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    FilePath,
    FileExtension,
    ContentHash,
    ExecutionTime,
    HookFamily,
    HookPriority,
    HourOfDay,
    DayOfWeek,
}

impl PatternType {
    pub const ALL: [PatternType; 8] = [
        PatternType::FilePath,
        PatternType::FileExtension,
        PatternType::ContentHash,
        PatternType::ExecutionTime,
        PatternType::HookFamily,
        PatternType::HookPriority,
        PatternType::HourOfDay,
        PatternType::DayOfWeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::FilePath => "file_path",
            PatternType::FileExtension => "file_extension",
            PatternType::ContentHash => "content_hash",
            PatternType::ExecutionTime => "execution_time",
            PatternType::HookFamily => "hook_family",
            PatternType::HookPriority => "hook_priority",
            PatternType::HourOfDay => "hour_of_day",
            PatternType::DayOfWeek => "day_of_week",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload of a pattern, one variant per [`PatternType`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternData {
    FilePath { path: String },
    FileExtension { extension: String },
    ContentHash { hash: String },
    ExecutionTime { bucket: TimeBucket },
    HookFamily { family: String },
    HookPriority { priority: u32 },
    HourOfDay { hour: u32 },
    /// Days from Sunday (0..=6).
    DayOfWeek { day: u32 },
}

const WEEKDAYS: [&str; 7] = ["sunday", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday"];

impl PatternData {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            PatternData::FilePath { .. } => PatternType::FilePath,
            PatternData::FileExtension { .. } => PatternType::FileExtension,
            PatternData::ContentHash { .. } => PatternType::ContentHash,
            PatternData::ExecutionTime { .. } => PatternType::ExecutionTime,
            PatternData::HookFamily { .. } => PatternType::HookFamily,
            PatternData::HookPriority { .. } => PatternType::HookPriority,
            PatternData::HourOfDay { .. } => PatternType::HourOfDay,
            PatternData::DayOfWeek { .. } => PatternType::DayOfWeek,
        }
    }

    /// The string key used for lookup alongside hook name and type.
    pub fn key(&self) -> String {
        match self {
            PatternData::FilePath { path } => path.clone(),
            PatternData::FileExtension { extension } => extension.clone(),
            PatternData::ContentHash { hash } => hash.clone(),
            PatternData::ExecutionTime { bucket } => bucket.to_string(),
            PatternData::HookFamily { family } => family.clone(),
            PatternData::HookPriority { priority } => priority.to_string(),
            PatternData::HourOfDay { hour } => format!("{hour:02}"),
            PatternData::DayOfWeek { day } => {
                WEEKDAYS.get(*day as usize).copied().unwrap_or("invalid").to_string()
            }
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let mut r = ValidationReport::new();
        match self {
            PatternData::FilePath { path } => r.require(!path.trim().is_empty(), "file_path pattern requires a path"),
            PatternData::FileExtension { extension } => {
                r.require(!extension.is_empty(), "file_extension pattern requires an extension");
                r.require(!extension.starts_with('.'), "extension must not start with '.'");
            }
            PatternData::ContentHash { hash } => r.require(
                !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()),
                "content_hash pattern requires a hex hash",
            ),
            PatternData::ExecutionTime { .. } => {}
            PatternData::HookFamily { family } => {
                r.require(!family.trim().is_empty(), "hook_family pattern requires a family")
            }
            PatternData::HookPriority { .. } => {}
            PatternData::HourOfDay { hour } => r.require(*hour < 24, format!("hour {hour} out of range")),
            PatternData::DayOfWeek { day } => r.require(*day < 7, format!("day {day} out of range")),
        }
        r
    }

    /// Type-specific similarity of two payloads in [0, 1].
    ///
    /// Paths compare by segment overlap (Jaccard); every other type is an
    /// exact match.
    pub fn similarity(&self, other: &PatternData) -> f64 {
        match (self, other) {
            (PatternData::FilePath { path: a }, PatternData::FilePath { path: b }) => path_overlap(a, b),
            _ if self.pattern_type() != other.pattern_type() => 0.0,
            _ => {
                if self == other {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

fn path_overlap(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let seg = |p: &str| -> HashSet<String> {
        p.split(['/', '\\']).filter(|s| !s.is_empty()).map(str::to_string).collect()
    };
    let (sa, sb) = (seg(a), seg(b));
    let union = sa.union(&sb).count();
    if union == 0 {
        return if a == b { 1.0 } else { 0.0 };
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

/// Identity of one pattern model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    pub hook_name: String,
    pub pattern_type: PatternType,
    pub pattern_key: String,
}

impl PatternKey {
    pub fn new(hook_name: impl Into<String>, pattern_type: PatternType, pattern_key: impl Into<String>) -> Self {
        Self { hook_name: hook_name.into(), pattern_type, pattern_key: pattern_key.into() }
    }

    pub fn for_data(hook_name: impl Into<String>, data: &PatternData) -> Self {
        Self::new(hook_name, data.pattern_type(), data.key())
    }
}

impl std::fmt::Display for PatternKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.hook_name, self.pattern_type, self.pattern_key)
    }
}

// ---------------------------------------------------------------------------
// Feedback + adaptation history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// The pattern blocked something it should have let through.
    FalsePositive,
    /// The pattern let through something it should have blocked.
    FalseNegative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdaptationEvent {
    Execution {
        #[serde(default)]
        record_id: String,
        success: bool,
        blocked: bool,
        duration_ms: f64,
    },
    Feedback { kind: FeedbackKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationEntry {
    pub at: DateTime<Utc>,
    pub event: AdaptationEvent,
    /// Confidence right after this event.
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Scoring (pure)
// ---------------------------------------------------------------------------

pub fn sample_size_component(total_count: u64) -> f64 {
    match total_count {
        n if n >= 100 => 0.4,
        n if n >= 50 => 0.3,
        n if n >= 20 => 0.2,
        n if n >= 10 => 0.15,
        _ => 0.1,
    }
}

/// Higher when the success rate is far from a coin flip.
pub fn consistency_component(success_rate: f64) -> f64 {
    let spread = (success_rate - 0.5).abs() * 2.0;
    if spread > 0.8 {
        0.3
    } else if spread > 0.6 {
        0.2
    } else {
        0.1
    }
}

pub fn recency_component(hours_since_seen: f64) -> f64 {
    match hours_since_seen {
        h if h < 24.0 => 0.2,
        h if h < 72.0 => 0.15,
        h if h < 168.0 => 0.1,
        h if h < 720.0 => 0.05,
        _ => 0.0,
    }
}

pub fn error_penalty(error_rate: f64) -> f64 {
    if error_rate > 0.10 {
        0.1
    } else if error_rate > 0.05 {
        0.05
    } else {
        0.0
    }
}

/// Confidence in [0, 1] from sample size, consistency, recency and error rate.
pub fn confidence_score(total_count: u64, success_rate: f64, hours_since_seen: f64, error_rate: f64) -> f64 {
    let raw = sample_size_component(total_count)
        + consistency_component(success_rate)
        + recency_component(hours_since_seen)
        - error_penalty(error_rate);
    raw.clamp(0.0, 1.0)
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 3_600_000.0).max(0.0)
}

// ---------------------------------------------------------------------------
// PatternModel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternModel {
    pub key: PatternKey,
    pub data: PatternData,
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub block_count: u64,
    /// Running execution-time statistics in milliseconds.
    pub duration: RunningStats,
    pub false_positive_count: u64,
    pub false_negative_count: u64,
    /// Confidence as of the last transition.
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub history: VecDeque<AdaptationEntry>,
}

/// Result of one transition: the next snapshot and any integrity warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternUpdate {
    pub model: PatternModel,
    pub warnings: Vec<IntegrityWarning>,
}

impl PatternModel {
    /// Empty model for a pattern first observed at `now`.
    pub fn new(key: PatternKey, data: PatternData, now: DateTime<Utc>) -> Self {
        Self {
            key,
            data,
            total_count: 0,
            success_count: 0,
            failure_count: 0,
            block_count: 0,
            duration: RunningStats::new(),
            false_positive_count: 0,
            false_negative_count: 0,
            confidence: 0.0,
            first_seen: now,
            last_seen: now,
            history: VecDeque::new(),
        }
    }

    pub fn for_record(record: &ExecutionRecord, data: PatternData) -> Self {
        let key = PatternKey::for_data(record.hook.name.clone(), &data);
        Self::new(key, data, record.timestamp)
    }

    // -----------------------------------------------------------------------
    // Derived rates
    // -----------------------------------------------------------------------

    pub fn success_rate(&self) -> f64 {
        ratio(self.success_count, self.total_count)
    }

    pub fn block_rate(&self) -> f64 {
        ratio(self.block_count, self.total_count)
    }

    /// `(false positives + false negatives) / total`.
    pub fn error_rate(&self) -> f64 {
        ratio(self.false_positive_count + self.false_negative_count, self.total_count)
    }

    pub fn false_positive_rate(&self) -> f64 {
        ratio(self.false_positive_count, self.total_count)
    }

    pub fn mean_duration_ms(&self) -> f64 {
        self.duration.mean
    }

    pub fn variance_ms(&self) -> f64 {
        self.duration.variance()
    }

    pub fn std_dev_ms(&self) -> f64 {
        self.duration.std_dev()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Fold one execution into a new snapshot.
    pub fn updated(&self, record: &ExecutionRecord) -> PatternUpdate {
        let mut next = self.clone();
        next.total_count += 1;
        if record.success {
            next.success_count += 1;
        } else {
            next.failure_count += 1;
        }
        if record.blocked {
            next.block_count += 1;
        }
        next.duration = next.duration.push(record.duration_ms);
        if next.total_count == 1 {
            next.first_seen = record.timestamp;
            next.last_seen = record.timestamp;
        } else {
            next.first_seen = next.first_seen.min(record.timestamp);
            next.last_seen = next.last_seen.max(record.timestamp);
        }
        next.confidence = next.confidence_at(next.last_seen);
        next.push_history(AdaptationEntry {
            at: record.timestamp,
            event: AdaptationEvent::Execution {
                record_id: record.id.clone(),
                success: record.success,
                blocked: record.blocked,
                duration_ms: record.duration_ms,
            },
            confidence: next.confidence,
        });

        let mut warnings = next.integrity_warnings();
        if record.hook.name != next.key.hook_name {
            warnings.push(IntegrityWarning {
                subject: next.key.to_string(),
                message: format!("record from hook '{}' folded into this model", record.hook.name),
            });
        }
        for w in &warnings {
            tracing::warn!(target: "learning::pattern", pattern = %w.subject, "{}", w.message);
        }
        PatternUpdate { model: next, warnings }
    }

    /// Whether execution `record_id` is among the retained history entries.
    /// Only the last [`HISTORY_CAPACITY`] events are checked.
    pub fn has_folded(&self, record_id: &str) -> bool {
        self.history.iter().any(|e| {
            matches!(&e.event, AdaptationEvent::Execution { record_id: id, .. } if id == record_id)
        })
    }

    /// Record user or validator feedback as a new snapshot.
    pub fn with_feedback(&self, kind: FeedbackKind, at: DateTime<Utc>) -> PatternModel {
        let mut next = self.clone();
        match kind {
            FeedbackKind::FalsePositive => next.false_positive_count += 1,
            FeedbackKind::FalseNegative => next.false_negative_count += 1,
        }
        next.confidence = next.confidence_at(at.max(next.last_seen));
        next.push_history(AdaptationEntry {
            at,
            event: AdaptationEvent::Feedback { kind },
            confidence: next.confidence,
        });
        next
    }

    fn push_history(&mut self, entry: AdaptationEntry) {
        while self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    fn integrity_warnings(&self) -> Vec<IntegrityWarning> {
        let mut out = Vec::new();
        if self.total_count != self.success_count + self.failure_count {
            out.push(IntegrityWarning {
                subject: self.key.to_string(),
                message: format!(
                    "total_count {} != success_count {} + failure_count {}",
                    self.total_count, self.success_count, self.failure_count
                ),
            });
        }
        if self.duration.count != self.total_count {
            out.push(IntegrityWarning {
                subject: self.key.to_string(),
                message: format!(
                    "duration sample count {} != total_count {}",
                    self.duration.count, self.total_count
                ),
            });
        }
        out
    }

    // -----------------------------------------------------------------------
    // Scores
    // -----------------------------------------------------------------------

    pub fn confidence_at(&self, now: DateTime<Utc>) -> f64 {
        confidence_score(
            self.total_count,
            self.success_rate(),
            hours_between(self.last_seen, now),
            self.error_rate(),
        )
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    /// Unseen for more than [`STALE_AFTER_DAYS`], or weak and thinly sampled,
    /// or wrong more than 20% of the time.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        if now - self.last_seen > Duration::days(STALE_AFTER_DAYS) {
            return true;
        }
        if self.confidence_at(now) < 0.3 && self.total_count < 10 {
            return true;
        }
        self.error_rate() > 0.2
    }

    pub fn effectiveness_at(&self, now: DateTime<Utc>) -> f64 {
        let hours = hours_between(self.last_seen, now);
        let recency_bonus = if hours < 24.0 {
            0.1
        } else if hours < 168.0 {
            0.05
        } else {
            0.0
        };
        let performance_bonus = if self.total_count == 0 {
            0.0
        } else if self.mean_duration_ms() < 100.0 {
            0.1
        } else if self.mean_duration_ms() < 1_000.0 {
            0.05
        } else {
            0.0
        };
        let raw = 0.4 * self.success_rate() + 0.3 * self.confidence_at(now) - 0.2 * self.error_rate()
            + recency_bonus
            + performance_bonus;
        raw.clamp(0.0, 1.0)
    }

    /// Similarity in [0, 1]; zero across pattern types.
    pub fn similarity(&self, other: &PatternModel) -> f64 {
        if self.key.pattern_type != other.key.pattern_type {
            return 0.0;
        }
        let data = self.data.similarity(&other.data);
        let rate = 1.0 - (self.success_rate() - other.success_rate()).abs();
        let (a, b) = (self.mean_duration_ms(), other.mean_duration_ms());
        let time = if a.max(b) <= 0.0 { 1.0 } else { 1.0 - (a - b).abs() / a.max(b) };
        let same_hook = if self.key.hook_name == other.key.hook_name { 1.0 } else { 0.0 };
        (0.5 * data + 0.2 * rate + 0.2 * time + 0.1 * same_hook).clamp(0.0, 1.0)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> ValidationReport {
        let mut r = self.data.validate();
        r.require(!self.key.hook_name.trim().is_empty(), "hook name is required");
        r.require(
            self.data.pattern_type() == self.key.pattern_type,
            format!("payload type {} does not match key type {}", self.data.pattern_type(), self.key.pattern_type),
        );
        r.require(
            self.data.key() == self.key.pattern_key,
            format!("payload key '{}' does not match pattern key '{}'", self.data.key(), self.key.pattern_key),
        );
        r.require(self.block_count <= self.total_count, "block_count exceeds total_count");
        r.require((0.0..=1.0).contains(&self.confidence), "confidence must be in [0, 1]");
        r.require(self.first_seen <= self.last_seen, "first_seen is after last_seen");
        r.require(self.history.len() <= HISTORY_CAPACITY, "adaptation history over capacity");
        for w in self.integrity_warnings() {
            r.warn(w.message);
        }
        r
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
