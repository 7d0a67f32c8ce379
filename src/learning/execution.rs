//! # Stage: Execution Records
//!
//! ## Responsibility
//! The leaf data unit of the learning pipeline. One [`ExecutionRecord`] is
//! created per observed hook run and never mutated afterwards. From it the
//! engine derives pattern features (one [`PatternData`] per trackable
//! condition) and compares it against a recent window of executions of the
//! same hook to flag outliers.
//!
//! ## Guarantees
//! - Immutable after construction: builders consume `self`
//! - Non-panicking: degenerate windows (too small, zero variance) never flag
//!
//! ## NOT Responsible For
//! - Producing telemetry (that is the hook runner)
//! - Persisting records (the gateway)

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::pattern::PatternData;
use super::stats;
use super::validation::ValidationReport;
use crate::config::OutlierConfig;

/// Upper bound accepted for a hook priority.
pub const MAX_HOOK_PRIORITY: u32 = 1000;

// ---------------------------------------------------------------------------
// Hook identity, file and process context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HookIdentity {
    pub name: String,
    /// Grouping such as `"lint"`, `"format"`, `"security"`.
    pub family: String,
    pub priority: u32,
}

impl HookIdentity {
    pub fn new(name: impl Into<String>, family: impl Into<String>, priority: u32) -> Self {
        Self { name: name.into(), family: family.into(), priority }
    }
}

/// File the hook ran against, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    /// Lowercase, without the leading dot.
    pub extension: Option<String>,
    /// Hex SHA-1 of the file content.
    pub content_hash: Option<String>,
}

impl FileContext {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let extension = std::path::Path::new(&path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        Self { path, extension, content_hash: None }
    }

    pub fn with_content(mut self, content: &[u8]) -> Self {
        self.content_hash = Some(fingerprint(content));
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Hex-encoded SHA-1 of `content`.
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub exit_code: Option<i32>,
}

// ---------------------------------------------------------------------------
// Execution-time buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    VeryFast,
    Fast,
    Moderate,
    Slow,
    VerySlow,
    ExtremelySlow,
}

impl TimeBucket {
    pub fn from_duration_ms(ms: f64) -> Self {
        if ms < 100.0 {
            TimeBucket::VeryFast
        } else if ms < 500.0 {
            TimeBucket::Fast
        } else if ms < 1_000.0 {
            TimeBucket::Moderate
        } else if ms < 5_000.0 {
            TimeBucket::Slow
        } else if ms < 10_000.0 {
            TimeBucket::VerySlow
        } else {
            TimeBucket::ExtremelySlow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::VeryFast => "very_fast",
            TimeBucket::Fast => "fast",
            TimeBucket::Moderate => "moderate",
            TimeBucket::Slow => "slow",
            TimeBucket::VerySlow => "very_slow",
            TimeBucket::ExtremelySlow => "extremely_slow",
        }
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outlier reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OutlierReason {
    /// Execution time z-score against the window exceeded the threshold.
    SlowExecution { z_score: f64 },
    /// The run failed while the window was overwhelmingly successful.
    UnexpectedFailure { recent_success_rate: f64 },
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// One observed hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub hook: HookIdentity,
    pub duration_ms: f64,
    pub success: bool,
    /// Independent of `success`: a hook may succeed and still block.
    pub blocked: bool,
    pub file: Option<FileContext>,
    pub context: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub process: Option<ProcessInfo>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(hook: HookIdentity, duration_ms: f64, success: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hook,
            duration_ms,
            success,
            blocked: false,
            file: None,
            context: BTreeMap::new(),
            timestamp,
            process: None,
            error: None,
        }
    }

    pub fn with_blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }

    pub fn with_file(mut self, file: FileContext) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn time_bucket(&self) -> TimeBucket {
        TimeBucket::from_duration_ms(self.duration_ms)
    }

    /// Structural checks. Never called implicitly by `extract_features`.
    pub fn validate(&self) -> ValidationReport {
        let mut r = ValidationReport::new();
        r.require(!self.hook.name.trim().is_empty(), "hook name is required");
        r.require(!self.hook.family.trim().is_empty(), "hook family is required");
        r.require(
            self.hook.priority <= MAX_HOOK_PRIORITY,
            format!("hook priority {} exceeds {}", self.hook.priority, MAX_HOOK_PRIORITY),
        );
        r.require(self.duration_ms.is_finite(), "duration must be finite");
        r.require(self.duration_ms >= 0.0, "duration must be >= 0");

        if let Some(file) = &self.file {
            r.require(!file.path.is_empty(), "file path must not be empty");
            if let Some(ext) = &file.extension {
                r.require(
                    !ext.is_empty() && !ext.starts_with('.') && *ext == ext.to_ascii_lowercase(),
                    format!("file extension '{ext}' must be lowercase without a dot"),
                );
            }
            if let Some(hash) = &file.content_hash {
                r.require(
                    !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()),
                    "content hash must be hex",
                );
            }
        }
        if !self.success && self.error.is_none() {
            r.warn("failed execution carries no error message");
        }
        r
    }

    /// Flat list of pattern candidates derived from this record.
    ///
    /// Order: file path, extension, content hash, execution-time bucket,
    /// hook family, hook priority, hour of day, day of week. File-derived
    /// features are omitted when the record has no file context.
    pub fn extract_features(&self) -> Vec<PatternData> {
        let mut out = Vec::with_capacity(8);
        if let Some(file) = &self.file {
            out.push(PatternData::FilePath { path: file.path.clone() });
            if let Some(ext) = &file.extension {
                out.push(PatternData::FileExtension { extension: ext.clone() });
            }
            if let Some(hash) = &file.content_hash {
                out.push(PatternData::ContentHash { hash: hash.clone() });
            }
        }
        out.push(PatternData::ExecutionTime { bucket: self.time_bucket() });
        out.push(PatternData::HookFamily { family: self.hook.family.clone() });
        out.push(PatternData::HookPriority { priority: self.hook.priority });
        out.push(PatternData::HourOfDay { hour: self.timestamp.hour() });
        out.push(PatternData::DayOfWeek { day: self.timestamp.weekday().num_days_from_sunday() });
        out
    }

    /// `true` if this record stands out from `recent` (default thresholds).
    pub fn is_outlier(&self, recent: &[ExecutionRecord]) -> bool {
        self.outlier_reason(recent, &OutlierConfig::default()).is_some()
    }

    /// Why this record is an outlier relative to `recent`, if it is one.
    ///
    /// Needs at least `cfg.min_window` records. The z-score test is skipped
    /// when the window's execution times have no spread.
    pub fn outlier_reason(&self, recent: &[ExecutionRecord], cfg: &OutlierConfig) -> Option<OutlierReason> {
        if recent.len() < cfg.min_window {
            return None;
        }

        let durations: Vec<f64> = recent.iter().map(|r| r.duration_ms).collect();
        if let (Some(m), Some(sd)) = (stats::mean(&durations), stats::population_std_dev(&durations)) {
            if sd > 1e-10 {
                let z = (self.duration_ms - m).abs() / sd;
                if z > cfg.z_threshold {
                    return Some(OutlierReason::SlowExecution { z_score: z });
                }
            }
        }

        if !self.success {
            let ok = recent.iter().filter(|r| r.success).count();
            let rate = ok as f64 / recent.len() as f64;
            if rate > cfg.success_rate_threshold {
                return Some(OutlierReason::UnexpectedFailure { recent_success_rate: rate });
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
