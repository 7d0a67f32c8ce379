//! # Stage: Persistence Gateway
//!
//! ## Responsibility
//! The storage contract the engine talks to, the flat record encoding the
//! adapters share, and an in-process reference adapter.
//!
//! Domain types never see the storage form: adapters call
//! [`StorageCodec::to_storage_format`] on the way in and
//! [`StorageCodec::from_storage_format`] on the way out. Scalars are stored
//! as their `Display` text (floats use Rust's shortest round-trip form),
//! timestamps as RFC 3339 with automatic sub-second precision, and nested
//! values as JSON text.
//!
//! ## Guarantees
//! - Lossless: decode(encode(x)) == x for every codec in this module
//! - Optimistic concurrency: pattern upserts carry the version the caller
//!   read; insight updates carry the revision the caller read
//! - Non-panicking: lock poisoning and decode failures surface as
//!   [`LearningError::Persistence`]
//!
//! ## NOT Responsible For
//! - Retrying after a conflict (the engine)
//! - Schema migration

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::aggregator::MetricSample;
use super::execution::{ExecutionRecord, HookIdentity};
use super::insight::{Insight, InsightStatus};
use super::pattern::{PatternKey, PatternModel, PatternType};
use crate::error::{LearningError, Result};

/// Flat string-keyed form every adapter persists.
pub type StorageRecord = BTreeMap<String, String>;

pub trait StorageCodec: Sized {
    fn to_storage_format(&self) -> Result<StorageRecord>;
    fn from_storage_format(record: &StorageRecord) -> Result<Self>;
}

/// A value plus the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// PersistenceGateway
// ---------------------------------------------------------------------------

/// Storage operations needed by [`LearningEngine`](super::engine::LearningEngine).
///
/// Queries that return windows (`query_recent_*`) return the newest `limit`
/// entries, oldest first.
pub trait PersistenceGateway: Send + Sync {
    fn insert_execution(&self, record: &ExecutionRecord) -> Result<()>;
    fn query_recent_executions(&self, hook_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>>;

    fn load_pattern(&self, key: &PatternKey) -> Result<Option<Versioned<PatternModel>>>;
    /// Store `model` under `model.key` if the stored version still equals
    /// `expected_version` (`None`: no model stored yet). Returns the new
    /// version, or [`LearningError::VersionConflict`].
    fn upsert_pattern(&self, model: &PatternModel, expected_version: Option<u64>) -> Result<u64>;
    fn query_patterns_by_hook(&self, hook_name: &str) -> Result<Vec<PatternModel>>;
    /// Hooks with at least one stored execution or pattern, sorted.
    fn list_hooks(&self) -> Result<Vec<String>>;

    fn insert_insight(&self, insight: &Insight) -> Result<()>;
    fn load_insight(&self, id: &str) -> Result<Option<Insight>>;
    /// Replace the stored insight if its revision still equals
    /// `insight.revision`. Returns the new revision, or
    /// [`LearningError::VersionConflict`].
    fn update_insight(&self, insight: &Insight) -> Result<u64>;
    /// Newest first.
    fn query_insights(&self, limit: usize) -> Result<Vec<Insight>>;

    fn insert_metric(&self, sample: &MetricSample) -> Result<()>;
    fn query_recent_metrics(&self, name: &str, limit: usize) -> Result<Vec<MetricSample>>;
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LearningError::Persistence(format!("bad timestamp '{s}': {e}")))
}

/// Unit-variant enum as its serde string (`"medium"`, `"histogram"`).
fn encode_enum<T: Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(LearningError::Persistence(format!("expected a unit variant, got {other}"))),
    }
}

fn decode_enum<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(s.to_string()))?)
}

struct Writer(StorageRecord);

impl Writer {
    fn new() -> Self {
        Self(StorageRecord::new())
    }

    fn put(mut self, name: &str, v: impl ToString) -> Self {
        self.0.insert(name.to_string(), v.to_string());
        self
    }

    fn put_opt(self, name: &str, v: Option<impl ToString>) -> Self {
        match v {
            Some(v) => self.put(name, v),
            None => self,
        }
    }

    fn put_ts(self, name: &str, ts: &DateTime<Utc>) -> Self {
        self.put(name, encode_ts(ts))
    }

    fn put_json<T: Serialize>(self, name: &str, v: &T) -> Result<Self> {
        let s = serde_json::to_string(v)?;
        Ok(self.put(name, s))
    }

    fn finish(self) -> StorageRecord {
        self.0
    }
}

struct Reader<'a> {
    record: &'a StorageRecord,
    kind: &'static str,
}

impl<'a> Reader<'a> {
    fn new(record: &'a StorageRecord, kind: &'static str) -> Self {
        Self { record, kind }
    }

    fn opt(&self, name: &str) -> Option<&'a str> {
        self.record.get(name).map(String::as_str)
    }

    fn str(&self, name: &str) -> Result<&'a str> {
        self.opt(name)
            .ok_or_else(|| LearningError::Persistence(format!("{} record missing field '{name}'", self.kind)))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw = self.str(name)?;
        raw.parse()
            .map_err(|e| LearningError::Persistence(format!("{} field '{name}' = '{raw}': {e}", self.kind)))
    }

    fn parse_opt<T: FromStr>(&self, name: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.opt(name) {
            Some(_) => self.parse(name).map(Some),
            None => Ok(None),
        }
    }

    fn ts(&self, name: &str) -> Result<DateTime<Utc>> {
        decode_ts(self.str(name)?)
    }

    fn ts_opt(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.opt(name).map(decode_ts).transpose()
    }

    fn json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(serde_json::from_str(self.str(name)?)?)
    }

    fn string(&self, name: &str) -> Result<String> {
        self.str(name).map(str::to_string)
    }

    fn string_opt(&self, name: &str) -> Option<String> {
        self.opt(name).map(str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

impl StorageCodec for ExecutionRecord {
    fn to_storage_format(&self) -> Result<StorageRecord> {
        Ok(Writer::new()
            .put("id", &self.id)
            .put("hook_name", &self.hook.name)
            .put("hook_family", &self.hook.family)
            .put("hook_priority", self.hook.priority)
            .put("duration_ms", self.duration_ms)
            .put("success", self.success)
            .put("blocked", self.blocked)
            .put_json("file", &self.file)?
            .put_json("context", &self.context)?
            .put_ts("timestamp", &self.timestamp)
            .put_json("process", &self.process)?
            .put_opt("error", self.error.as_ref())
            .finish())
    }

    fn from_storage_format(record: &StorageRecord) -> Result<Self> {
        let r = Reader::new(record, "execution");
        Ok(ExecutionRecord {
            id: r.string("id")?,
            hook: HookIdentity::new(r.str("hook_name")?, r.str("hook_family")?, r.parse("hook_priority")?),
            duration_ms: r.parse("duration_ms")?,
            success: r.parse("success")?,
            blocked: r.parse("blocked")?,
            file: r.json("file")?,
            context: r.json("context")?,
            timestamp: r.ts("timestamp")?,
            process: r.json("process")?,
            error: r.string_opt("error"),
        })
    }
}

impl StorageCodec for PatternModel {
    fn to_storage_format(&self) -> Result<StorageRecord> {
        Ok(Writer::new()
            .put("hook_name", &self.key.hook_name)
            .put("pattern_type", self.key.pattern_type)
            .put("pattern_key", &self.key.pattern_key)
            .put_json("data", &self.data)?
            .put("total_count", self.total_count)
            .put("success_count", self.success_count)
            .put("failure_count", self.failure_count)
            .put("block_count", self.block_count)
            .put_json("duration", &self.duration)?
            .put("false_positive_count", self.false_positive_count)
            .put("false_negative_count", self.false_negative_count)
            .put("confidence", self.confidence)
            .put_ts("first_seen", &self.first_seen)
            .put_ts("last_seen", &self.last_seen)
            .put_json("history", &self.history)?
            .finish())
    }

    fn from_storage_format(record: &StorageRecord) -> Result<Self> {
        let r = Reader::new(record, "pattern");
        let type_name = r.str("pattern_type")?;
        let pattern_type = PatternType::parse(type_name)
            .ok_or_else(|| LearningError::Persistence(format!("unknown pattern type '{type_name}'")))?;
        Ok(PatternModel {
            key: PatternKey::new(r.str("hook_name")?, pattern_type, r.str("pattern_key")?),
            data: r.json("data")?,
            total_count: r.parse("total_count")?,
            success_count: r.parse("success_count")?,
            failure_count: r.parse("failure_count")?,
            block_count: r.parse("block_count")?,
            duration: r.json("duration")?,
            false_positive_count: r.parse("false_positive_count")?,
            false_negative_count: r.parse("false_negative_count")?,
            confidence: r.parse("confidence")?,
            first_seen: r.ts("first_seen")?,
            last_seen: r.ts("last_seen")?,
            history: r.json("history")?,
        })
    }
}

impl StorageCodec for Insight {
    fn to_storage_format(&self) -> Result<StorageRecord> {
        Ok(Writer::new()
            .put("id", &self.id)
            .put_opt("hook_name", self.hook_name.as_ref())
            .put_json("kind", &self.kind)?
            .put("confidence", self.confidence)
            .put("priority", encode_enum(&self.priority)?)
            .put("estimated_impact", self.estimated_impact)
            .put_opt("actual_impact", self.actual_impact)
            .put("status", self.status)
            .put("applied", self.applied)
            .put_opt("applied_at", self.applied_at.as_ref().map(encode_ts))
            .put_json("automatic_actions", &self.automatic_actions)?
            .put_json("rollback_actions", &self.rollback_actions)?
            .put_opt("rolled_back_at", self.rolled_back_at.as_ref().map(encode_ts))
            .put_opt("rollback_reason", self.rollback_reason.as_ref())
            .put_json("validation_results", &self.validation_results)?
            .put_json("user_feedback", &self.user_feedback)?
            .put_ts("created_at", &self.created_at)
            .put_opt("expires_at", self.expires_at.as_ref().map(encode_ts))
            .put("revision", self.revision)
            .finish())
    }

    fn from_storage_format(record: &StorageRecord) -> Result<Self> {
        let r = Reader::new(record, "insight");
        let status_name = r.str("status")?;
        let status = InsightStatus::parse(status_name)
            .ok_or_else(|| LearningError::Persistence(format!("unknown insight status '{status_name}'")))?;
        Ok(Insight {
            id: r.string("id")?,
            hook_name: r.string_opt("hook_name"),
            kind: r.json("kind")?,
            confidence: r.parse("confidence")?,
            priority: decode_enum(r.str("priority")?)?,
            estimated_impact: r.parse("estimated_impact")?,
            actual_impact: r.parse_opt("actual_impact")?,
            status,
            applied: r.parse("applied")?,
            applied_at: r.ts_opt("applied_at")?,
            automatic_actions: r.json("automatic_actions")?,
            rollback_actions: r.json("rollback_actions")?,
            rolled_back_at: r.ts_opt("rolled_back_at")?,
            rollback_reason: r.string_opt("rollback_reason"),
            validation_results: r.json("validation_results")?,
            user_feedback: r.json("user_feedback")?,
            created_at: r.ts("created_at")?,
            expires_at: r.ts_opt("expires_at")?,
            revision: r.parse("revision")?,
        })
    }
}

impl StorageCodec for MetricSample {
    fn to_storage_format(&self) -> Result<StorageRecord> {
        Ok(Writer::new()
            .put("name", &self.name)
            .put("kind", encode_enum(&self.kind)?)
            .put_json("value", &self.value)?
            .put_opt("unit", self.unit.as_ref())
            .put_json("tags", &self.tags)?
            .put_ts("timestamp", &self.timestamp)
            .finish())
    }

    fn from_storage_format(record: &StorageRecord) -> Result<Self> {
        let r = Reader::new(record, "metric");
        Ok(MetricSample {
            name: r.string("name")?,
            kind: decode_enum(r.str("kind")?)?,
            value: r.json("value")?,
            unit: r.string_opt("unit"),
            tags: r.json("tags")?,
            timestamp: r.ts("timestamp")?,
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryGateway
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    executions: Vec<StorageRecord>,
    patterns: BTreeMap<PatternKey, (u64, StorageRecord)>,
    insights: BTreeMap<String, StorageRecord>,
    metrics: Vec<StorageRecord>,
}

/// Mutex-guarded maps of encoded records. Suitable for tests and
/// single-process embedding; contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    tables: Mutex<Tables>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| LearningError::Persistence("in-memory gateway lock poisoned".into()))
    }
}

/// Newest `limit` of `items` (already in insertion order), stable-sorted by
/// `ts`, oldest first.
fn recent_window<T>(mut items: Vec<T>, limit: usize, ts: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    items.sort_by_key(|x| ts(x));
    let skip = items.len().saturating_sub(limit);
    items.split_off(skip)
}

impl PersistenceGateway for InMemoryGateway {
    fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let encoded = record.to_storage_format()?;
        self.tables()?.executions.push(encoded);
        Ok(())
    }

    fn query_recent_executions(&self, hook_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let tables = self.tables()?;
        let matching = tables
            .executions
            .iter()
            .filter(|r| r.get("hook_name").map(String::as_str) == Some(hook_name))
            .map(ExecutionRecord::from_storage_format)
            .collect::<Result<Vec<_>>>()?;
        Ok(recent_window(matching, limit, |r| r.timestamp))
    }

    fn load_pattern(&self, key: &PatternKey) -> Result<Option<Versioned<PatternModel>>> {
        let tables = self.tables()?;
        tables
            .patterns
            .get(key)
            .map(|(version, rec)| {
                Ok::<_, LearningError>(Versioned {
                    value: PatternModel::from_storage_format(rec)?,
                    version: *version,
                })
            })
            .transpose()
    }

    fn upsert_pattern(&self, model: &PatternModel, expected_version: Option<u64>) -> Result<u64> {
        let encoded = model.to_storage_format()?;
        let mut tables = self.tables()?;
        let stored = tables.patterns.get(&model.key).map(|(v, _)| *v);
        if stored != expected_version {
            return Err(LearningError::VersionConflict { key: model.key.to_string() });
        }
        let next = stored.unwrap_or(0) + 1;
        tables.patterns.insert(model.key.clone(), (next, encoded));
        Ok(next)
    }

    fn query_patterns_by_hook(&self, hook_name: &str) -> Result<Vec<PatternModel>> {
        let tables = self.tables()?;
        tables
            .patterns
            .iter()
            .filter(|(k, _)| k.hook_name == hook_name)
            .map(|(_, (_, rec))| PatternModel::from_storage_format(rec))
            .collect()
    }

    fn list_hooks(&self) -> Result<Vec<String>> {
        let tables = self.tables()?;
        let mut hooks: Vec<String> = tables
            .executions
            .iter()
            .filter_map(|r| r.get("hook_name").cloned())
            .chain(tables.patterns.keys().map(|k| k.hook_name.clone()))
            .collect();
        hooks.sort();
        hooks.dedup();
        Ok(hooks)
    }

    fn insert_insight(&self, insight: &Insight) -> Result<()> {
        let encoded = insight.to_storage_format()?;
        let mut tables = self.tables()?;
        if tables.insights.contains_key(&insight.id) {
            return Err(LearningError::Persistence(format!("insight {} already exists", insight.id)));
        }
        tables.insights.insert(insight.id.clone(), encoded);
        Ok(())
    }

    fn load_insight(&self, id: &str) -> Result<Option<Insight>> {
        let tables = self.tables()?;
        tables.insights.get(id).map(Insight::from_storage_format).transpose()
    }

    fn update_insight(&self, insight: &Insight) -> Result<u64> {
        let next = insight.revision + 1;
        let mut encoded = insight.to_storage_format()?;
        encoded.insert("revision".into(), next.to_string());
        let mut tables = self.tables()?;
        let stored = tables
            .insights
            .get(&insight.id)
            .ok_or_else(|| LearningError::not_found("insight", insight.id.clone()))?;
        if stored.get("revision").and_then(|r| r.parse::<u64>().ok()) != Some(insight.revision) {
            return Err(LearningError::VersionConflict { key: insight.id.clone() });
        }
        tables.insights.insert(insight.id.clone(), encoded);
        Ok(next)
    }

    fn query_insights(&self, limit: usize) -> Result<Vec<Insight>> {
        let tables = self.tables()?;
        let mut all = tables
            .insights
            .values()
            .map(Insight::from_storage_format)
            .collect::<Result<Vec<_>>>()?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    fn insert_metric(&self, sample: &MetricSample) -> Result<()> {
        let encoded = sample.to_storage_format()?;
        self.tables()?.metrics.push(encoded);
        Ok(())
    }

    fn query_recent_metrics(&self, name: &str, limit: usize) -> Result<Vec<MetricSample>> {
        let tables = self.tables()?;
        let matching = tables
            .metrics
            .iter()
            .filter(|r| r.get("name").map(String::as_str) == Some(name))
            .map(MetricSample::from_storage_format)
            .collect::<Result<Vec<_>>>()?;
        Ok(recent_window(matching, limit, |s| s.timestamp))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::execution::{FileContext, ProcessInfo};
    use crate::learning::insight::{InsightKind, InsightPriority, ValidationOutcome, ValidationVerdict};
    use crate::learning::pattern::FeedbackKind;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap() + Duration::microseconds(123_456)
    }

    fn record(hook: &str, ms: f64, i: i64) -> ExecutionRecord {
        ExecutionRecord::new(HookIdentity::new(hook, "lint", 42), ms, true, t0() + Duration::seconds(i))
    }

    fn model() -> PatternModel {
        let first = record("lint", 12.5, 0).with_file(FileContext::from_path("src/a.rs").with_content(b"fn a() {}"));
        let data = first.extract_features()[0].clone();
        let mut m = PatternModel::for_record(&first, data);
        for i in 0..7 {
            m = m.updated(&record("lint", 10.0 + i as f64 / 3.0, i).with_blocked(i % 3 == 0)).model;
        }
        m.with_feedback(FeedbackKind::FalseNegative, t0())
    }

    // ===== codecs =====

    #[test]
    fn test_execution_record_storage_round_trip() {
        let r = record("lint", 0.1 + 0.2, 0)
            .with_file(FileContext::from_path("web/index.HTML").with_content(b"<html>"))
            .with_context("branch", serde_json::json!("main"))
            .with_process(ProcessInfo { pid: 4242, exit_code: Some(1) })
            .with_error("exit status 1");
        let encoded = r.to_storage_format().unwrap();
        assert_eq!(encoded["success"], "true");
        assert_eq!(ExecutionRecord::from_storage_format(&encoded).unwrap(), r);
    }

    #[test]
    fn test_pattern_model_storage_round_trip() {
        let m = model();
        let encoded = m.to_storage_format().unwrap();
        assert_eq!(encoded["pattern_type"], "file_path");
        assert_eq!(PatternModel::from_storage_format(&encoded).unwrap(), m);
    }

    #[test]
    fn test_insight_storage_round_trip_after_lifecycle() {
        let mut i = Insight::new(InsightKind::timeout(30_000, 900), 0.8, InsightPriority::High, 0.3, t0())
            .for_hook("lint")
            .expiring_at(t0() + Duration::days(3));
        i.apply(t0()).unwrap();
        i.add_validation_result(ValidationOutcome::new(ValidationVerdict::Success, t0()).with_impact(0.25))
            .unwrap();
        i.add_user_feedback(4, Some("good".into()), t0()).unwrap();
        let encoded = i.to_storage_format().unwrap();
        assert_eq!(encoded["priority"], "high");
        assert_eq!(encoded["status"], "validated");
        assert_eq!(Insight::from_storage_format(&encoded).unwrap(), i);
    }

    #[test]
    fn test_metric_storage_round_trip() {
        let s = MetricSample::histogram("execution_time.lint", vec![1.5, 2.25], t0())
            .with_unit("ms")
            .with_tag("host", "ci-3");
        let encoded = s.to_storage_format().unwrap();
        assert_eq!(encoded["kind"], "histogram");
        assert_eq!(MetricSample::from_storage_format(&encoded).unwrap(), s);
    }

    #[test]
    fn test_missing_field_is_persistence_error() {
        let mut encoded = record("lint", 5.0, 0).to_storage_format().unwrap();
        encoded.remove("duration_ms");
        let err = ExecutionRecord::from_storage_format(&encoded).unwrap_err();
        assert!(matches!(err, LearningError::Persistence(ref m) if m.contains("duration_ms")));
    }

    #[test]
    fn test_unknown_status_is_persistence_error() {
        let i = Insight::new(InsightKind::timeout(10, 200), 0.5, InsightPriority::Low, 0.1, t0());
        let mut encoded = i.to_storage_format().unwrap();
        encoded.insert("status".into(), "archived".into());
        assert!(Insight::from_storage_format(&encoded).is_err());
    }

    // ===== in-memory gateway =====

    #[test]
    fn test_upsert_versions_and_conflict() {
        let g = InMemoryGateway::new();
        let m = model();
        assert_eq!(g.upsert_pattern(&m, None).unwrap(), 1);
        assert!(g.upsert_pattern(&m, None).unwrap_err().is_version_conflict());
        assert_eq!(g.upsert_pattern(&m, Some(1)).unwrap(), 2);
        assert!(g.upsert_pattern(&m, Some(1)).unwrap_err().is_version_conflict());
        let loaded = g.load_pattern(&m.key).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value, m);
    }

    #[test]
    fn test_recent_executions_window_oldest_first() {
        let g = InMemoryGateway::new();
        for i in 0..10 {
            g.insert_execution(&record("lint", i as f64, i)).unwrap();
            g.insert_execution(&record("fmt", 100.0, i)).unwrap();
        }
        let recent = g.query_recent_executions("lint", 3).unwrap();
        let ms: Vec<f64> = recent.iter().map(|r| r.duration_ms).collect();
        assert_eq!(ms, vec![7.0, 8.0, 9.0]);
        assert_eq!(g.list_hooks().unwrap(), vec!["fmt".to_string(), "lint".to_string()]);
    }

    #[test]
    fn test_insight_compare_and_set() {
        let g = InMemoryGateway::new();
        let mut i = Insight::new(InsightKind::timeout(30_000, 900), 0.8, InsightPriority::High, 0.3, t0());
        g.insert_insight(&i).unwrap();
        assert!(g.insert_insight(&i).is_err());

        i.apply(t0()).unwrap();
        assert_eq!(g.update_insight(&i).unwrap(), 1);
        // a second writer that also read revision 0 loses
        assert!(g.update_insight(&i).unwrap_err().is_version_conflict());
        let stored = g.load_insight(&i.id).unwrap().unwrap();
        assert_eq!(stored.status, InsightStatus::Applied);
        assert_eq!(stored.revision, 1);
    }

    #[test]
    fn test_same_status_writers_do_not_overwrite_feedback() {
        let g = InMemoryGateway::new();
        let mut i = Insight::new(InsightKind::timeout(30_000, 900), 0.8, InsightPriority::High, 0.3, t0());
        g.insert_insight(&i).unwrap();
        i.apply(t0()).unwrap();
        i.revision = g.update_insight(&i).unwrap();

        // both raters read the same applied snapshot
        let mut a = g.load_insight(&i.id).unwrap().unwrap();
        let mut b = a.clone();
        a.add_user_feedback(5, None, t0()).unwrap();
        b.add_user_feedback(1, None, t0()).unwrap();
        assert_eq!(g.update_insight(&a).unwrap(), 2);
        assert!(g.update_insight(&b).unwrap_err().is_version_conflict());

        let stored = g.load_insight(&i.id).unwrap().unwrap();
        assert_eq!(stored.user_feedback.len(), 1);
        assert_eq!(stored.user_feedback[0].rating, 5);
    }

    #[test]
    fn test_update_unknown_insight_not_found() {
        let g = InMemoryGateway::new();
        let i = Insight::new(InsightKind::timeout(30_000, 900), 0.8, InsightPriority::High, 0.3, t0());
        assert!(matches!(
            g.update_insight(&i),
            Err(LearningError::NotFound { .. })
        ));
    }

    #[test]
    fn test_query_insights_newest_first() {
        let g = InMemoryGateway::new();
        for d in 0..4 {
            let i = Insight::new(InsightKind::timeout(30_000, 900 + d), 0.8, InsightPriority::Low, 0.3, t0() + Duration::days(d as i64));
            g.insert_insight(&i).unwrap();
        }
        let got = g.query_insights(2).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].created_at > got[1].created_at);
    }

    #[test]
    fn test_recent_metrics_filtered_by_name() {
        let g = InMemoryGateway::new();
        for i in 0..5 {
            g.insert_metric(&MetricSample::gauge("execution_time.lint", i as f64, t0() + Duration::seconds(i))).unwrap();
            g.insert_metric(&MetricSample::gauge("error_rate.lint", 0.0, t0())).unwrap();
        }
        let got = g.query_recent_metrics("execution_time.lint", 10).unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(got[4].values(), &[4.0]);
    }
}
