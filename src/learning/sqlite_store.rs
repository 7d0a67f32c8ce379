//! # Stage: SQLite Gateway
//!
//! ## Responsibility
//! Durable [`PersistenceGateway`] backed by a single SQLite database.
//! Each table keeps the columns queries filter or order on, plus the full
//! [`StorageRecord`] as JSON text in `record`.
//!
//! ## Guarantees
//! - Atomic compare-and-set: pattern upserts and insight updates run the
//!   version/revision check and the write in one transaction
//! - Stable ordering: windows order by microsecond timestamp, then insertion
//! - Idempotent schema: `open()` on an existing database is a no-op migration
//!
//! ## NOT Responsible For
//! - Connection pooling (one mutex-guarded connection)
//! - Schema versioning beyond `CREATE TABLE IF NOT EXISTS`

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::aggregator::MetricSample;
use super::execution::ExecutionRecord;
use super::insight::Insight;
use super::pattern::{PatternKey, PatternModel};
use super::storage::{encode_ts, PersistenceGateway, StorageCodec, StorageRecord, Versioned};
use crate::error::{LearningError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    hook_name  TEXT NOT NULL,
    ts_micros  INTEGER NOT NULL,
    record     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_hook_ts ON executions (hook_name, ts_micros);

CREATE TABLE IF NOT EXISTS patterns (
    hook_name     TEXT NOT NULL,
    pattern_type  TEXT NOT NULL,
    pattern_key   TEXT NOT NULL,
    version       INTEGER NOT NULL,
    confidence    REAL NOT NULL,
    total_count   INTEGER NOT NULL,
    block_count   INTEGER NOT NULL,
    last_seen     TEXT NOT NULL,
    record        TEXT NOT NULL,
    PRIMARY KEY (hook_name, pattern_type, pattern_key)
);

CREATE TABLE IF NOT EXISTS insights (
    id                 TEXT PRIMARY KEY NOT NULL,
    status             TEXT NOT NULL,
    revision           INTEGER NOT NULL,
    created_at_micros  INTEGER NOT NULL,
    record             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_insights_created ON insights (created_at_micros);

CREATE TABLE IF NOT EXISTS metrics (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    ts_micros  INTEGER NOT NULL,
    record     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics (name, ts_micros);
";

pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGateway").finish_non_exhaustive()
    }
}

impl SqliteGateway {
    /// Open (creating if missing) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let gateway = Self::init(conn)?;
        tracing::debug!(target: "learning::sqlite", path = %path.as_ref().display(), "opened learning store");
        Ok(gateway)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LearningError::Persistence("sqlite connection lock poisoned".into()))
    }
}

fn to_json(record: &StorageRecord) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

fn decode<T: StorageCodec>(text: &str) -> Result<T> {
    let record: StorageRecord = serde_json::from_str(text)?;
    T::from_storage_format(&record)
}

fn decode_all<T: StorageCodec>(rows: Vec<String>) -> Result<Vec<T>> {
    rows.iter().map(|t| decode(t)).collect()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

impl PersistenceGateway for SqliteGateway {
    fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let text = to_json(&record.to_storage_format()?)?;
        self.conn()?.execute(
            "INSERT INTO executions (id, hook_name, ts_micros, record) VALUES (?1, ?2, ?3, ?4)",
            params![record.id, record.hook.name, record.timestamp.timestamp_micros(), text],
        )?;
        Ok(())
    }

    fn query_recent_executions(&self, hook_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record FROM executions WHERE hook_name = ?1
             ORDER BY ts_micros DESC, seq DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![hook_name, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        decode_all(rows)
    }

    fn load_pattern(&self, key: &PatternKey) -> Result<Option<Versioned<PatternModel>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT version, record FROM patterns
                 WHERE hook_name = ?1 AND pattern_type = ?2 AND pattern_key = ?3",
                params![key.hook_name, key.pattern_type.as_str(), key.pattern_key],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        row.map(|(version, text)| Ok::<_, LearningError>(Versioned { value: decode(&text)?, version: version as u64 }))
            .transpose()
    }

    fn upsert_pattern(&self, model: &PatternModel, expected_version: Option<u64>) -> Result<u64> {
        let text = to_json(&model.to_storage_format()?)?;
        let key = &model.key;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored: Option<u64> = tx
            .query_row(
                "SELECT version FROM patterns
                 WHERE hook_name = ?1 AND pattern_type = ?2 AND pattern_key = ?3",
                params![key.hook_name, key.pattern_type.as_str(), key.pattern_key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v as u64);
        if stored != expected_version {
            tracing::debug!(
                target: "learning::sqlite",
                key = %key,
                expected = ?expected_version,
                stored = ?stored,
                "pattern version conflict"
            );
            return Err(LearningError::VersionConflict { key: key.to_string() });
        }

        let next = stored.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO patterns
                 (hook_name, pattern_type, pattern_key, version, confidence, total_count, block_count, last_seen, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (hook_name, pattern_type, pattern_key) DO UPDATE SET
                 version = excluded.version,
                 confidence = excluded.confidence,
                 total_count = excluded.total_count,
                 block_count = excluded.block_count,
                 last_seen = excluded.last_seen,
                 record = excluded.record",
            params![
                key.hook_name,
                key.pattern_type.as_str(),
                key.pattern_key,
                next as i64,
                model.confidence,
                model.total_count as i64,
                model.block_count as i64,
                encode_ts(&model.last_seen),
                text,
            ],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn query_patterns_by_hook(&self, hook_name: &str) -> Result<Vec<PatternModel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record FROM patterns WHERE hook_name = ?1 ORDER BY pattern_type, pattern_key",
        )?;
        let rows = stmt
            .query_map(params![hook_name], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_all(rows)
    }

    fn list_hooks(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT hook_name FROM executions UNION SELECT hook_name FROM patterns ORDER BY hook_name",
        )?;
        let hooks = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hooks)
    }

    fn insert_insight(&self, insight: &Insight) -> Result<()> {
        let text = to_json(&insight.to_storage_format()?)?;
        let res = self.conn()?.execute(
            "INSERT INTO insights (id, status, revision, created_at_micros, record) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                insight.id,
                insight.status.as_str(),
                insight.revision as i64,
                insight.created_at.timestamp_micros(),
                text
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LearningError::Persistence(format!("insight {} already exists", insight.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_insight(&self, id: &str) -> Result<Option<Insight>> {
        let conn = self.conn()?;
        let text = conn
            .query_row("SELECT record FROM insights WHERE id = ?1", params![id], |row| row.get::<_, String>(0))
            .optional()?;
        text.map(|t| decode(&t)).transpose()
    }

    fn update_insight(&self, insight: &Insight) -> Result<u64> {
        let next = insight.revision + 1;
        let mut encoded = insight.to_storage_format()?;
        encoded.insert("revision".into(), next.to_string());
        let text = to_json(&encoded)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored = tx
            .query_row("SELECT revision FROM insights WHERE id = ?1", params![insight.id], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?
            .ok_or_else(|| LearningError::not_found("insight", insight.id.clone()))?;
        if stored as u64 != insight.revision {
            return Err(LearningError::VersionConflict { key: insight.id.clone() });
        }

        tx.execute(
            "UPDATE insights SET status = ?2, revision = ?3, record = ?4 WHERE id = ?1",
            params![insight.id, insight.status.as_str(), next as i64, text],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn query_insights(&self, limit: usize) -> Result<Vec<Insight>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT record FROM insights ORDER BY created_at_micros DESC, id LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_all(rows)
    }

    fn insert_metric(&self, sample: &MetricSample) -> Result<()> {
        let text = to_json(&sample.to_storage_format()?)?;
        self.conn()?.execute(
            "INSERT INTO metrics (name, ts_micros, record) VALUES (?1, ?2, ?3)",
            params![sample.name, sample.timestamp.timestamp_micros(), text],
        )?;
        Ok(())
    }

    fn query_recent_metrics(&self, name: &str, limit: usize) -> Result<Vec<MetricSample>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record FROM metrics WHERE name = ?1 ORDER BY ts_micros DESC, seq DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![name, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        decode_all(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::execution::{FileContext, HookIdentity};
    use crate::learning::insight::{InsightKind, InsightPriority, ValidationOutcome, ValidationVerdict};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 9, 9, 9, 9).unwrap()
    }

    fn record(hook: &str, ms: f64, i: i64) -> ExecutionRecord {
        ExecutionRecord::new(HookIdentity::new(hook, "lint", 1), ms, true, t0() + Duration::milliseconds(i * 250))
            .with_file(FileContext::from_path("lib/x.py"))
    }

    #[test]
    fn test_schema_is_idempotent() {
        let g = SqliteGateway::open_in_memory().unwrap();
        g.conn().unwrap().execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn test_executions_window_orders_sub_second() {
        let g = SqliteGateway::open_in_memory().unwrap();
        // 250ms steps: RFC 3339 strings would sort "…:09Z" after "…:09.25Z"
        for i in 0..8 {
            g.insert_execution(&record("lint", i as f64, i)).unwrap();
        }
        let got: Vec<f64> = g.query_recent_executions("lint", 4).unwrap().iter().map(|r| r.duration_ms).collect();
        assert_eq!(got, vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_pattern_upsert_conflict() {
        let g = SqliteGateway::open_in_memory().unwrap();
        let r = record("lint", 3.0, 0);
        let data = r.extract_features()[1].clone();
        let m = PatternModel::for_record(&r, data).updated(&r).model;
        assert_eq!(g.upsert_pattern(&m, None).unwrap(), 1);
        assert!(g.upsert_pattern(&m, None).unwrap_err().is_version_conflict());
        assert_eq!(g.upsert_pattern(&m, Some(1)).unwrap(), 2);
        let loaded = g.load_pattern(&m.key).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value, m);
        assert_eq!(g.query_patterns_by_hook("lint").unwrap(), vec![m]);
    }

    #[test]
    fn test_duplicate_insight_is_persistence_error() {
        let g = SqliteGateway::open_in_memory().unwrap();
        let i = Insight::new(InsightKind::timeout(30_000, 500), 0.7, InsightPriority::Medium, 0.2, t0());
        g.insert_insight(&i).unwrap();
        assert!(matches!(g.insert_insight(&i), Err(LearningError::Persistence(_))));
    }

    #[test]
    fn test_insight_revision_cas() {
        let g = SqliteGateway::open_in_memory().unwrap();
        let mut i = Insight::new(InsightKind::timeout(30_000, 500), 0.7, InsightPriority::Medium, 0.2, t0());
        g.insert_insight(&i).unwrap();
        i.apply(t0()).unwrap();
        let written = g.update_insight(&i).unwrap();
        assert!(g.update_insight(&i).unwrap_err().is_version_conflict());
        i.revision = written;
        assert_eq!(g.load_insight(&i.id).unwrap().unwrap(), i);
    }

    #[test]
    fn test_concurrent_validations_keep_first_result() {
        let g = SqliteGateway::open_in_memory().unwrap();
        let mut i = Insight::new(InsightKind::timeout(30_000, 500), 0.7, InsightPriority::Medium, 0.2, t0());
        g.insert_insight(&i).unwrap();
        i.apply(t0()).unwrap();
        i.add_validation_result(ValidationOutcome::new(ValidationVerdict::Success, t0())).unwrap();
        i.revision = g.update_insight(&i).unwrap();

        // validated -> validated from two copies of the same snapshot
        let mut a = g.load_insight(&i.id).unwrap().unwrap();
        let mut b = a.clone();
        a.add_validation_result(ValidationOutcome::new(ValidationVerdict::Success, t0()).with_impact(0.2)).unwrap();
        b.add_validation_result(ValidationOutcome::new(ValidationVerdict::Failure, t0())).unwrap();
        g.update_insight(&a).unwrap();
        assert!(g.update_insight(&b).unwrap_err().is_version_conflict());

        let stored = g.load_insight(&i.id).unwrap().unwrap();
        assert_eq!(stored.validation_results.len(), 2);
        assert_eq!(stored.actual_impact, Some(0.2));
    }
}
