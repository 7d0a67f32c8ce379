//! Adaptive pattern learning for hook runners.
//!
//! Execution telemetry from a hook runner is folded into per-pattern
//! statistical models and system metrics; the [`learning::engine::LearningEngine`]
//! derives insights (parameter recommendations) from that state and drives
//! them through a controlled apply/validate/rollback lifecycle.
//!
//! Storage is abstracted behind [`learning::storage::PersistenceGateway`];
//! an in-memory and a SQLite adapter are provided.

pub mod config;
pub mod error;
pub mod learning;

pub use config::LearningConfig;
pub use error::{LearningError, Result};
pub use learning::aggregator::{AnomalyReason, AnomalyReport, MetricAggregator, MetricKind, MetricSample, MetricSummary};
pub use learning::engine::{IngestReport, LearningEngine};
pub use learning::execution::{ExecutionRecord, FileContext, HookIdentity};
pub use learning::insight::{Insight, InsightKind, InsightPriority, InsightStatus, ValidationOutcome, ValidationVerdict};
pub use learning::pattern::{FeedbackKind, PatternData, PatternKey, PatternModel, PatternType};
pub use learning::report::LearningReport;
pub use learning::sqlite_store::SqliteGateway;
pub use learning::storage::{InMemoryGateway, PersistenceGateway, StorageCodec};
