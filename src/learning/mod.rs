//! # Module: learning
//!
//! Adaptive pattern learning for a hook runner: every execution updates
//! per-pattern statistics, feeds system metrics, and the accumulated state
//! is turned into insights with an apply/validate/rollback lifecycle.
//!
//! ## Sub-modules
//! - [`stats`]: Welford accumulator and interpolated percentiles
//! - [`validation`]: structured validation reports and integrity warnings
//! - [`execution`]: execution records, feature extraction, outlier checks
//! - [`pattern`]: per-pattern models with confidence, staleness, effectiveness and similarity
//! - [`aggregator`]: metric summaries, merges and anomaly detection
//! - [`insight`]: insight variants and their lifecycle
//! - [`analysis`]: detectors that derive insights from patterns and metrics
//! - [`storage`]: persistence contract, flat record codecs, in-memory gateway
//! - [`sqlite_store`]: SQLite-backed gateway
//! - [`engine`]: ingestion with optimistic per-key retry, insight transitions
//! - [`report`]: read-only summary exports

pub mod stats;
pub mod validation;
pub mod execution;
pub mod pattern;
pub mod aggregator;
pub mod insight;
pub mod analysis;
pub mod storage;
pub mod sqlite_store;
pub mod engine;
pub mod report;
