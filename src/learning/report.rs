//! # Stage: Reporting
//!
//! Read-only exports built from stored patterns and insights: per-hook
//! effectiveness, the most frequently blocking patterns, and the latest
//! insights. [`LearningReport`] serializes to JSON and renders as plain text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::insight::{Insight, InsightPriority, InsightStatus};
use super::pattern::{PatternModel, PatternType};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSummary {
    pub hook_name: String,
    /// Executions ingested for the hook (every record yields exactly one
    /// hook-family observation).
    pub executions: u64,
    pub block_rate: f64,
    pub pattern_count: usize,
    pub stale_patterns: usize,
    pub mean_confidence: f64,
    pub mean_effectiveness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedPattern {
    pub hook_name: String,
    pub pattern_type: PatternType,
    pub pattern_key: String,
    pub block_count: u64,
    pub block_rate: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSummary {
    pub id: String,
    pub kind: String,
    pub hook_name: Option<String>,
    pub status: InsightStatus,
    pub priority: InsightPriority,
    pub confidence: f64,
    pub effectiveness: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub generated_at: DateTime<Utc>,
    pub hooks: Vec<HookSummary>,
    pub top_blocked_patterns: Vec<BlockedPattern>,
    pub recent_insights: Vec<InsightSummary>,
}

fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

impl HookSummary {
    pub fn from_patterns(hook_name: impl Into<String>, patterns: &[PatternModel], now: DateTime<Utc>) -> Self {
        let family: Vec<&PatternModel> =
            patterns.iter().filter(|m| m.key.pattern_type == PatternType::HookFamily).collect();
        let executions: u64 = family.iter().map(|m| m.total_count).sum();
        let blocked: u64 = family.iter().map(|m| m.block_count).sum();
        Self {
            hook_name: hook_name.into(),
            executions,
            block_rate: if executions == 0 { 0.0 } else { blocked as f64 / executions as f64 },
            pattern_count: patterns.len(),
            stale_patterns: patterns.iter().filter(|m| m.is_stale_at(now)).count(),
            mean_confidence: mean_of(patterns.iter().map(|m| m.confidence_at(now))),
            mean_effectiveness: mean_of(patterns.iter().map(|m| m.effectiveness_at(now))),
        }
    }
}

impl From<&Insight> for InsightSummary {
    fn from(i: &Insight) -> Self {
        Self {
            id: i.id.clone(),
            kind: i.kind.type_name().to_string(),
            hook_name: i.hook_name.clone(),
            status: i.status,
            priority: i.priority,
            confidence: i.confidence,
            effectiveness: i.effectiveness(),
            created_at: i.created_at,
        }
    }
}

impl LearningReport {
    /// `patterns_by_hook` pairs each hook with all of its stored patterns.
    pub fn build(
        patterns_by_hook: &[(String, Vec<PatternModel>)],
        insights: &[Insight],
        now: DateTime<Utc>,
        top_blocked: usize,
    ) -> Self {
        let hooks = patterns_by_hook
            .iter()
            .map(|(hook, patterns)| HookSummary::from_patterns(hook.clone(), patterns, now))
            .collect();

        // Family/priority/time patterns block whenever the hook blocks; they
        // say nothing about what was blocked.
        let mut blocked: Vec<BlockedPattern> = patterns_by_hook
            .iter()
            .flat_map(|(_, patterns)| patterns.iter())
            .filter(|m| m.block_count > 0)
            .filter(|m| {
                matches!(
                    m.key.pattern_type,
                    PatternType::FilePath | PatternType::FileExtension | PatternType::ContentHash
                )
            })
            .map(|m| BlockedPattern {
                hook_name: m.key.hook_name.clone(),
                pattern_type: m.key.pattern_type,
                pattern_key: m.key.pattern_key.clone(),
                block_count: m.block_count,
                block_rate: m.block_rate(),
                confidence: m.confidence_at(now),
            })
            .collect();
        blocked.sort_by(|a, b| {
            b.block_count
                .cmp(&a.block_count)
                .then_with(|| b.block_rate.total_cmp(&a.block_rate))
                .then_with(|| a.hook_name.cmp(&b.hook_name))
                .then_with(|| a.pattern_key.cmp(&b.pattern_key))
        });
        blocked.truncate(top_blocked);

        Self {
            generated_at: now,
            hooks,
            top_blocked_patterns: blocked,
            recent_insights: insights.iter().map(InsightSummary::from).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for LearningReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "learning report @ {}", self.generated_at.to_rfc3339())?;
        writeln!(f, "hooks:")?;
        for h in &self.hooks {
            writeln!(
                f,
                "  {:<24} runs={:<6} blocked={:>5.1}% patterns={} stale={} confidence={:.2} effectiveness={:.2}",
                h.hook_name,
                h.executions,
                h.block_rate * 100.0,
                h.pattern_count,
                h.stale_patterns,
                h.mean_confidence,
                h.mean_effectiveness
            )?;
        }
        writeln!(f, "top blocked patterns:")?;
        for b in &self.top_blocked_patterns {
            writeln!(
                f,
                "  {}/{}/{} blocks={} rate={:.2}",
                b.hook_name, b.pattern_type, b.pattern_key, b.block_count, b.block_rate
            )?;
        }
        writeln!(f, "recent insights:")?;
        for i in &self.recent_insights {
            writeln!(
                f,
                "  [{}] {} {} ({:?}) confidence={:.2}",
                i.status,
                i.kind,
                i.hook_name.as_deref().unwrap_or("-"),
                i.priority,
                i.confidence
            )?;
        }
        Ok(())
    }
}
