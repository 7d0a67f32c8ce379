//! End-to-end tests for the learning engine over the in-memory gateway:
//! ingestion, pattern feedback, insight generation and lifecycle, reports.

use std::sync::Arc;

use adaptive_learning::learning::insight::AutomaticAction;
use adaptive_learning::*;
use chrono::{DateTime, Duration, TimeZone, Utc};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("learning=debug"))
        .with_test_writer()
        .try_init();
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 4, 9, 0, 0).unwrap()
}

fn exec(hook: &str, family: &str, path: &str, ms: f64, success: bool, at: DateTime<Utc>) -> ExecutionRecord {
    ExecutionRecord::new(HookIdentity::new(hook, family, 100), ms, success, at)
        .with_blocked(!success)
        .with_file(FileContext::from_path(path))
}

// ---------------------------------------------------------------------------
// Ingestion scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_format_check_hundred_records_confident_and_fresh() {
    init_tracing();
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    let start = Utc::now() - Duration::minutes(200);
    for i in 0..100 {
        let ms = 50.0 + i as f64; // 50..=149ms
        let success = i % 20 != 7; // 5 failures, each blocked
        engine
            .ingest(&exec("format-check", "format", "src/lib.rs", ms, success, start + Duration::minutes(i)))
            .unwrap();
    }

    for key in [
        PatternKey::new("format-check", PatternType::FileExtension, "rs"),
        PatternKey::new("format-check", PatternType::HookFamily, "format"),
    ] {
        let model = engine.gateway().load_pattern(&key).unwrap().unwrap().value;
        assert_eq!(model.total_count, 100);
        assert_eq!(model.success_count, 95);
        assert_eq!(model.block_count, 5);
        assert!(model.confidence > 0.6, "confidence {}", model.confidence);
        assert!(!model.is_stale());
        assert!((model.mean_duration_ms() - 99.5).abs() < 1e-9);
    }
}

#[test]
fn test_concurrent_ingestion_loses_no_updates() {
    let mut config = LearningConfig::default();
    config.engine.max_update_retries = 10_000;
    let engine = Arc::new(LearningEngine::new(InMemoryGateway::new(), config).unwrap());

    std::thread::scope(|s| {
        for worker in 0..4 {
            let engine = Arc::clone(&engine);
            s.spawn(move || {
                for i in 0..25 {
                    let at = t0() + Duration::seconds(worker * 100 + i);
                    engine.ingest(&exec("lint", "lint", "web/app.ts", 20.0, true, at)).unwrap();
                }
            });
        }
    });

    let key = PatternKey::new("lint", PatternType::FileExtension, "ts");
    let stored = engine.gateway().load_pattern(&key).unwrap().unwrap();
    assert_eq!(stored.value.total_count, 100);
    assert_eq!(stored.version, 100);
}

#[test]
fn test_unexpected_failure_is_outlier() {
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    for i in 0..10 {
        engine
            .ingest(&exec("lint", "lint", "a.py", 30.0, true, t0() + Duration::seconds(i)))
            .unwrap();
    }
    let report = engine
        .ingest(&exec("lint", "lint", "a.py", 30.0, false, t0() + Duration::seconds(20)))
        .unwrap();
    assert!(matches!(
        report.outlier,
        Some(adaptive_learning::learning::execution::OutlierReason::UnexpectedFailure { .. })
    ));
}

// ---------------------------------------------------------------------------
// Insight lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_pattern_refinement_apply_then_validate() {
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    let insight = Insight::new(
        InsightKind::refinement("lint/file_extension/js", "skip minified bundles", 0.3),
        0.7,
        InsightPriority::Medium,
        0.3,
        t0(),
    );
    engine.gateway().insert_insight(&insight).unwrap();

    engine.apply_insight(&insight.id, t0()).unwrap();
    let validated = engine
        .validate_insight(&insight.id, ValidationOutcome::new(ValidationVerdict::Success, t0()))
        .unwrap();
    assert_eq!(validated.status, InsightStatus::Validated);
    assert!(validated.effectiveness() > 0.0);
}

#[test]
fn test_double_apply_keeps_actions() {
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    let insight = Insight::new(InsightKind::timeout(30_000, 450), 0.9, InsightPriority::High, 0.5, t0());
    engine.gateway().insert_insight(&insight).unwrap();

    let first = engine.apply_insight(&insight.id, t0()).unwrap();
    let err = engine.apply_insight(&insight.id, t0() + Duration::minutes(5)).unwrap_err();
    assert!(matches!(err, LearningError::DomainConflict { .. }));

    let stored = engine.gateway().load_insight(&insight.id).unwrap().unwrap();
    let actions: &[AutomaticAction] = &stored.automatic_actions;
    assert_eq!(actions, first.automatic_actions.as_slice());
}

#[test]
fn test_generated_refinement_flows_into_report() {
    init_tracing();
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    for i in 0..20 {
        engine
            .ingest(&exec("lint", "lint", "dist/app.min.js", 40.0, true, t0() + Duration::seconds(i)))
            .unwrap();
    }
    let key = PatternKey::new("lint", PatternType::FileExtension, "js");
    for _ in 0..5 {
        engine.record_pattern_feedback(&key, FeedbackKind::FalsePositive, t0()).unwrap();
    }

    let generated = engine.generate_insights("lint", t0() + Duration::minutes(1)).unwrap();
    let refinement = generated
        .iter()
        .find(|i| {
            matches!(&i.kind, InsightKind::PatternRefinement { pattern_id: Some(p), .. } if p == "lint/file_extension/js")
        })
        .expect("refinement for the js pattern");
    engine.apply_insight(&refinement.id, t0() + Duration::minutes(2)).unwrap();

    let report = engine.export_report(t0() + Duration::minutes(3)).unwrap();
    assert_eq!(report.hooks.len(), 1);
    assert_eq!(report.hooks[0].executions, 20);
    assert!(report
        .recent_insights
        .iter()
        .any(|s| s.id == refinement.id && s.status == InsightStatus::Applied));
    let json = report.to_json().unwrap();
    assert!(json.contains("pattern_refinement"));
}

#[test]
fn test_cross_hook_correlation_generated() {
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    for (n, hook) in ["secrets-scan", "license-check"].into_iter().enumerate() {
        for i in 0..10 {
            let at = t0() + Duration::seconds(n as i64 * 100 + i);
            engine.ingest(&exec(hook, "security", "keys/id.pem", 25.0, i % 2 == 0, at)).unwrap();
        }
    }
    let generated = engine.generate_insights("secrets-scan", t0() + Duration::minutes(10)).unwrap();
    let correlation = generated
        .iter()
        .find(|i| {
            matches!(&i.kind, InsightKind::CrossHookCorrelation { shared_patterns, .. }
                if shared_patterns.iter().any(|p| p == "file_extension:pem"))
        })
        .expect("correlation over .pem");
    match &correlation.kind {
        InsightKind::CrossHookCorrelation { hooks, .. } => {
            assert_eq!(hooks, &vec!["license-check".to_string(), "secrets-scan".to_string()]);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_expired_insight_cannot_be_applied() {
    let engine = LearningEngine::with_defaults(InMemoryGateway::new());
    let insight = Insight::new(InsightKind::alert(0.6, "24h", "pin toolchain"), 0.05, InsightPriority::High, 0.2, t0());
    engine.gateway().insert_insight(&insight).unwrap();
    assert_eq!(engine.expire_insights(t0()).unwrap(), vec![insight.id.clone()]);
    assert!(matches!(
        engine.apply_insight(&insight.id, t0()),
        Err(LearningError::DomainConflict { .. })
    ));
}
