//! Integration tests for the iteration controller
//!
//! Drives full stage commits against an in-memory SQLite store.

use pretty_assertions::assert_eq;
use serde_json::json;

use alpha_research::controller::{AlphaCandidate, ResearchController, StageOutput, ThreadPhase};
use alpha_research::error::{AppError, ValidationError};
use alpha_research::expression::ExpressionValidator;
use alpha_research::storage::{EvaluationRecord, HypothesisFields, ResearchStore, SqliteStorage};

async fn create_controller() -> ResearchController<SqliteStorage> {
    let storage = SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage");
    ResearchController::new(storage, ExpressionValidator::standard())
}

#[tokio::test]
async fn test_full_iteration_round_trip() {
    let controller = create_controller().await;

    let summary = controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default()
                .with_hypothesis(HypothesisFields::new("trend", "momentum persists")),
        )
        .await
        .unwrap();
    assert_eq!(summary.hypothesis.as_ref().unwrap().iteration, 0);

    let summary = controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default().with_alpha(AlphaCandidate::new("a1", "log(close/open)")),
        )
        .await
        .unwrap();
    assert_eq!(summary.persisted_alphas.len(), 1);
    let decomposition = summary.persisted_alphas[0].decomposition.as_ref().unwrap();
    assert_eq!(decomposition.variables, vec!["close", "open"]);
    assert!(decomposition.indicators.is_empty());

    let summary = controller
        .commit_stage(
            "T1",
            "C2",
            StageOutput::default().with_evaluation(EvaluationRecord::new("a1").with_metric("ir", 1.2)),
        )
        .await
        .unwrap();
    assert_eq!(summary.evaluations.len(), 1);
    assert!(summary.skipped_evaluations.is_empty());

    let history = controller.store().read_history("T1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].hypothesis.iteration, 0);
    assert_eq!(history[0].alphas.len(), 1);
    assert_eq!(history[0].alphas[0].alpha.alpha_identifier, "a1");
    assert_eq!(history[0].alphas[0].evaluations.len(), 1);
    assert_eq!(
        history[0].alphas[0].evaluations[0].metrics.information_ratio,
        1.2
    );
}

#[tokio::test]
async fn test_unknown_symbol_alpha_is_rejected_not_stored() {
    let controller = create_controller().await;
    controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default().with_hypothesis(HypothesisFields::new("idea", "s")),
        )
        .await
        .unwrap();

    let summary = controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default().with_alpha(AlphaCandidate::new("a2", "foo(close)")),
        )
        .await
        .unwrap();

    assert!(summary.persisted_alphas.is_empty());
    assert_eq!(summary.rejected_alphas.len(), 1);
    assert_eq!(
        summary.rejected_alphas[0].error,
        ValidationError::UnknownSymbol {
            symbol: "foo".to_string()
        }
    );

    let history = controller.store().read_history("T1").await.unwrap();
    assert!(history[0].alphas.is_empty());
}

#[tokio::test]
async fn test_partial_commit_persists_valid_siblings() {
    let controller = create_controller().await;

    let output = StageOutput::default()
        .with_hypothesis(HypothesisFields::new("idea", "volume leads price"))
        .with_alpha(AlphaCandidate::new("a1", "correlation(close, volume, 20)"))
        .with_alpha(AlphaCandidate::new("a2", "SMA(close, 5) - momentum(close, 10)"))
        .with_alpha(AlphaCandidate::new("a3", "sqrt(volume) * RSI(close, 14)"));

    let summary = controller.commit_stage("T1", "C1", output).await.unwrap();

    let persisted: Vec<&str> = summary
        .persisted_alphas
        .iter()
        .map(|a| a.alpha_identifier.as_str())
        .collect();
    assert_eq!(persisted, vec!["a1", "a3"]);
    assert_eq!(summary.rejected_alphas.len(), 1);
    assert_eq!(summary.rejected_alphas[0].alpha_identifier.as_deref(), Some("a2"));
    assert_eq!(
        summary.rejected_alphas[0].error,
        ValidationError::UnknownSymbol {
            symbol: "momentum".to_string()
        }
    );

    let history = controller.store().read_history("T1").await.unwrap();
    assert_eq!(history.len(), 1);
    let stored: Vec<&str> = history[0]
        .alphas
        .iter()
        .map(|a| a.alpha.alpha_identifier.as_str())
        .collect();
    assert_eq!(stored, vec!["a1", "a3"]);
}

#[tokio::test]
async fn test_deeply_nested_alpha_is_rejected() {
    let controller = create_controller().await;

    let nested = format!("{}close{}", "(".repeat(5000), ")".repeat(5000));
    let output = StageOutput::default()
        .with_hypothesis(HypothesisFields::new("idea", "s"))
        .with_alpha(AlphaCandidate::new("a1", nested))
        .with_alpha(AlphaCandidate::new("a2", "close - open"));

    let summary = controller.commit_stage("T1", "C1", output).await.unwrap();
    assert_eq!(summary.persisted_alphas.len(), 1);
    assert_eq!(summary.rejected_alphas.len(), 1);
    assert!(matches!(
        summary.rejected_alphas[0].error,
        ValidationError::Syntax { .. }
    ));
}

#[tokio::test]
async fn test_recommitting_a_stage_is_idempotent() {
    let controller = create_controller().await;

    let output = StageOutput::default()
        .with_hypothesis(HypothesisFields::new("idea", "s"))
        .with_alpha(AlphaCandidate::new("a1", "close - open"));

    let first = controller
        .commit_stage("T1", "C1", output.clone())
        .await
        .unwrap();
    let second = controller.commit_stage("T1", "C1", output).await.unwrap();

    assert_eq!(first.hypothesis.unwrap().id, second.hypothesis.unwrap().id);
    assert_eq!(first.persisted_alphas.len(), 1);
    assert!(second.persisted_alphas.is_empty());
    assert_eq!(second.duplicate_alphas, vec!["a1".to_string()]);
}

#[tokio::test]
async fn test_alphas_without_hypothesis_fail_stage() {
    let controller = create_controller().await;

    let err = controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default().with_alpha(AlphaCandidate::new("a1", "close")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Stage { .. }));
    assert!(controller.store().read_history("T1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_prepare_context_follows_latest_iteration() {
    let controller = create_controller().await;

    let context = controller.prepare_context("T1").await.unwrap();
    assert!(context.first_iteration);

    controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default()
                .with_hypothesis(
                    HypothesisFields::new("idea", "first").with_reasoning("initial guess"),
                )
                .with_alpha(AlphaCandidate::new("a1", "close / open").with_description("gap")),
        )
        .await
        .unwrap();
    controller
        .commit_stage(
            "T1",
            "C2",
            StageOutput::default()
                .with_evaluation(EvaluationRecord::new("a1").with_metric("ir", 0.3))
                .with_evaluation(
                    EvaluationRecord::new("a1")
                        .with_metric("ir", 0.9)
                        .best_so_far(),
                ),
        )
        .await
        .unwrap();

    let context = controller.prepare_context("T1").await.unwrap();
    assert!(!context.first_iteration);
    assert_eq!(context.hypothesis.as_deref(), Some("first"));
    assert_eq!(context.reasoning.as_deref(), Some("initial guess"));
    assert_eq!(context.alphas.len(), 1);
    assert_eq!(context.alphas[0].description, "gap");
    let latest = context.alphas[0].latest_evaluation.as_ref().unwrap();
    assert_eq!(latest.metrics.information_ratio, 0.9);
    assert!(latest.best_so_far);

    let text = context.factor_history();
    assert!(text.contains("- a1: close / open (gap) | IR 0.900"));
    assert!(text.contains("[best so far]"));

    // A new hypothesis starts the next iteration with no alphas yet.
    controller
        .commit_stage(
            "T1",
            "C3",
            StageOutput::default().with_hypothesis(HypothesisFields::new("idea", "second")),
        )
        .await
        .unwrap();
    let context = controller.prepare_context("T1").await.unwrap();
    assert_eq!(context.iteration, Some(1));
    assert!(context.alphas.is_empty());
}

#[tokio::test]
async fn test_thread_phase_walks_the_loop() {
    let controller = create_controller().await;
    assert_eq!(controller.phase("T1").await.unwrap(), ThreadPhase::NotStarted);

    controller
        .commit_stage(
            "T1",
            "C1",
            StageOutput::default().with_hypothesis(HypothesisFields::new("idea", "s")),
        )
        .await
        .unwrap();
    assert_eq!(
        controller.phase("T1").await.unwrap(),
        ThreadPhase::HasHypothesis(0)
    );

    controller
        .commit_stage(
            "T1",
            "C2",
            StageOutput::default().with_alpha(AlphaCandidate::new("a1", "EMA(close, 12)")),
        )
        .await
        .unwrap();
    assert_eq!(controller.phase("T1").await.unwrap(), ThreadPhase::HasAlphas(0));

    controller
        .commit_stage(
            "T1",
            "C3",
            StageOutput::default().with_evaluation(EvaluationRecord::new("a1")),
        )
        .await
        .unwrap();
    assert_eq!(
        controller.phase("T1").await.unwrap(),
        ThreadPhase::HasEvaluations(0)
    );

    controller
        .commit_stage(
            "T1",
            "C4",
            StageOutput::default().with_hypothesis(HypothesisFields::new("idea", "next")),
        )
        .await
        .unwrap();
    assert_eq!(
        controller.phase("T1").await.unwrap(),
        ThreadPhase::HasHypothesis(1)
    );
}

#[tokio::test]
async fn test_stage_output_from_json() {
    let controller = create_controller().await;

    let output: StageOutput = serde_json::from_value(json!({
        "hypothesis": {
            "trading_idea": "volatility",
            "hypothesis": "range expansion predicts returns",
            "reason": "breakouts"
        },
        "alphas": [
            {"alphaID": "v1", "expr": "ATR(high, low, close, 14) / close", "desc": "normalised range"},
            {"expr": "BollingerBandsWidth(close, 20, 2)"}
        ]
    }))
    .unwrap();

    let summary = controller.commit_stage("T9", "C1", output).await.unwrap();
    assert_eq!(
        summary.hypothesis.unwrap().fields.statement,
        "range expansion predicts returns"
    );
    assert_eq!(summary.persisted_alphas.len(), 2);
    assert_eq!(summary.persisted_alphas[0].alpha_identifier, "v1");
    assert_eq!(summary.persisted_alphas[0].description, "normalised range");
    // Generated identifier for the anonymous candidate.
    assert!(uuid::Uuid::parse_str(&summary.persisted_alphas[1].alpha_identifier).is_ok());
}
