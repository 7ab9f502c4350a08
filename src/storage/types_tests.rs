//! Unit tests for storage types and builder patterns.
//!
//! Covers metric coercion, payload aliases accepted from stage output, and
//! the serialized shape of nested history records.

use super::*;
use pretty_assertions::assert_eq;
use serde_json::json;

// ============================================================================
// HypothesisFields tests
// ============================================================================

#[test]
fn test_hypothesis_fields_builder() {
    let fields = HypothesisFields::new("momentum", "short-term momentum persists")
        .with_reasoning("trend followers pile in")
        .with_concise_reason("herding")
        .with_concise("prices trend", "behavioural bias", "momentum decays");

    assert_eq!(fields.idea, "momentum");
    assert_eq!(fields.statement, "short-term momentum persists");
    assert_eq!(fields.reasoning, "trend followers pile in");
    assert_eq!(fields.concise_reason, "herding");
    assert_eq!(fields.concise_observation, "prices trend");
    assert_eq!(fields.concise_justification, "behavioural bias");
    assert_eq!(fields.concise_knowledge, "momentum decays");
}

#[test]
fn test_hypothesis_fields_accepts_stage_names() {
    let fields: HypothesisFields = serde_json::from_value(json!({
        "trading_idea": "mean reversion",
        "hypothesis": "gaps close within a day",
        "reason": "liquidity providers fade gaps",
        "concise_knowledge": "gaps revert"
    }))
    .unwrap();

    assert_eq!(fields.idea, "mean reversion");
    assert_eq!(fields.statement, "gaps close within a day");
    assert_eq!(fields.reasoning, "liquidity providers fade gaps");
    assert_eq!(fields.concise_knowledge, "gaps revert");
    assert!(fields.concise_observation.is_empty());
}

// ============================================================================
// NewAlpha tests
// ============================================================================

#[test]
fn test_new_alpha_builder() {
    let alpha = NewAlpha::new("A1", "RSI(close, 14)")
        .with_description("oversold")
        .with_implementation("df['close'].rolling(14)")
        .with_decomposition(Decomposition {
            variables: vec!["close".to_string()],
            indicators: vec!["RSI".to_string()],
            operations: vec!["call".to_string()],
        });

    assert_eq!(alpha.alpha_identifier, "A1");
    assert_eq!(alpha.expression, "RSI(close, 14)");
    assert_eq!(alpha.description, "oversold");
    assert!(alpha.implementation.is_some());
    assert_eq!(alpha.decomposition.unwrap().indicators, vec!["RSI"]);
}

#[test]
fn test_generate_alpha_identifier_is_unique() {
    let a = generate_alpha_identifier();
    let b = generate_alpha_identifier();
    assert_ne!(a, b);
    assert!(uuid::Uuid::parse_str(&a).is_ok());
}

// ============================================================================
// Metric coercion tests
// ============================================================================

#[test]
fn test_coerce_metric_numbers_and_strings() {
    assert_eq!(coerce_metric(Some(&json!(1.25))), 1.25);
    assert_eq!(coerce_metric(Some(&json!(3))), 3.0);
    assert_eq!(coerce_metric(Some(&json!(" -0.5 "))), -0.5);
    assert_eq!(coerce_metric(Some(&json!(true))), 1.0);
}

#[test]
fn test_coerce_metric_defaults_to_zero() {
    assert_eq!(coerce_metric(None), 0.0);
    assert_eq!(coerce_metric(Some(&json!(null))), 0.0);
    assert_eq!(coerce_metric(Some(&json!("n/a"))), 0.0);
    assert_eq!(coerce_metric(Some(&json!("NaN"))), 0.0);
    assert_eq!(coerce_metric(Some(&json!([1, 2]))), 0.0);
    assert_eq!(coerce_metric(Some(&json!({"v": 1}))), 0.0);
}

#[test]
fn test_evaluation_metrics_from_values() {
    let values = json!({
        "information_ratio": "0.8",
        "annualized_return": 0.12,
        "max_drawdown": -0.2,
        "sharpe": 1.1
    });
    let metrics = EvaluationMetrics::from_values(values.as_object().unwrap());

    assert_eq!(
        metrics,
        EvaluationMetrics {
            information_ratio: 0.8,
            annualized_return: 0.12,
            max_drawdown: -0.2,
            ic: 0.0,
        }
    );
}

#[test]
fn test_evaluation_metrics_ir_alias() {
    let values = json!({ "ir": 1.5, "ic": 0.03 });
    let metrics = EvaluationMetrics::from_values(values.as_object().unwrap());
    assert_eq!(metrics.information_ratio, 1.5);
    assert_eq!(metrics.ic, 0.03);

    // The full name wins over the alias.
    let values = json!({ "ir": 1.5, "information_ratio": 2.0 });
    let metrics = EvaluationMetrics::from_values(values.as_object().unwrap());
    assert_eq!(metrics.information_ratio, 2.0);
}

#[test]
fn test_coerce_metrics_keeps_every_name() {
    let values = json!({
        "sharpe": 2.5,
        "turnover": "0.4",
        "ir": "n/a",
        "max_drawdown": -0.2
    });
    let coerced = coerce_metrics(values.as_object().unwrap());

    let expected: BTreeMap<String, f64> = [
        ("ir".to_string(), 0.0),
        ("max_drawdown".to_string(), -0.2),
        ("sharpe".to_string(), 2.5),
        ("turnover".to_string(), 0.4),
    ]
    .into_iter()
    .collect();
    assert_eq!(coerced, expected);
}

// ============================================================================
// EvaluationRecord tests
// ============================================================================

#[test]
fn test_evaluation_record_builder() {
    let record = EvaluationRecord::new("A1")
        .with_metric("ic", 0.04)
        .with_payload(json!({"curve": [1, 2, 3]}))
        .best_so_far();

    assert_eq!(record.alpha_identifier, "A1");
    assert_eq!(record.metrics.get("ic"), Some(&json!(0.04)));
    assert_eq!(record.full_payload["curve"], json!([1, 2, 3]));
    assert!(record.best_so_far);
}

#[test]
fn test_evaluation_record_accepts_stage_names() {
    let record: EvaluationRecord = serde_json::from_value(json!({
        "alphaID": "A7",
        "is_sota": true,
        "backtest_results": {"ir": 0.3},
        "metrics": {"ir": 0.3}
    }))
    .unwrap();

    assert_eq!(record.alpha_identifier, "A7");
    assert!(record.best_so_far);
    assert_eq!(record.full_payload, json!({"ir": 0.3}));
}

#[test]
fn test_evaluation_record_defaults() {
    let record: EvaluationRecord = serde_json::from_value(json!({ "alpha_id": "A1" })).unwrap();
    assert!(!record.best_so_far);
    assert!(record.metrics.is_empty());
    assert!(record.full_payload.is_null());
}

// ============================================================================
// History serialization tests
// ============================================================================

#[test]
fn test_history_record_serializes_flat() {
    let created_at = Utc::now();
    let record = HypothesisRecord {
        hypothesis: Hypothesis {
            id: 1,
            thread_id: "T1".to_string(),
            checkpoint_id: "C1".to_string(),
            fields: HypothesisFields::new("idea", "statement"),
            iteration: 0,
            created_at,
        },
        alphas: vec![AlphaRecord {
            alpha: Alpha {
                id: 3,
                thread_id: "T1".to_string(),
                checkpoint_id: "C1".to_string(),
                hypothesis_id: 1,
                alpha_identifier: "A1".to_string(),
                expression: "close / open".to_string(),
                description: String::new(),
                implementation: None,
                decomposition: None,
                created_at,
            },
            evaluations: vec![EvaluationResult {
                id: 9,
                thread_id: "T1".to_string(),
                checkpoint_id: "C2".to_string(),
                alpha_id: 3,
                best_so_far: true,
                metrics: EvaluationMetrics {
                    information_ratio: 0.5,
                    ..Default::default()
                },
                all_metrics: [
                    ("information_ratio".to_string(), 0.5),
                    ("sharpe".to_string(), 1.5),
                ]
                .into_iter()
                .collect(),
                full_payload: json!(null),
                created_at,
            }],
        }],
    };

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["statement"], "statement");
    assert_eq!(value["iteration"], 0);
    assert_eq!(value["alphas"][0]["alpha_identifier"], "A1");
    assert_eq!(value["alphas"][0]["evaluations"][0]["information_ratio"], 0.5);
    assert_eq!(value["alphas"][0]["evaluations"][0]["best_so_far"], true);
    assert_eq!(
        value["alphas"][0]["evaluations"][0]["all_metrics"]["sharpe"],
        1.5
    );
}
