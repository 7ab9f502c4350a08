//! Research record storage.
//!
//! Three append-only entity kinds are persisted per research thread:
//! [`Hypothesis`] (one per thread and checkpoint), [`Alpha`] (many per
//! hypothesis) and [`EvaluationResult`] (many per alpha). The
//! [`ResearchStore`] trait is the seam the iteration controller talks to;
//! [`SqliteStorage`] is the durable implementation.

mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use sqlite::SqliteStorage;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// Hypothesis content produced by the hypothesis stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypothesisFields {
    /// Originating research idea.
    #[serde(alias = "trading_idea")]
    pub idea: String,
    /// The hypothesis statement.
    #[serde(alias = "hypothesis")]
    pub statement: String,
    /// Free-form reasoning behind the statement.
    #[serde(alias = "reason")]
    pub reasoning: String,
    pub concise_reason: String,
    pub concise_observation: String,
    pub concise_justification: String,
    /// Transferable knowledge summary.
    pub concise_knowledge: String,
}

impl HypothesisFields {
    pub fn new(idea: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            idea: idea.into(),
            statement: statement.into(),
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_concise(
        mut self,
        observation: impl Into<String>,
        justification: impl Into<String>,
        knowledge: impl Into<String>,
    ) -> Self {
        self.concise_observation = observation.into();
        self.concise_justification = justification.into();
        self.concise_knowledge = knowledge.into();
        self
    }

    pub fn with_concise_reason(mut self, reason: impl Into<String>) -> Self {
        self.concise_reason = reason.into();
        self
    }
}

/// A stored hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Row identifier.
    pub id: i64,
    pub thread_id: String,
    pub checkpoint_id: String,
    #[serde(flatten)]
    pub fields: HypothesisFields,
    /// Position in the thread, starting at 0.
    pub iteration: i64,
    pub created_at: DateTime<Utc>,
}

/// Structural components stored alongside a validated alpha.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub variables: Vec<String>,
    pub indicators: Vec<String>,
    /// Operation kinds, one per occurrence.
    pub operations: Vec<String>,
}

/// An alpha ready to be written under a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlpha {
    pub alpha_identifier: String,
    pub expression: String,
    pub description: String,
    pub implementation: Option<String>,
    pub decomposition: Option<Decomposition>,
}

impl NewAlpha {
    pub fn new(alpha_identifier: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            alpha_identifier: alpha_identifier.into(),
            expression: expression.into(),
            description: String::new(),
            implementation: None,
            decomposition: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = Some(implementation.into());
        self
    }

    pub fn with_decomposition(mut self, decomposition: Decomposition) -> Self {
        self.decomposition = Some(decomposition);
        self
    }
}

/// A stored alpha.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alpha {
    /// Row identifier.
    pub id: i64,
    pub thread_id: String,
    pub checkpoint_id: String,
    /// Owning hypothesis row.
    pub hypothesis_id: i64,
    /// Caller-supplied identifier, unique within the hypothesis.
    pub alpha_identifier: String,
    pub expression: String,
    pub description: String,
    pub implementation: Option<String>,
    pub decomposition: Option<Decomposition>,
    pub created_at: DateTime<Utc>,
}

/// Named scalar performance metrics of one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub information_ratio: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    /// Information coefficient.
    pub ic: f64,
}

impl EvaluationMetrics {
    /// Build from loosely typed values. Missing or non-numeric entries become
    /// zero; numeric strings are parsed. `ir` is accepted for
    /// `information_ratio`.
    pub fn from_values(values: &serde_json::Map<String, serde_json::Value>) -> Self {
        let information_ratio = values
            .get("information_ratio")
            .or_else(|| values.get("ir"));

        Self {
            information_ratio: coerce_metric(information_ratio),
            annualized_return: coerce_metric(values.get("annualized_return")),
            max_drawdown: coerce_metric(values.get("max_drawdown")),
            ic: coerce_metric(values.get("ic")),
        }
    }
}

/// Coerce every supplied metric with [`coerce_metric`], keeping the caller's
/// names.
pub fn coerce_metrics(
    values: &serde_json::Map<String, serde_json::Value>,
) -> BTreeMap<String, f64> {
    values
        .iter()
        .map(|(name, value)| (name.clone(), coerce_metric(Some(value))))
        .collect()
}

/// Coerce a metric value to `f64`, defaulting to zero.
pub fn coerce_metric(value: Option<&serde_json::Value>) -> f64 {
    let coerced = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    coerced.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// An evaluation as reported by the external evaluation service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Identifier of the evaluated alpha within the thread.
    #[serde(alias = "alphaID", alias = "alpha_id")]
    pub alpha_identifier: String,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
    #[serde(default, alias = "backtest_results")]
    pub full_payload: serde_json::Value,
    #[serde(default, alias = "is_sota")]
    pub best_so_far: bool,
}

impl EvaluationRecord {
    pub fn new(alpha_identifier: impl Into<String>) -> Self {
        Self {
            alpha_identifier: alpha_identifier.into(),
            ..Default::default()
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.full_payload = payload;
        self
    }

    pub fn best_so_far(mut self) -> Self {
        self.best_so_far = true;
        self
    }
}

/// A stored evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Row identifier.
    pub id: i64,
    pub thread_id: String,
    pub checkpoint_id: String,
    /// Owning alpha row.
    pub alpha_id: i64,
    /// Caller's mark; the store does not keep it unique.
    pub best_so_far: bool,
    #[serde(flatten)]
    pub metrics: EvaluationMetrics,
    /// Every reported metric, including the named ones above.
    #[serde(default)]
    pub all_metrics: BTreeMap<String, f64>,
    pub full_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An alpha with its evaluations, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaRecord {
    #[serde(flatten)]
    pub alpha: Alpha,
    pub evaluations: Vec<EvaluationResult>,
}

/// A hypothesis with its alphas, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisRecord {
    #[serde(flatten)]
    pub hypothesis: Hypothesis,
    pub alphas: Vec<AlphaRecord>,
}

/// Identifier for an alpha submitted without one.
pub fn generate_alpha_identifier() -> String {
    Uuid::new_v4().to_string()
}

/// Storage trait for research records.
///
/// Every method is one atomic unit of work: a failed call leaves nothing
/// behind that a later read could observe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResearchStore: Send + Sync {
    // Hypotheses

    /// Return the hypothesis stored for (thread, checkpoint), or insert one
    /// with the thread's next iteration number.
    async fn upsert_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        fields: &HypothesisFields,
    ) -> StorageResult<Hypothesis>;
    /// Get the hypothesis stored for (thread, checkpoint).
    async fn find_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> StorageResult<Option<Hypothesis>>;
    /// Get the thread's hypothesis with the highest iteration.
    async fn latest_hypothesis(&self, thread_id: &str) -> StorageResult<Option<Hypothesis>>;
    /// Get all hypotheses of a thread ordered by iteration.
    async fn hypotheses_for_thread(&self, thread_id: &str) -> StorageResult<Vec<Hypothesis>>;

    // Alphas

    /// Insert alphas not yet stored under the hypothesis; returns only the
    /// newly inserted rows.
    async fn upsert_alphas(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        hypothesis_id: i64,
        alphas: &[NewAlpha],
    ) -> StorageResult<Vec<Alpha>>;
    /// Get a hypothesis' alphas in insertion order.
    async fn alphas_for_hypothesis(&self, hypothesis_id: i64) -> StorageResult<Vec<Alpha>>;

    // Evaluations

    /// Record an evaluation for the alpha named by the record. Returns `None`
    /// when the thread has no such alpha.
    async fn record_evaluation(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        record: &EvaluationRecord,
    ) -> StorageResult<Option<EvaluationResult>>;
    /// Get an alpha's evaluations in insertion order.
    async fn evaluations_for_alpha(&self, alpha_id: i64) -> StorageResult<Vec<EvaluationResult>>;

    // History

    /// The thread's full nested history, hypotheses by iteration ascending.
    async fn read_history(&self, thread_id: &str) -> StorageResult<Vec<HypothesisRecord>>;
}
