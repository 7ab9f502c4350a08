//! Iteration controller.
//!
//! Sits between the stage pipeline and the record store. Before a stage runs,
//! [`ResearchController::prepare_context`] reconstructs what the previous
//! iteration of the thread produced. After a stage runs,
//! [`ResearchController::commit_stage`] validates and persists its output
//! under the thread and checkpoint it ran at.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, ValidationError};
use crate::expression::{DecomposedExpression, ExpressionValidator};
use crate::storage::{
    generate_alpha_identifier, Alpha, Decomposition, EvaluationRecord, EvaluationResult,
    Hypothesis, HypothesisFields, HypothesisRecord, NewAlpha, ResearchStore,
};

/// Metrics already printed in the fixed part of a factor history line.
const NAMED_METRICS: [&str; 5] = [
    "information_ratio",
    "ir",
    "annualized_return",
    "max_drawdown",
    "ic",
];

/// A candidate alpha as emitted by the generation stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlphaCandidate {
    /// Generated when absent.
    #[serde(default, alias = "alphaID", alias = "alpha_id")]
    pub alpha_identifier: Option<String>,
    #[serde(default, alias = "expr")]
    pub expression: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default, alias = "code")]
    pub implementation: Option<String>,
}

impl AlphaCandidate {
    pub fn new(alpha_identifier: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            alpha_identifier: Some(alpha_identifier.into()),
            expression: expression.into(),
            ..Default::default()
        }
    }

    /// A candidate without an identifier.
    pub fn anonymous(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            ..Default::default()
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
}

/// Output of one pipeline stage, committed as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOutput {
    pub hypothesis: Option<HypothesisFields>,
    pub alphas: Vec<AlphaCandidate>,
    pub evaluations: Vec<EvaluationRecord>,
}

impl StageOutput {
    pub fn with_hypothesis(mut self, fields: HypothesisFields) -> Self {
        self.hypothesis = Some(fields);
        self
    }

    pub fn with_alpha(mut self, alpha: AlphaCandidate) -> Self {
        self.alphas.push(alpha);
        self
    }

    pub fn with_evaluation(mut self, record: EvaluationRecord) -> Self {
        self.evaluations.push(record);
        self
    }
}

/// An alpha that failed validation and was not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAlpha {
    pub alpha_identifier: Option<String>,
    pub expression: String,
    pub error: ValidationError,
}

/// What a stage commit did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// The hypothesis written or found for this checkpoint, if the stage
    /// carried one.
    pub hypothesis: Option<Hypothesis>,
    /// Newly inserted alphas.
    pub persisted_alphas: Vec<Alpha>,
    /// Identifiers of valid alphas that were already stored.
    pub duplicate_alphas: Vec<String>,
    pub rejected_alphas: Vec<RejectedAlpha>,
    pub evaluations: Vec<EvaluationResult>,
    /// Alpha identifiers of evaluations that named no stored alpha.
    pub skipped_evaluations: Vec<String>,
}

/// A prior alpha as shown to the next iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAlpha {
    pub alpha_identifier: String,
    pub expression: String,
    pub description: String,
    /// Most recently recorded evaluation.
    pub latest_evaluation: Option<EvaluationResult>,
}

/// Material from the previous iteration of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchContext {
    pub thread_id: String,
    pub first_iteration: bool,
    /// Iteration of the hypothesis the context was built from.
    pub iteration: Option<i64>,
    pub hypothesis: Option<String>,
    pub reasoning: Option<String>,
    pub alphas: Vec<PriorAlpha>,
}

impl ResearchContext {
    fn first(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            first_iteration: true,
            iteration: None,
            hypothesis: None,
            reasoning: None,
            alphas: Vec::new(),
        }
    }

    fn from_record(thread_id: &str, record: &HypothesisRecord) -> Self {
        let alphas = record
            .alphas
            .iter()
            .map(|a| PriorAlpha {
                alpha_identifier: a.alpha.alpha_identifier.clone(),
                expression: a.alpha.expression.clone(),
                description: a.alpha.description.clone(),
                latest_evaluation: a.evaluations.last().cloned(),
            })
            .collect();

        Self {
            thread_id: thread_id.to_string(),
            first_iteration: false,
            iteration: Some(record.hypothesis.iteration),
            hypothesis: Some(record.hypothesis.fields.statement.clone()),
            reasoning: Some(record.hypothesis.fields.reasoning.clone()),
            alphas,
        }
    }

    /// Prior alphas and their performance as plain text, one line per alpha.
    /// Empty on the first iteration.
    pub fn factor_history(&self) -> String {
        if self.first_iteration {
            return String::new();
        }

        let mut out = String::new();
        if let (Some(iteration), Some(hypothesis)) = (self.iteration, &self.hypothesis) {
            out.push_str(&format!("Iteration {} hypothesis: {}\n", iteration, hypothesis));
        }
        if let Some(reasoning) = self.reasoning.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!("Reasoning: {}\n", reasoning));
        }
        if self.alphas.is_empty() {
            out.push_str("No alpha factors were produced.\n");
            return out;
        }

        out.push_str("Alpha factors:\n");
        for alpha in &self.alphas {
            out.push_str(&format!("- {}: {}", alpha.alpha_identifier, alpha.expression));
            if !alpha.description.is_empty() {
                out.push_str(&format!(" ({})", alpha.description));
            }
            match &alpha.latest_evaluation {
                Some(eval) => {
                    let m = &eval.metrics;
                    out.push_str(&format!(
                        " | IR {:.3}, annualized return {:.3}, max drawdown {:.3}, IC {:.3}",
                        m.information_ratio, m.annualized_return, m.max_drawdown, m.ic
                    ));
                    for (name, value) in &eval.all_metrics {
                        if !NAMED_METRICS.contains(&name.as_str()) {
                            out.push_str(&format!(", {} {:.3}", name, value));
                        }
                    }
                    if eval.best_so_far {
                        out.push_str(" [best so far]");
                    }
                }
                None => out.push_str(" | not evaluated"),
            }
            out.push('\n');
        }
        out
    }
}

/// Where a thread is in its research loop. There is no terminal phase; an
/// evaluated iteration is followed by the next hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "iteration", rename_all = "snake_case")]
pub enum ThreadPhase {
    NotStarted,
    HasHypothesis(i64),
    HasAlphas(i64),
    HasEvaluations(i64),
}

impl ThreadPhase {
    /// Phase implied by a thread's history.
    pub fn from_history(history: &[HypothesisRecord]) -> Self {
        let Some(latest) = history.last() else {
            return ThreadPhase::NotStarted;
        };
        let n = latest.hypothesis.iteration;
        if latest.alphas.is_empty() {
            ThreadPhase::HasHypothesis(n)
        } else if latest.alphas.iter().any(|a| !a.evaluations.is_empty()) {
            ThreadPhase::HasEvaluations(n)
        } else {
            ThreadPhase::HasAlphas(n)
        }
    }
}

impl From<&DecomposedExpression> for Decomposition {
    fn from(decomposed: &DecomposedExpression) -> Self {
        Self {
            variables: decomposed.variables.iter().cloned().collect(),
            indicators: decomposed.indicators.iter().cloned().collect(),
            operations: decomposed
                .operations
                .iter()
                .map(|op| op.to_string())
                .collect(),
        }
    }
}

/// Drives one research thread across invocations.
pub struct ResearchController<S: ResearchStore> {
    store: S,
    validator: ExpressionValidator,
}

impl<S: ResearchStore> ResearchController<S> {
    pub fn new(store: S, validator: ExpressionValidator) -> Self {
        Self { store, validator }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn validator(&self) -> &ExpressionValidator {
        &self.validator
    }

    /// Reconstruct the previous iteration's material for the next stage.
    pub async fn prepare_context(&self, thread_id: &str) -> AppResult<ResearchContext> {
        let history = self.store.read_history(thread_id).await?;

        let context = match history.last() {
            Some(latest) => ResearchContext::from_record(thread_id, latest),
            None => ResearchContext::first(thread_id),
        };

        debug!(
            thread_id,
            first_iteration = context.first_iteration,
            prior_alphas = context.alphas.len(),
            "Prepared research context"
        );
        Ok(context)
    }

    /// Current lifecycle phase of a thread.
    pub async fn phase(&self, thread_id: &str) -> AppResult<ThreadPhase> {
        let history = self.store.read_history(thread_id).await?;
        Ok(ThreadPhase::from_history(&history))
    }

    /// Validate and persist one stage's output.
    ///
    /// Invalid alphas are reported, not fatal; their valid siblings are still
    /// persisted. Store failures abort the remaining steps and propagate.
    pub async fn commit_stage(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        output: StageOutput,
    ) -> AppResult<CommitSummary> {
        let mut summary = CommitSummary::default();

        if let Some(fields) = &output.hypothesis {
            let hypothesis = self
                .store
                .upsert_hypothesis(thread_id, checkpoint_id, fields)
                .await?;
            summary.hypothesis = Some(hypothesis);
        }

        if !output.alphas.is_empty() {
            self.commit_alphas(thread_id, checkpoint_id, output.alphas, &mut summary)
                .await?;
        }

        for record in &output.evaluations {
            match self
                .store
                .record_evaluation(thread_id, checkpoint_id, record)
                .await?
            {
                Some(result) => summary.evaluations.push(result),
                None => summary
                    .skipped_evaluations
                    .push(record.alpha_identifier.clone()),
            }
        }

        info!(
            thread_id,
            checkpoint_id,
            persisted = summary.persisted_alphas.len(),
            duplicates = summary.duplicate_alphas.len(),
            rejected = summary.rejected_alphas.len(),
            evaluations = summary.evaluations.len(),
            skipped_evaluations = summary.skipped_evaluations.len(),
            "Stage committed"
        );
        Ok(summary)
    }

    async fn commit_alphas(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        candidates: Vec<AlphaCandidate>,
        summary: &mut CommitSummary,
    ) -> AppResult<()> {
        let mut accepted = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match self.validator.validate(&candidate.expression) {
                Ok(decomposed) => {
                    let alpha_identifier = candidate
                        .alpha_identifier
                        .filter(|id| !id.trim().is_empty())
                        .unwrap_or_else(generate_alpha_identifier);
                    let mut alpha = NewAlpha::new(alpha_identifier, candidate.expression)
                        .with_description(candidate.description)
                        .with_decomposition(Decomposition::from(&decomposed));
                    alpha.implementation = candidate.implementation;
                    accepted.push(alpha);
                }
                Err(error) => {
                    warn!(
                        thread_id,
                        expression = %candidate.expression,
                        kind = ?error.kind(),
                        %error,
                        "Alpha rejected"
                    );
                    summary.rejected_alphas.push(RejectedAlpha {
                        alpha_identifier: candidate.alpha_identifier,
                        expression: candidate.expression,
                        error,
                    });
                }
            }
        }

        if accepted.is_empty() {
            return Ok(());
        }

        let hypothesis_id = self
            .owning_hypothesis(thread_id, checkpoint_id, summary)
            .await?;

        let persisted = self
            .store
            .upsert_alphas(thread_id, checkpoint_id, hypothesis_id, &accepted)
            .await?;

        let mut fresh: HashSet<&str> = persisted
            .iter()
            .map(|a| a.alpha_identifier.as_str())
            .collect();
        summary.duplicate_alphas = accepted
            .iter()
            .filter(|a| !fresh.remove(a.alpha_identifier.as_str()))
            .map(|a| a.alpha_identifier.clone())
            .collect();
        summary.persisted_alphas = persisted;

        Ok(())
    }

    /// Hypothesis new alphas attach to: the one committed in this stage, the
    /// one stored for this checkpoint, or the thread's latest.
    async fn owning_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        summary: &CommitSummary,
    ) -> AppResult<i64> {
        if let Some(hypothesis) = &summary.hypothesis {
            return Ok(hypothesis.id);
        }
        if let Some(hypothesis) = self.store.find_hypothesis(thread_id, checkpoint_id).await? {
            return Ok(hypothesis.id);
        }
        match self.store.latest_hypothesis(thread_id).await? {
            Some(hypothesis) => Ok(hypothesis.id),
            None => Err(AppError::Stage {
                message: format!(
                    "thread {} has no hypothesis to attach alphas to",
                    thread_id
                ),
            }),
        }
    }
}
