use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    coerce_metrics, Alpha, AlphaRecord, EvaluationMetrics, EvaluationRecord, EvaluationResult, Hypothesis,
    HypothesisFields, HypothesisRecord, NewAlpha, ResearchStore,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Attempts at claiming an iteration number before a hypothesis insert gives up.
const MAX_HYPOTHESIS_INSERT_ATTEMPTS: usize = 8;

/// SQLite-backed research record store
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    operation_timeout: Duration,
}

impl SqliteStorage {
    /// Open (creating if missing) the database file and run migrations.
    ///
    /// Fails with [`StorageError::Unavailable`] when the database cannot be
    /// opened; there is no fallback store.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Unavailable {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Unavailable {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.operation_timeout())
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self {
            pool,
            operation_timeout: config.operation_timeout(),
        };
        storage.run_migrations().await?;

        info!(path = %config.path.display(), "Research store opened");
        Ok(storage)
    }

    /// In-memory store for tests and dry runs.
    ///
    /// Backed by a single connection that is never recycled; every new
    /// SQLite connection to `:memory:` would see its own empty database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Unavailable {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self {
            pool,
            operation_timeout: DatabaseConfig::default().operation_timeout(),
        };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Replace the per-call operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        debug!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections. Later calls fail as unavailable.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Bound a store call by the operation timeout.
    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.operation_timeout.as_millis() as u64;
                warn!(operation, timeout_ms, "Store operation timed out");
                Err(StorageError::Unavailable {
                    message: format!("{} timed out after {}ms", operation, timeout_ms),
                })
            }
        }
    }

    async fn insert_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        fields: &HypothesisFields,
    ) -> StorageResult<Hypothesis> {
        for attempt in 1..=MAX_HYPOTHESIS_INSERT_ATTEMPTS {
            if let Some(existing) = self.select_hypothesis(thread_id, checkpoint_id).await? {
                debug!(
                    thread_id,
                    checkpoint_id,
                    iteration = existing.iteration,
                    "Hypothesis already stored for checkpoint"
                );
                return Ok(existing);
            }

            let created_at = Utc::now();
            let inserted: Result<(i64, i64), sqlx::Error> = sqlx::query_as(
                r#"
                INSERT INTO hypotheses (
                    thread_id, checkpoint_id, idea, statement, reasoning, concise_reason,
                    concise_observation, concise_justification, concise_knowledge,
                    iteration, created_at
                )
                VALUES (
                    ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(iteration) + 1, 0) FROM hypotheses WHERE thread_id = ?),
                    ?
                )
                RETURNING id, iteration
                "#,
            )
            .bind(thread_id)
            .bind(checkpoint_id)
            .bind(&fields.idea)
            .bind(&fields.statement)
            .bind(&fields.reasoning)
            .bind(&fields.concise_reason)
            .bind(&fields.concise_observation)
            .bind(&fields.concise_justification)
            .bind(&fields.concise_knowledge)
            .bind(thread_id)
            .bind(created_at.to_rfc3339())
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok((id, iteration)) => {
                    info!(thread_id, checkpoint_id, iteration, "Hypothesis stored");
                    return Ok(Hypothesis {
                        id,
                        thread_id: thread_id.to_string(),
                        checkpoint_id: checkpoint_id.to_string(),
                        fields: fields.clone(),
                        iteration,
                        created_at,
                    });
                }
                // Another writer took the checkpoint or the iteration number
                // first; re-read and try again.
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    debug!(thread_id, checkpoint_id, attempt, "Hypothesis insert conflicted");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::Query {
            message: format!(
                "Hypothesis insert for thread {} still conflicting after {} attempts",
                thread_id, MAX_HYPOTHESIS_INSERT_ATTEMPTS
            ),
        })
    }

    async fn select_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> StorageResult<Option<Hypothesis>> {
        let row: Option<HypothesisRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, checkpoint_id, idea, statement, reasoning, concise_reason,
                   concise_observation, concise_justification, concise_knowledge,
                   iteration, created_at
            FROM hypotheses
            WHERE thread_id = ? AND checkpoint_id = ?
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn select_latest_hypothesis(&self, thread_id: &str) -> StorageResult<Option<Hypothesis>> {
        let row: Option<HypothesisRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, checkpoint_id, idea, statement, reasoning, concise_reason,
                   concise_observation, concise_justification, concise_knowledge,
                   iteration, created_at
            FROM hypotheses
            WHERE thread_id = ?
            ORDER BY iteration DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn select_hypotheses(&self, thread_id: &str) -> StorageResult<Vec<Hypothesis>> {
        let rows: Vec<HypothesisRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, checkpoint_id, idea, statement, reasoning, concise_reason,
                   concise_observation, concise_justification, concise_knowledge,
                   iteration, created_at
            FROM hypotheses
            WHERE thread_id = ?
            ORDER BY iteration ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn insert_alphas(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        hypothesis_id: i64,
        alphas: &[NewAlpha],
    ) -> StorageResult<Vec<Alpha>> {
        if alphas.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(alphas.len());

        for alpha in alphas {
            let decomposition = alpha
                .decomposition
                .as_ref()
                .map(|d| serde_json::to_string(d).unwrap_or_default());
            let created_at = Utc::now();

            let row: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO alphas (
                    thread_id, checkpoint_id, hypothesis_id, alpha_identifier, expression,
                    description, implementation, decomposition, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (hypothesis_id, alpha_identifier) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(thread_id)
            .bind(checkpoint_id)
            .bind(hypothesis_id)
            .bind(&alpha.alpha_identifier)
            .bind(&alpha.expression)
            .bind(&alpha.description)
            .bind(&alpha.implementation)
            .bind(&decomposition)
            .bind(created_at.to_rfc3339())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                    StorageError::HypothesisNotFound { hypothesis_id }
                }
                other => other.into(),
            })?;

            match row {
                Some((id,)) => inserted.push(Alpha {
                    id,
                    thread_id: thread_id.to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                    hypothesis_id,
                    alpha_identifier: alpha.alpha_identifier.clone(),
                    expression: alpha.expression.clone(),
                    description: alpha.description.clone(),
                    implementation: alpha.implementation.clone(),
                    decomposition: alpha.decomposition.clone(),
                    created_at,
                }),
                None => debug!(
                    hypothesis_id,
                    alpha_identifier = %alpha.alpha_identifier,
                    "Alpha already stored, skipping"
                ),
            }
        }

        tx.commit().await?;

        info!(
            thread_id,
            hypothesis_id,
            inserted = inserted.len(),
            skipped = alphas.len() - inserted.len(),
            "Alphas stored"
        );
        Ok(inserted)
    }

    async fn select_alphas(&self, hypothesis_id: i64) -> StorageResult<Vec<Alpha>> {
        let rows: Vec<AlphaRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, checkpoint_id, hypothesis_id, alpha_identifier, expression,
                   description, implementation, decomposition, created_at
            FROM alphas
            WHERE hypothesis_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(hypothesis_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn insert_evaluation(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        record: &EvaluationRecord,
    ) -> StorageResult<Option<EvaluationResult>> {
        // The identifier may repeat across hypotheses; the latest alpha wins.
        let alpha: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM alphas
            WHERE thread_id = ? AND alpha_identifier = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .bind(&record.alpha_identifier)
        .fetch_optional(&self.pool)
        .await?;

        let Some((alpha_id,)) = alpha else {
            warn!(
                thread_id,
                alpha_identifier = %record.alpha_identifier,
                "Evaluation references unknown alpha, skipping"
            );
            return Ok(None);
        };

        let metrics = EvaluationMetrics::from_values(&record.metrics);
        let all_metrics = coerce_metrics(&record.metrics);
        let metrics_json = serde_json::to_string(&all_metrics).unwrap_or_else(|_| "{}".to_string());
        let full_payload = serde_json::to_string(&record.full_payload).unwrap_or_default();
        let created_at = Utc::now();

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO evaluation_results (
                thread_id, checkpoint_id, alpha_id, best_so_far, information_ratio,
                annualized_return, max_drawdown, ic, metrics, full_payload, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_id)
        .bind(alpha_id)
        .bind(record.best_so_far)
        .bind(metrics.information_ratio)
        .bind(metrics.annualized_return)
        .bind(metrics.max_drawdown)
        .bind(metrics.ic)
        .bind(&metrics_json)
        .bind(&full_payload)
        .bind(created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        info!(
            thread_id,
            alpha_identifier = %record.alpha_identifier,
            best_so_far = record.best_so_far,
            "Evaluation recorded"
        );

        Ok(Some(EvaluationResult {
            id,
            thread_id: thread_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
            alpha_id,
            best_so_far: record.best_so_far,
            metrics,
            all_metrics,
            full_payload: record.full_payload.clone(),
            created_at,
        }))
    }

    async fn select_evaluations(&self, alpha_id: i64) -> StorageResult<Vec<EvaluationResult>> {
        let rows: Vec<EvaluationRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, checkpoint_id, alpha_id, best_so_far, information_ratio,
                   annualized_return, max_drawdown, ic, metrics, full_payload, created_at
            FROM evaluation_results
            WHERE alpha_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(alpha_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn select_history(&self, thread_id: &str) -> StorageResult<Vec<HypothesisRecord>> {
        // One read transaction so the three queries see the same snapshot.
        let mut tx = self.pool.begin().await?;

        let hypotheses: Vec<HypothesisRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, checkpoint_id, idea, statement, reasoning, concise_reason,
                   concise_observation, concise_justification, concise_knowledge,
                   iteration, created_at
            FROM hypotheses
            WHERE thread_id = ?
            ORDER BY iteration ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&mut *tx)
        .await?;

        let alphas: Vec<AlphaRow> = sqlx::query_as(
            r#"
            SELECT a.id, a.thread_id, a.checkpoint_id, a.hypothesis_id, a.alpha_identifier,
                   a.expression, a.description, a.implementation, a.decomposition, a.created_at
            FROM alphas a
            JOIN hypotheses h ON h.id = a.hypothesis_id
            WHERE h.thread_id = ?
            ORDER BY a.id ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&mut *tx)
        .await?;

        let evaluations: Vec<EvaluationRow> = sqlx::query_as(
            r#"
            SELECT e.id, e.thread_id, e.checkpoint_id, e.alpha_id, e.best_so_far,
                   e.information_ratio, e.annualized_return, e.max_drawdown, e.ic,
                   e.metrics, e.full_payload, e.created_at
            FROM evaluation_results e
            JOIN alphas a ON a.id = e.alpha_id
            JOIN hypotheses h ON h.id = a.hypothesis_id
            WHERE h.thread_id = ?
            ORDER BY e.id ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut evaluations_by_alpha: HashMap<i64, Vec<EvaluationResult>> = HashMap::new();
        for row in evaluations {
            let evaluation: EvaluationResult = row.into();
            evaluations_by_alpha
                .entry(evaluation.alpha_id)
                .or_default()
                .push(evaluation);
        }

        let mut alphas_by_hypothesis: HashMap<i64, Vec<AlphaRecord>> = HashMap::new();
        for row in alphas {
            let alpha: Alpha = row.into();
            let evaluations = evaluations_by_alpha.remove(&alpha.id).unwrap_or_default();
            alphas_by_hypothesis
                .entry(alpha.hypothesis_id)
                .or_default()
                .push(AlphaRecord { alpha, evaluations });
        }

        Ok(hypotheses
            .into_iter()
            .map(|row| {
                let hypothesis: Hypothesis = row.into();
                let alphas = alphas_by_hypothesis
                    .remove(&hypothesis.id)
                    .unwrap_or_default();
                HypothesisRecord { hypothesis, alphas }
            })
            .collect())
    }
}

#[async_trait]
impl ResearchStore for SqliteStorage {
    async fn upsert_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        fields: &HypothesisFields,
    ) -> StorageResult<Hypothesis> {
        self.timed(
            "upsert_hypothesis",
            self.insert_hypothesis(thread_id, checkpoint_id, fields),
        )
        .await
    }

    async fn find_hypothesis(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> StorageResult<Option<Hypothesis>> {
        self.timed(
            "find_hypothesis",
            self.select_hypothesis(thread_id, checkpoint_id),
        )
        .await
    }

    async fn latest_hypothesis(&self, thread_id: &str) -> StorageResult<Option<Hypothesis>> {
        self.timed("latest_hypothesis", self.select_latest_hypothesis(thread_id))
            .await
    }

    async fn hypotheses_for_thread(&self, thread_id: &str) -> StorageResult<Vec<Hypothesis>> {
        self.timed("hypotheses_for_thread", self.select_hypotheses(thread_id))
            .await
    }

    async fn upsert_alphas(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        hypothesis_id: i64,
        alphas: &[NewAlpha],
    ) -> StorageResult<Vec<Alpha>> {
        self.timed(
            "upsert_alphas",
            self.insert_alphas(thread_id, checkpoint_id, hypothesis_id, alphas),
        )
        .await
    }

    async fn alphas_for_hypothesis(&self, hypothesis_id: i64) -> StorageResult<Vec<Alpha>> {
        self.timed("alphas_for_hypothesis", self.select_alphas(hypothesis_id))
            .await
    }

    async fn record_evaluation(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        record: &EvaluationRecord,
    ) -> StorageResult<Option<EvaluationResult>> {
        self.timed(
            "record_evaluation",
            self.insert_evaluation(thread_id, checkpoint_id, record),
        )
        .await
    }

    async fn evaluations_for_alpha(&self, alpha_id: i64) -> StorageResult<Vec<EvaluationResult>> {
        self.timed("evaluations_for_alpha", self.select_evaluations(alpha_id))
            .await
    }

    async fn read_history(&self, thread_id: &str) -> StorageResult<Vec<HypothesisRecord>> {
        self.timed("read_history", self.select_history(thread_id))
            .await
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct HypothesisRow {
    id: i64,
    thread_id: String,
    checkpoint_id: String,
    idea: String,
    statement: String,
    reasoning: String,
    concise_reason: String,
    concise_observation: String,
    concise_justification: String,
    concise_knowledge: String,
    iteration: i64,
    created_at: String,
}

impl From<HypothesisRow> for Hypothesis {
    fn from(row: HypothesisRow) -> Self {
        Self {
            id: row.id,
            thread_id: row.thread_id,
            checkpoint_id: row.checkpoint_id,
            fields: HypothesisFields {
                idea: row.idea,
                statement: row.statement,
                reasoning: row.reasoning,
                concise_reason: row.concise_reason,
                concise_observation: row.concise_observation,
                concise_justification: row.concise_justification,
                concise_knowledge: row.concise_knowledge,
            },
            iteration: row.iteration,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AlphaRow {
    id: i64,
    thread_id: String,
    checkpoint_id: String,
    hypothesis_id: i64,
    alpha_identifier: String,
    expression: String,
    description: String,
    implementation: Option<String>,
    decomposition: Option<String>,
    created_at: String,
}

impl From<AlphaRow> for Alpha {
    fn from(row: AlphaRow) -> Self {
        Self {
            id: row.id,
            thread_id: row.thread_id,
            checkpoint_id: row.checkpoint_id,
            hypothesis_id: row.hypothesis_id,
            alpha_identifier: row.alpha_identifier,
            expression: row.expression,
            description: row.description,
            implementation: row.implementation,
            decomposition: row.decomposition.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EvaluationRow {
    id: i64,
    thread_id: String,
    checkpoint_id: String,
    alpha_id: i64,
    best_so_far: bool,
    information_ratio: f64,
    annualized_return: f64,
    max_drawdown: f64,
    ic: f64,
    metrics: String,
    full_payload: String,
    created_at: String,
}

impl From<EvaluationRow> for EvaluationResult {
    fn from(row: EvaluationRow) -> Self {
        Self {
            id: row.id,
            thread_id: row.thread_id,
            checkpoint_id: row.checkpoint_id,
            alpha_id: row.alpha_id,
            best_so_far: row.best_so_far,
            metrics: EvaluationMetrics {
                information_ratio: row.information_ratio,
                annualized_return: row.annualized_return,
                max_drawdown: row.max_drawdown,
                ic: row.ic,
            },
            all_metrics: serde_json::from_str(&row.metrics).unwrap_or_default(),
            full_payload: serde_json::from_str(&row.full_payload)
                .unwrap_or(serde_json::Value::Null),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}
