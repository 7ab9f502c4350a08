//! # Alpha Research
//!
//! Validation and bookkeeping for iterative quantitative-research loops.
//!
//! A research thread moves through repeated stages: an idea becomes a
//! hypothesis, the hypothesis yields candidate alpha expressions, and the
//! alphas are evaluated externally. This crate owns two pieces of that loop:
//!
//! - **Expression validation**: alpha text is parsed against a fixed
//!   [`GrammarRegistry`] and decomposed into the variables, indicators and
//!   operations it uses.
//! - **Research bookkeeping**: each stage's output is persisted per thread
//!   and checkpoint with idempotent writes, and the previous iteration is
//!   reconstructed for the next one.
//!
//! ## Architecture
//!
//! ```text
//! Stage pipeline → ResearchController → ResearchStore (SQLite)
//!                        ↓
//!               ExpressionValidator → GrammarRegistry
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use alpha_research::{Config, ExpressionValidator, ResearchController, SqliteStorage, StageOutput};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let validator = ExpressionValidator::from_config(&config.validator);
//!     let controller = ResearchController::new(storage, validator);
//!
//!     let context = controller.prepare_context("thread-1").await?;
//!     println!("{}", context.factor_history());
//!     Ok(())
//! }
//! ```

/// Command-line interface commands.
pub mod cli;
/// Configuration loaded from the environment.
pub mod config;
/// Iteration controller bridging stage output and storage.
pub mod controller;
/// Error types and result aliases for the application.
pub mod error;
/// Alpha expression parsing, validation and decomposition.
pub mod expression;
/// Registry of variables and callables an expression may use.
pub mod grammar;
/// Persistence of hypotheses, alphas and evaluation results.
pub mod storage;

pub use config::Config;
pub use controller::{CommitSummary, ResearchContext, ResearchController, StageOutput, ThreadPhase};
pub use error::{AppError, AppResult, StorageError, ValidationError};
pub use expression::{DecomposedExpression, ExpressionValidator};
pub use grammar::GrammarRegistry;
pub use storage::{ResearchStore, SqliteStorage};
