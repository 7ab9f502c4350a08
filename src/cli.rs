//! CLI commands for inspecting and feeding research threads.
//!
//! The binary does not sequence stages; it validates expressions, commits a
//! stage output produced elsewhere, and prints what a thread holds.

use std::path::PathBuf;

use clap::Subcommand;
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::controller::{ResearchController, StageOutput};
use crate::expression::ExpressionValidator;
use crate::storage::{ResearchStore, SqliteStorage};

/// Research CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Validate an alpha expression and print its decomposition
    Validate {
        /// Expression text, e.g. "RSI(close, 14) / SMA(volume, 20)"
        expression: String,

        /// Reject indicator calls with the wrong number of arguments
        #[arg(long)]
        strict: bool,
    },

    /// Print the full history of a thread
    History {
        thread_id: String,
    },

    /// Print the context the next iteration of a thread would receive
    Context {
        thread_id: String,

        /// Print the plain-text factor history instead of JSON
        #[arg(long)]
        text: bool,
    },

    /// Print the lifecycle phase of a thread
    Phase {
        thread_id: String,
    },

    /// Commit a stage output (JSON) under a thread and checkpoint
    Commit {
        thread_id: String,
        checkpoint_id: String,

        /// Read the stage output from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output printed to stdout
    pub message: String,
}

impl CliResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(s) => Self::success(s),
            Err(e) => Self::error(format!("Failed to serialize output: {}", e)),
        }
    }
}

/// Execute a CLI command. Only commands that touch threads open the store.
pub async fn execute_command(command: Commands, config: &Config) -> CliResult {
    match command {
        Commands::Validate { expression, strict } => {
            let validator =
                ExpressionValidator::from_config(&config.validator).with_strict_arity(
                    strict || config.validator.strict_arity,
                );
            execute_validate(&validator, &expression)
        }
        other => {
            let storage = match SqliteStorage::new(&config.database).await {
                Ok(s) => s,
                Err(e) => return CliResult::error(format!("Failed to open store: {}", e)),
            };
            let controller =
                ResearchController::new(storage, ExpressionValidator::from_config(&config.validator));
            let result = execute_thread_command(other, &controller).await;
            controller.store().close().await;
            result
        }
    }
}

fn execute_validate(validator: &ExpressionValidator, expression: &str) -> CliResult {
    match validator.validate(expression) {
        Ok(decomposed) => CliResult::json(&decomposed),
        Err(e) => {
            let mut result = CliResult::json(&e);
            result.exit_code = 1;
            result
        }
    }
}

async fn execute_thread_command<S: ResearchStore>(
    command: Commands,
    controller: &ResearchController<S>,
) -> CliResult {
    match command {
        Commands::History { thread_id } => match controller.store().read_history(&thread_id).await
        {
            Ok(hypotheses) => CliResult::json(&serde_json::json!({
                "thread_id": thread_id,
                "hypotheses": hypotheses,
            })),
            Err(e) => CliResult::error(format!("Failed to read history: {}", e)),
        },
        Commands::Context { thread_id, text } => {
            match controller.prepare_context(&thread_id).await {
                Ok(context) if text => CliResult::success(context.factor_history()),
                Ok(context) => CliResult::json(&context),
                Err(e) => CliResult::error(format!("Failed to prepare context: {}", e)),
            }
        }
        Commands::Phase { thread_id } => match controller.phase(&thread_id).await {
            Ok(phase) => CliResult::json(&phase),
            Err(e) => CliResult::error(format!("Failed to read phase: {}", e)),
        },
        Commands::Commit {
            thread_id,
            checkpoint_id,
            input,
        } => {
            let raw = match read_input(input).await {
                Ok(raw) => raw,
                Err(e) => return CliResult::error(format!("Failed to read stage output: {}", e)),
            };
            let output: StageOutput = match serde_json::from_str(&raw) {
                Ok(output) => output,
                Err(e) => return CliResult::error(format!("Invalid stage output: {}", e)),
            };
            match controller
                .commit_stage(&thread_id, &checkpoint_id, output)
                .await
            {
                Ok(summary) => CliResult::json(&summary),
                Err(e) => CliResult::error(format!("Commit failed: {}", e)),
            }
        }
        Commands::Validate { expression, .. } => execute_validate(controller.validator(), &expression),
    }
}

async fn read_input(path: Option<PathBuf>) -> std::io::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => {
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            Ok(raw)
        }
    }
}
