//! Alpha expression validation and decomposition.
//!
//! [`ExpressionValidator::validate`] parses free-form expression text under a
//! [`GrammarRegistry`], rejects anything malformed or outside the grammar, and
//! extracts the structural components downstream stages consume: the raw
//! market fields referenced, the indicators called, and a multiset of the
//! operations present in the tree.
//!
//! ```
//! use alpha_research::expression::ExpressionValidator;
//!
//! let validator = ExpressionValidator::standard();
//! let decomposed = validator.validate("log(close / open)").unwrap();
//! assert!(decomposed.variables.contains("close"));
//! assert!(decomposed.indicators.is_empty());
//! ```

mod lexer;
mod parser;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use parser::{BinaryOp, Expr, UnaryOp};

use crate::config::ValidatorConfig;
use crate::error::ValidationError;
use crate::grammar::{CallableClass, GrammarRegistry};
use parser::Parser;

/// Structural operation kinds counted in a decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Pos,
    /// Function application, indicator or math.
    Call,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Add => "add",
            OperationKind::Sub => "sub",
            OperationKind::Mul => "mul",
            OperationKind::Div => "div",
            OperationKind::Pow => "pow",
            OperationKind::Neg => "neg",
            OperationKind::Pos => "pos",
            OperationKind::Call => "call",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "add" => Ok(OperationKind::Add),
            "sub" => Ok(OperationKind::Sub),
            "mul" => Ok(OperationKind::Mul),
            "div" => Ok(OperationKind::Div),
            "pow" => Ok(OperationKind::Pow),
            "neg" => Ok(OperationKind::Neg),
            "pos" => Ok(OperationKind::Pos),
            "call" => Ok(OperationKind::Call),
            _ => Err(format!("Unknown operation kind: {}", s)),
        }
    }
}

/// Structural breakdown of a validated expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecomposedExpression {
    /// The expression exactly as submitted.
    pub expression: String,
    /// Raw market fields referenced.
    pub variables: BTreeSet<String>,
    /// Registry indicators called. Math functions are not included.
    pub indicators: BTreeSet<String>,
    /// One entry per operation node, in pre-order. Diagnostic only.
    pub operations: Vec<OperationKind>,
}

impl DecomposedExpression {
    /// Occurrences of each operation kind.
    pub fn operation_counts(&self) -> BTreeMap<OperationKind, usize> {
        let mut counts = BTreeMap::new();
        for op in &self.operations {
            *counts.entry(*op).or_insert(0) += 1;
        }
        counts
    }
}

/// Validates alpha expressions against an immutable grammar.
#[derive(Debug, Clone)]
pub struct ExpressionValidator {
    registry: Arc<GrammarRegistry>,
    strict_arity: bool,
}

impl ExpressionValidator {
    pub fn new(registry: Arc<GrammarRegistry>) -> Self {
        Self {
            registry,
            strict_arity: false,
        }
    }

    /// Validator over [`GrammarRegistry::standard`].
    pub fn standard() -> Self {
        Self::new(Arc::new(GrammarRegistry::standard()))
    }

    /// Standard grammar extended with configured variables and arity policy.
    pub fn from_config(config: &ValidatorConfig) -> Self {
        let registry = config
            .extra_variables
            .iter()
            .fold(GrammarRegistry::standard_builder(), |b, v| b.variable(v.as_str()))
            .build();
        Self::new(Arc::new(registry)).with_strict_arity(config.strict_arity)
    }

    /// Reject calls whose argument count disagrees with the declared arity.
    pub fn with_strict_arity(mut self, strict: bool) -> Self {
        self.strict_arity = strict;
        self
    }

    pub fn registry(&self) -> &GrammarRegistry {
        &self.registry
    }

    /// Parse into a tree without decomposing.
    pub fn parse(&self, raw: &str) -> Result<Expr, ValidationError> {
        let tokens = lexer::tokenize(raw)?;
        Parser::new(tokens, raw.len(), &self.registry).parse()
    }

    /// Validate `raw` and extract its components.
    pub fn validate(&self, raw: &str) -> Result<DecomposedExpression, ValidationError> {
        let tree = self.parse(raw)?;

        let mut decomposed = DecomposedExpression {
            expression: raw.to_string(),
            variables: BTreeSet::new(),
            indicators: BTreeSet::new(),
            operations: Vec::new(),
        };
        self.collect(&tree, &mut decomposed)?;

        Ok(decomposed)
    }

    fn collect(&self, expr: &Expr, out: &mut DecomposedExpression) -> Result<(), ValidationError> {
        match expr {
            Expr::Number { .. } => {}
            Expr::Variable { name } => {
                out.variables.insert(name.clone());
            }
            Expr::Call { name, class, args } => {
                if self.strict_arity {
                    self.check_arity(name, args.len())?;
                }
                out.operations.push(OperationKind::Call);
                if *class == CallableClass::Indicator {
                    out.indicators.insert(name.clone());
                }
                for arg in args {
                    self.collect(arg, out)?;
                }
            }
            Expr::Unary { op, operand } => {
                out.operations.push(match op {
                    UnaryOp::Neg => OperationKind::Neg,
                    UnaryOp::Pos => OperationKind::Pos,
                });
                self.collect(operand, out)?;
            }
            Expr::Binary { op, left, right } => {
                out.operations.push(match op {
                    BinaryOp::Add => OperationKind::Add,
                    BinaryOp::Sub => OperationKind::Sub,
                    BinaryOp::Mul => OperationKind::Mul,
                    BinaryOp::Div => OperationKind::Div,
                    BinaryOp::Pow => OperationKind::Pow,
                });
                self.collect(left, out)?;
                self.collect(right, out)?;
            }
        }
        Ok(())
    }

    fn check_arity(&self, name: &str, found: usize) -> Result<(), ValidationError> {
        match self.registry.callable(name) {
            Some(callable) if !callable.arity.accepts(found) => {
                Err(ValidationError::ArityMismatch {
                    name: name.to_string(),
                    expected: callable.arity.to_string(),
                    found,
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for ExpressionValidator {
    fn default() -> Self {
        Self::standard()
    }
}
