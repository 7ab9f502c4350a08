//! Grammar registry for alpha expressions.
//!
//! The registry is the fixed vocabulary an expression may draw from: raw
//! market fields (variables) and callable names (indicators and plain math
//! functions). It is built once, never mutated afterwards, and handed to the
//! [`ExpressionValidator`](crate::expression::ExpressionValidator) at
//! construction time. Adding an indicator is a registry edit; the parser only
//! asks the registry what a name is.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expression::Expr;

/// Raw market fields every registry knows about.
pub const STANDARD_VARIABLES: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Declared argument count of a callable.
///
/// The declaration is informational unless the validator runs with strict
/// arity checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    /// Any number of arguments.
    Any,
    /// Exactly this many arguments.
    Exact(usize),
    /// Between `min` and `max` arguments, inclusive.
    Range { min: usize, max: usize },
}

impl Arity {
    /// Whether a call with `count` arguments satisfies this arity.
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Any => true,
            Arity::Exact(n) => count == n,
            Arity::Range { min, max } => (min..=max).contains(&count),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Any => write!(f, "any number of"),
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::Range { min, max } => write!(f, "{} to {}", min, max),
        }
    }
}

/// Whether a callable counts as an indicator in a decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallableClass {
    /// Technical indicator (SMA, RSI, ...); reported in the indicator set.
    Indicator,
    /// Plain math function (log, sqrt, ...); only shows up as a call node.
    Math,
}

/// A callable name known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callable {
    pub name: String,
    pub class: CallableClass,
    pub arity: Arity,
}

impl Callable {
    pub fn is_indicator(&self) -> bool {
        self.class == CallableClass::Indicator
    }

    /// Build the call node for this callable. Any argument count is
    /// accepted; arity is checked later, if at all.
    pub fn apply(&self, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: self.name.clone(),
            class: self.class,
            args,
        }
    }
}

/// What an identifier resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol<'a> {
    Variable(&'a str),
    Callable(&'a Callable),
}

/// Immutable set of variables and callables an expression may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarRegistry {
    variables: BTreeSet<String>,
    callables: BTreeMap<String, Callable>,
}

impl GrammarRegistry {
    /// The standard research grammar: OHLCV fields, the supported technical
    /// indicators and the log/sqrt family.
    pub fn standard() -> Self {
        Self::standard_builder().build()
    }

    /// A builder pre-loaded with the standard grammar, for extending it.
    pub fn standard_builder() -> GrammarRegistryBuilder {
        let mut builder = GrammarRegistryBuilder::default();
        for var in STANDARD_VARIABLES {
            builder = builder.variable(var);
        }
        builder
            .indicator("SMA", Arity::Exact(2))
            .indicator("EMA", Arity::Exact(2))
            .indicator("RSI", Arity::Exact(2))
            .indicator("ATR", Arity::Range { min: 1, max: 4 })
            .indicator("BollingerBandsWidth", Arity::Range { min: 1, max: 3 })
            .indicator("correlation", Arity::Range { min: 2, max: 3 })
            .math_function("log", Arity::Range { min: 1, max: 2 })
            .math_function("ln", Arity::Exact(1))
            .math_function("sqrt", Arity::Exact(1))
    }

    /// An empty builder.
    pub fn builder() -> GrammarRegistryBuilder {
        GrammarRegistryBuilder::default()
    }

    /// Resolve an identifier. Names are case-sensitive.
    pub fn lookup(&self, name: &str) -> Option<Symbol<'_>> {
        if let Some(var) = self.variables.get(name) {
            return Some(Symbol::Variable(var.as_str()));
        }
        self.callables.get(name).map(Symbol::Callable)
    }

    pub fn is_variable(&self, name: &str) -> bool {
        self.variables.contains(name)
    }

    pub fn callable(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(String::as_str)
    }

    /// Names of callables classed as indicators.
    pub fn indicators(&self) -> impl Iterator<Item = &str> {
        self.callables
            .values()
            .filter(|c| c.is_indicator())
            .map(|c| c.name.as_str())
    }

    pub fn callables(&self) -> impl Iterator<Item = &Callable> {
        self.callables.values()
    }
}

impl Default for GrammarRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Builder for [`GrammarRegistry`].
///
/// A name registered twice keeps its last registration; a name registered as
/// both a variable and a callable resolves as the variable.
#[derive(Debug, Default)]
pub struct GrammarRegistryBuilder {
    variables: BTreeSet<String>,
    callables: BTreeMap<String, Callable>,
}

impl GrammarRegistryBuilder {
    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variables.insert(name.into());
        self
    }

    pub fn indicator(self, name: impl Into<String>, arity: Arity) -> Self {
        self.callable(name, CallableClass::Indicator, arity)
    }

    pub fn math_function(self, name: impl Into<String>, arity: Arity) -> Self {
        self.callable(name, CallableClass::Math, arity)
    }

    fn callable(mut self, name: impl Into<String>, class: CallableClass, arity: Arity) -> Self {
        let name = name.into();
        self.callables
            .insert(name.clone(), Callable { name, class, arity });
        self
    }

    pub fn build(self) -> GrammarRegistry {
        GrammarRegistry {
            variables: self.variables,
            callables: self.callables,
        }
    }
}
