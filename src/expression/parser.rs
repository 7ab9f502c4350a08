use serde::{Deserialize, Serialize};

use super::lexer::{Token, TokenKind};
use crate::error::ValidationError;
use crate::grammar::{CallableClass, GrammarRegistry, Symbol};

/// Symbolic expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    Number {
        value: f64,
    },
    Variable {
        name: String,
    },
    Call {
        name: String,
        class: CallableClass,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Deepest tree the parser will build. Each unary operator, parenthesized
/// group, call argument and chained binary operator counts one level.
const MAX_NESTING_DEPTH: usize = 256;

/// Recursive-descent parser over a token stream.
///
/// Precedence, loosest first: `+ -`, `* /`, unary `- +`, `^` (right
/// associative). Identifiers are resolved against the registry while
/// parsing. An unknown identifier does not stop the parse: the first one is
/// remembered and reported only if the text is otherwise well formed, so a
/// malformed expression is always a syntax error. Nesting past
/// [`MAX_NESTING_DEPTH`] is a syntax error too.
pub(crate) struct Parser<'a> {
    tokens: Vec<Token>,
    index: usize,
    end: usize,
    depth: usize,
    registry: &'a GrammarRegistry,
    unknown: Option<String>,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(tokens: Vec<Token>, source_len: usize, registry: &'a GrammarRegistry) -> Self {
        Self {
            tokens,
            index: 0,
            end: source_len,
            depth: 0,
            registry,
            unknown: None,
        }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, ValidationError> {
        if self.tokens.is_empty() {
            return Err(ValidationError::syntax("expression is empty", 0));
        }

        let expr = self.parse_additive()?;
        if let Some(token) = self.peek() {
            return Err(ValidationError::syntax(
                format!("unexpected {}", describe(&token.kind)),
                token.position,
            ));
        }

        match self.unknown {
            Some(symbol) => Err(ValidationError::UnknownSymbol { symbol }),
            None => Ok(expr),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn position(&self) -> usize {
        self.peek().map(|t| t.position).unwrap_or(self.end)
    }

    fn enter(&mut self) -> Result<(), ValidationError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ValidationError::syntax(
                "expression nested too deeply",
                self.position(),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ValidationError> {
        match self.consume() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(ValidationError::syntax(
                format!("expected {}, found {}", what, describe(&token.kind)),
                token.position,
            )),
            None => Err(ValidationError::syntax(
                format!("expected {}, found end of expression", what),
                self.end,
            )),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ValidationError> {
        let depth = self.depth;
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            self.enter()?;
            let rhs = self.parse_multiplicative()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
            };
        }
        self.depth = depth;
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ValidationError> {
        let depth = self.depth;
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            self.enter()?;
            let rhs = self.parse_unary()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(rhs),
            };
        }
        self.depth = depth;
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ValidationError> {
        self.enter()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Plus) => UnaryOp::Pos,
            _ => {
                let expr = self.parse_power()?;
                self.depth -= 1;
                return Ok(expr);
            }
        };
        self.consume();
        let operand = self.parse_unary()?;
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_power(&mut self) -> Result<Expr, ValidationError> {
        let base = self.parse_primary()?;
        if matches!(self.peek_kind(), Some(TokenKind::Caret)) {
            self.consume();
            // right-associative; the exponent may carry its own sign
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ValidationError> {
        let position = self.position();
        match self.consume() {
            Some(Token {
                kind: TokenKind::Number(value),
                ..
            }) => Ok(Expr::Number { value }),
            Some(Token {
                kind: TokenKind::Ident(name),
                position,
            }) => self.parse_identifier(name, position),
            Some(Token {
                kind: TokenKind::LParen,
                ..
            }) => {
                let expr = self.parse_additive()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            Some(token) => Err(ValidationError::syntax(
                format!("unexpected {}", describe(&token.kind)),
                token.position,
            )),
            None => Err(ValidationError::syntax(
                "unexpected end of expression",
                position,
            )),
        }
    }

    fn parse_identifier(&mut self, name: String, position: usize) -> Result<Expr, ValidationError> {
        let is_call = matches!(self.peek_kind(), Some(TokenKind::LParen));
        let registry = self.registry;

        match (registry.lookup(&name), is_call) {
            (Some(Symbol::Variable(_)), false) => Ok(Expr::Variable { name }),
            (Some(Symbol::Variable(_)), true) => Err(ValidationError::syntax(
                format!("'{}' is a variable and cannot be called", name),
                position,
            )),
            (Some(Symbol::Callable(callable)), true) => {
                let args = self.parse_arguments()?;
                Ok(callable.apply(args))
            }
            (Some(Symbol::Callable(_)), false) => Err(ValidationError::syntax(
                format!("'{}' must be called with arguments", name),
                position,
            )),
            (None, is_call) => {
                if self.unknown.is_none() {
                    self.unknown = Some(name.clone());
                }
                if is_call {
                    let args = self.parse_arguments()?;
                    Ok(Expr::Call {
                        name,
                        class: CallableClass::Indicator,
                        args,
                    })
                } else {
                    Ok(Expr::Variable { name })
                }
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ValidationError> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if matches!(self.peek_kind(), Some(TokenKind::RParen)) {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_additive()?);
            if matches!(self.peek_kind(), Some(TokenKind::Comma)) {
                self.consume();
                continue;
            }
            break;
        }
        self.expect(TokenKind::RParen, "',' or ')'")?;
        Ok(args)
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Ident(name) => format!("identifier '{}'", name),
        TokenKind::Plus => "'+'".to_string(),
        TokenKind::Minus => "'-'".to_string(),
        TokenKind::Star => "'*'".to_string(),
        TokenKind::Slash => "'/'".to_string(),
        TokenKind::Caret => "'^'".to_string(),
        TokenKind::LParen => "'('".to_string(),
        TokenKind::RParen => "')'".to_string(),
        TokenKind::Comma => "','".to_string(),
    }
}
