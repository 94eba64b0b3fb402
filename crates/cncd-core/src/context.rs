//! Expression context for inline G-code substitution.
//!
//! Programs and ad-hoc commands may carry `%name = expr` assignment lines
//! and `[expr]` substitutions. Both are evaluated against a [`Context`]: a
//! flat mapping of identifiers to numeric or string scalars (axis
//! positions, modal words, bounding-box values, user globals).
//!
//! Evaluation is pure: no I/O, no clock, no globals. The grammar is
//! deliberately small — numbers, identifiers, string literals, the four
//! arithmetic operators plus `%`, unary sign, and parentheses.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// A scalar value exposed to expression evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Numeric value
    Number(f64),
    /// String value
    Text(String),
}

impl Scalar {
    /// Numeric view of this scalar, when it has one
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

/// Identifier → scalar mapping for inline expression substitution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    vars: HashMap<String, Scalar>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identifier
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Look up an identifier
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.vars.get(name)
    }

    /// Numeric lookup shortcut
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Scalar::as_number)
    }

    /// Number of bound identifiers
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when no identifiers are bound
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Evaluate an expression against this context
    pub fn eval(&self, expr: &str) -> Result<Scalar> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            ctx: self,
        };
        let value = parser.expression()?;
        if parser.pos != tokens.len() {
            return Err(Error::validation(format!(
                "trailing input in expression: {expr:?}"
            )));
        }
        Ok(value)
    }

    /// Evaluate `name = expr` and bind the result
    pub fn assign(&mut self, stmt: &str) -> Result<()> {
        let (name, expr) = stmt.split_once('=').ok_or_else(|| {
            Error::validation(format!("expected assignment, got {stmt:?}"))
        })?;
        let name = name.trim();
        if name.is_empty() || !is_ident(name) {
            return Err(Error::validation(format!(
                "invalid assignment target {name:?}"
            )));
        }
        let value = self.eval(expr.trim())?;
        self.vars.insert(name.to_string(), value);
        Ok(())
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Text(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j == bytes.len() {
                    return Err(Error::validation(format!(
                        "unterminated string in expression {input:?}"
                    )));
                }
                tokens.push(Token::Text(bytes[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    Error::validation(format!("bad number {text:?} in expression"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_' || bytes[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(bytes[start..i].iter().collect()));
            }
            other => {
                return Err(Error::validation(format!(
                    "unexpected character {other:?} in expression {input:?}"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a Context,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expression(&mut self) -> Result<Scalar> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.advance();
                    let rhs = self.term()?;
                    value = add(value, rhs)?;
                }
                Token::Minus => {
                    self.advance();
                    let rhs = self.term()?;
                    value = numeric_op(value, rhs, "-", |a, b| a - b)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<Scalar> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.advance();
                    let rhs = self.factor()?;
                    value = numeric_op(value, rhs, "*", |a, b| a * b)?;
                }
                Token::Slash => {
                    self.advance();
                    let rhs = self.factor()?;
                    value = numeric_op(value, rhs, "/", |a, b| a / b)?;
                }
                Token::Percent => {
                    self.advance();
                    let rhs = self.factor()?;
                    value = numeric_op(value, rhs, "%", |a, b| a % b)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<Scalar> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Scalar::Number(n)),
            Some(Token::Text(s)) => Ok(Scalar::Text(s)),
            Some(Token::Ident(name)) => self
                .ctx
                .get(&name)
                .cloned()
                .ok_or_else(|| Error::validation(format!("unknown identifier {name:?}"))),
            Some(Token::Minus) => {
                let v = self.factor()?;
                match v {
                    Scalar::Number(n) => Ok(Scalar::Number(-n)),
                    Scalar::Text(_) => {
                        Err(Error::validation("cannot negate a string value"))
                    }
                }
            }
            Some(Token::Plus) => self.factor(),
            Some(Token::LParen) => {
                let v = self.expression()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err(Error::validation("expected ')' in expression")),
                }
            }
            other => Err(Error::validation(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }
}

fn add(lhs: Scalar, rhs: Scalar) -> Result<Scalar> {
    match (lhs, rhs) {
        (Scalar::Number(a), Scalar::Number(b)) => Ok(Scalar::Number(a + b)),
        // String concatenation follows the source language of most macros
        (a, b) => Ok(Scalar::Text(format!("{a}{b}"))),
    }
}

fn numeric_op(
    lhs: Scalar,
    rhs: Scalar,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Scalar> {
    match (lhs.as_number(), rhs.as_number()) {
        (Some(a), Some(b)) => Ok(Scalar::Number(f(a, b))),
        _ => Err(Error::validation(format!(
            "operator '{op}' requires numeric operands"
        ))),
    }
}
