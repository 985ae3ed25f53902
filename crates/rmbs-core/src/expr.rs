//! Expression evaluation engine.
//!
//! Deal rules (trigger tests, derived variables, waterfall conditions and
//! amounts) are short arithmetic/boolean expressions evaluated against the
//! live [`crate::state::DealState`]. The engine lexes and parses each rule
//! into an AST ([`parser::Expr`]) and interprets it with a restricted
//! namespace:
//!
//! - `funds.<id>` / `accounts.<id>` — cash-bucket balance (0 when missing)
//! - `bonds.<id>.{balance, factor, shortfall, original}`
//! - `ledgers.<id>`, `collateral.<attr>`, `variables.<name>`
//! - `tests.<id>.failed`
//! - bare identifiers resolve against variables, then cash buckets
//!
//! Built-ins: `MIN, MAX, ABS, ROUND, SUM, FLOOR, CEIL`. SQL-style tokens
//! (`AND`, `OR`, `NOT`, `<>`, `TRUE`, `FALSE`) are accepted and normalized
//! by the lexer. No other host functionality is reachable from a rule.

pub mod eval;
pub mod lexer;
pub mod parser;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::RmbsError;
use crate::RmbsResult;

pub use eval::ExpressionEngine;

/// Result of evaluating a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(Decimal),
    Bool(bool),
    Text(String),
}

impl Value {
    /// Numeric coercion: booleans count as 1/0, text is an error.
    pub fn as_number(&self) -> RmbsResult<Decimal> {
        match self {
            Value::Number(d) => Ok(*d),
            Value::Bool(true) => Ok(Decimal::ONE),
            Value::Bool(false) => Ok(Decimal::ZERO),
            Value::Text(s) => Err(RmbsError::Calculation(format!(
                "expected a number, found '{}'",
                s
            ))),
        }
    }

    /// Truthiness: non-zero numbers, `true`, and non-empty text.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Number(d) => !d.is_zero(),
            Value::Bool(b) => *b,
            Value::Text(s) => !s.is_empty(),
        }
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Number(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
