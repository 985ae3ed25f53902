//! AST interpreter with the deal-state namespace.

use rust_decimal::Decimal;

use crate::error::RmbsError;
use crate::ingest::json_decimal;
use crate::state::DealState;
use crate::RmbsResult;

use super::parser::{parse, BinaryOp, Expr, UnaryOp};
use super::Value;

/// Evaluate deal formulas against the current deal state.
///
/// The engine is stateless and can be shared across concurrent simulations;
/// the [`DealState`] passed to each call provides all context.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEngine;

impl ExpressionEngine {
    pub fn new() -> Self {
        ExpressionEngine
    }

    /// Evaluate a rule expression. Empty or missing rules evaluate to `0`.
    pub fn evaluate(&self, expression: &str, state: &DealState) -> RmbsResult<Value> {
        if expression.trim().is_empty() {
            return Ok(Value::Number(Decimal::ZERO));
        }
        let ast = parse(expression)?;
        eval_expr(&ast, state)
    }

    /// Evaluate a rule and coerce the result to a number.
    pub fn evaluate_number(&self, expression: &str, state: &DealState) -> RmbsResult<Decimal> {
        self.evaluate(expression, state)?.as_number()
    }

    /// Evaluate a boolean condition used for waterfall step gating.
    ///
    /// Literal `"true"` / `"false"` (any case) short-circuit without
    /// evaluation; anything else is evaluated and coerced by truthiness.
    pub fn evaluate_condition(&self, rule: &str, state: &DealState) -> RmbsResult<bool> {
        let trimmed = rule.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Ok(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Ok(false);
        }
        Ok(self.evaluate(rule, state)?.truthy())
    }
}

fn eval_expr(expr: &Expr, state: &DealState) -> RmbsResult<Value> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Text(s) => Ok(Value::Text(s.clone())),
        Expr::Path(path) => resolve_path(path, state),
        Expr::Call(name, args) => eval_call(name, args, state),
        Expr::Unary(op, operand) => {
            let value = eval_expr(operand, state)?;
            match op {
                UnaryOp::Neg => Ok(Value::Number(-value.as_number()?)),
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, state),
    }
}

// ---------------------------------------------------------------------------
// Namespace resolution
// ---------------------------------------------------------------------------

fn resolve_path(path: &[String], state: &DealState) -> RmbsResult<Value> {
    match path {
        [name] => resolve_bare(name, state),
        [ns, rest @ ..] => resolve_namespace(ns, rest, state),
        [] => Err(RmbsError::Calculation("empty identifier".into())),
    }
}

/// Bare identifiers: deal variables first, then cash buckets.
fn resolve_bare(name: &str, state: &DealState) -> RmbsResult<Value> {
    if let Some(value) = state.variables.get(name) {
        return Ok(value.clone());
    }
    if let Some(balance) = state.cash_balances.get(name) {
        return Ok(Value::Number(*balance));
    }
    Err(RmbsError::UnknownVariable(name.to_string()))
}

fn resolve_namespace(ns: &str, rest: &[String], state: &DealState) -> RmbsResult<Value> {
    match (ns, rest) {
        ("funds" | "accounts", [id]) => Ok(Value::Number(
            state
                .cash_balances
                .get(id.as_str())
                .copied()
                .unwrap_or(Decimal::ZERO),
        )),
        ("ledgers", [id]) => Ok(Value::Number(state.ledger(id))),
        ("variables", [name]) => Ok(state
            .variables
            .get(name.as_str())
            .cloned()
            .unwrap_or(Value::Number(Decimal::ZERO))),
        ("collateral", [attr]) => Ok(state
            .collateral
            .get(attr.as_str())
            .map(json_to_value)
            .unwrap_or(Value::Number(Decimal::ZERO))),
        ("bonds", [id, attr]) => {
            // Unknown bonds resolve to a zero-valued wrapper.
            let bond = state.bonds.get(id.as_str());
            let value = match attr.as_str() {
                "balance" => bond.map_or(Decimal::ZERO, |b| b.current_balance),
                "factor" => bond.map_or(Decimal::ZERO, |b| b.factor()),
                "shortfall" => bond.map_or(Decimal::ZERO, |b| b.interest_shortfall),
                "original" => bond.map_or(Decimal::ZERO, |b| b.original_balance),
                other => {
                    return Err(RmbsError::Calculation(format!(
                        "unknown bond attribute '{}'",
                        other
                    )))
                }
            };
            Ok(Value::Number(value))
        }
        ("tests", [id, attr]) => {
            if attr == "failed" {
                Ok(Value::Bool(
                    state.flags.get(id.as_str()).copied().unwrap_or(false),
                ))
            } else {
                Err(RmbsError::Calculation(format!(
                    "unknown test attribute '{}'",
                    attr
                )))
            }
        }
        ("funds" | "accounts" | "ledgers" | "variables" | "collateral", _) => {
            Err(RmbsError::Calculation(format!(
                "'{}' reference takes a single attribute",
                ns
            )))
        }
        ("bonds" | "tests", _) => Err(RmbsError::Calculation(format!(
            "'{}' reference requires an id and an attribute",
            ns
        ))),
        _ => Err(RmbsError::UnknownVariable(ns.to_string())),
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::String(s) => json_decimal(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::Text(s.clone())),
        other => json_decimal(other)
            .map(Value::Number)
            .unwrap_or(Value::Number(Decimal::ZERO)),
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, state: &DealState) -> RmbsResult<Value> {
    // Boolean operators short-circuit
    match op {
        BinaryOp::And => {
            let left = eval_expr(lhs, state)?;
            if !left.truthy() {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(eval_expr(rhs, state)?.truthy()));
        }
        BinaryOp::Or => {
            let left = eval_expr(lhs, state)?;
            if left.truthy() {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(eval_expr(rhs, state)?.truthy()));
        }
        _ => {}
    }

    let left = eval_expr(lhs, state)?;
    let right = eval_expr(rhs, state)?;

    match op {
        BinaryOp::Add => Ok(Value::Number(left.as_number()? + right.as_number()?)),
        BinaryOp::Sub => Ok(Value::Number(left.as_number()? - right.as_number()?)),
        BinaryOp::Mul => Ok(Value::Number(left.as_number()? * right.as_number()?)),
        BinaryOp::Div => {
            let divisor = right.as_number()?;
            if divisor.is_zero() {
                return Err(RmbsError::Calculation("division by zero".into()));
            }
            Ok(Value::Number(left.as_number()? / divisor))
        }
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt => compare(&left, &right).map(|o| Value::Bool(o.is_lt())),
        BinaryOp::Le => compare(&left, &right).map(|o| Value::Bool(o.is_le())),
        BinaryOp::Gt => compare(&left, &right).map(|o| Value::Bool(o.is_gt())),
        BinaryOp::Ge => compare(&left, &right).map(|o| Value::Bool(o.is_ge())),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => a == b,
        (Value::Text(_), _) | (_, Value::Text(_)) => false,
        (a, b) => match (a.as_number(), b.as_number()) {
            (Ok(x), Ok(y)) => x == y,
            _ => false,
        },
    }
}

fn compare(left: &Value, right: &Value) -> RmbsResult<std::cmp::Ordering> {
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        (Value::Text(_), _) | (_, Value::Text(_)) => Err(RmbsError::Calculation(
            "cannot order text against a number".into(),
        )),
        (a, b) => Ok(a.as_number()?.cmp(&b.as_number()?)),
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn eval_call(name: &str, args: &[Expr], state: &DealState) -> RmbsResult<Value> {
    let numbers = |exprs: &[Expr]| -> RmbsResult<Vec<Decimal>> {
        exprs
            .iter()
            .map(|e| eval_expr(e, state)?.as_number())
            .collect()
    };

    match name {
        "MIN" => {
            let values = numbers(args)?;
            values
                .into_iter()
                .min()
                .map(Value::Number)
                .ok_or_else(|| RmbsError::Calculation("MIN requires at least one argument".into()))
        }
        "MAX" => {
            let values = numbers(args)?;
            values
                .into_iter()
                .max()
                .map(Value::Number)
                .ok_or_else(|| RmbsError::Calculation("MAX requires at least one argument".into()))
        }
        "ABS" => match numbers(args)?.as_slice() {
            [x] => Ok(Value::Number(x.abs())),
            _ => Err(RmbsError::Calculation(
                "ABS takes exactly one argument".into(),
            )),
        },
        "ROUND" => match numbers(args)?.as_slice() {
            [x] => Ok(Value::Number(x.round_dp(0))),
            [x, dp] => {
                let dp = dp
                    .to_string()
                    .parse::<u32>()
                    .map_err(|_| RmbsError::Calculation("ROUND precision must be a non-negative integer".into()))?;
                Ok(Value::Number(x.round_dp(dp)))
            }
            _ => Err(RmbsError::Calculation(
                "ROUND takes one or two arguments".into(),
            )),
        },
        "SUM" => Ok(Value::Number(numbers(args)?.into_iter().sum())),
        "FLOOR" => match numbers(args)?.as_slice() {
            [x] => Ok(Value::Number(x.floor())),
            _ => Err(RmbsError::Calculation(
                "FLOOR takes exactly one argument".into(),
            )),
        },
        "CEIL" => match numbers(args)?.as_slice() {
            [x] => Ok(Value::Number(x.ceil())),
            _ => Err(RmbsError::Calculation(
                "CEIL takes exactly one argument".into(),
            )),
        },
        other => Err(RmbsError::UnknownVariable(other.to_string())),
    }
}
