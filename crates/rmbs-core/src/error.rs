use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RmbsError {
    #[error("Invalid JSON structure at {path}: {message}")]
    SchemaViolation { path: String, message: String },

    #[error("Deal logic invalid:\n{0}")]
    LogicIntegrity(String),

    #[error("Unknown variable in rule: {0}")]
    UnknownVariable(String),

    #[error("Calculation error: {0}")]
    Calculation(String),

    #[error("Invalid input: {field} — {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Negative deposit into '{bucket}': {amount}")]
    NegativeDeposit { bucket: String, amount: Decimal },

    #[error("Insufficient funds in {bucket}: requested {requested}, available {available}")]
    InsufficientFunds {
        bucket: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Cash bucket '{0}' does not exist")]
    UnknownBucket(String),

    #[error("Unknown bond '{0}'")]
    UnknownBond(String),

    #[error("ML cashflow generation failed: {0}")]
    External(String),

    #[error("Simulation cancelled at period {0}")]
    Cancelled(u32),
}

impl RmbsError {
    /// True for the two evaluation-error shapes produced by the
    /// expression engine.
    pub fn is_evaluation(&self) -> bool {
        matches!(
            self,
            RmbsError::UnknownVariable(_) | RmbsError::Calculation(_)
        )
    }
}

impl From<serde_json::Error> for RmbsError {
    fn from(e: serde_json::Error) -> Self {
        RmbsError::SchemaViolation {
            path: "$".into(),
            message: e.to_string(),
        }
    }
}
