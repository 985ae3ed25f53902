//! Cashflow reporting.
//!
//! Flattens a simulation's snapshot history into a wide tabular report:
//! one row per period, columns for bond balances, fund balances, ledgers,
//! and variables, plus derived per-bond principal-paid columns.

use std::collections::BTreeMap;

use log::warn;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::expr::Value;
use crate::state::Snapshot;
use crate::types::Money;

/// A flattened report row: column name to cell value.
pub type ReportRow = BTreeMap<String, Value>;

/// Tabular cashflow report in period order.
///
/// `columns` carries the presentation order (`Period`, `Date`, state
/// columns in first-appearance order, then derived `*.Prin_Paid` columns);
/// rows are keyed maps so sparse columns are simply absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CashflowReport {
    pub columns: Vec<String>,
    pub rows: Vec<ReportRow>,
}

impl CashflowReport {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Numeric cell lookup, `None` for missing or non-numeric cells.
    pub fn number(&self, row: usize, column: &str) -> Option<Decimal> {
        self.rows
            .get(row)?
            .get(column)
            .and_then(|v| v.as_number().ok())
    }
}

/// Build tabular cashflow reports from deal simulation snapshots.
#[derive(Debug)]
pub struct ReportGenerator<'a> {
    history: &'a [Snapshot],
}

impl<'a> ReportGenerator<'a> {
    pub fn new(history: &'a [Snapshot]) -> Self {
        ReportGenerator { history }
    }

    /// Convert snapshots into a period-by-period cashflow report.
    ///
    /// Derived metric: `Bond.<id>.Prin_Paid = Balance(T-1) - Balance(T)`,
    /// fixed at 0 for the first row.
    pub fn generate(&self) -> CashflowReport {
        if self.history.is_empty() {
            warn!("No history found. Returning empty report.");
            return CashflowReport::default();
        }

        let mut columns: Vec<String> = vec!["Period".into(), "Date".into()];
        let mut seen: std::collections::BTreeSet<String> = columns.iter().cloned().collect();
        let mut push_column = |columns: &mut Vec<String>, name: String| {
            if seen.insert(name.clone()) {
                columns.push(name);
            }
        };

        let mut rows: Vec<ReportRow> = Vec::with_capacity(self.history.len());
        for snap in self.history {
            let mut row = ReportRow::new();
            row.insert("Period".into(), Value::Number(Decimal::from(snap.period)));
            row.insert("Date".into(), Value::Text(snap.date.clone()));

            for (bond_id, balance) in &snap.bond_balances {
                let column = format!("Bond.{}.Balance", bond_id);
                push_column(&mut columns, column.clone());
                row.insert(column, Value::Number(*balance));
            }
            for (fund_id, amount) in &snap.funds {
                let column = format!("Fund.{}.Balance", fund_id);
                push_column(&mut columns, column.clone());
                row.insert(column, Value::Number(*amount));
            }
            for (ledger_id, amount) in &snap.ledgers {
                let column = format!("Ledger.{}", ledger_id);
                push_column(&mut columns, column.clone());
                row.insert(column, Value::Number(*amount));
            }
            for (var_name, value) in &snap.variables {
                let column = format!("Var.{}", var_name);
                push_column(&mut columns, column.clone());
                row.insert(column, value.clone());
            }

            rows.push(row);
        }

        // Derived flows from balance deltas
        let bond_ids: Vec<String> = self
            .history
            .iter()
            .flat_map(|s| s.bond_balances.keys().cloned())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        for bond_id in &bond_ids {
            let balance_column = format!("Bond.{}.Balance", bond_id);
            let paid_column = format!("Bond.{}.Prin_Paid", bond_id);
            push_column(&mut columns, paid_column.clone());

            let mut previous: Option<Money> = None;
            for row in rows.iter_mut() {
                let current = row
                    .get(&balance_column)
                    .and_then(|v| v.as_number().ok());
                let paid = match (previous, current) {
                    (Some(prev), Some(curr)) => prev - curr,
                    _ => Decimal::ZERO,
                };
                row.insert(paid_column.clone(), Value::Number(paid));
                previous = current;
            }
        }

        CashflowReport { columns, rows }
    }
}
