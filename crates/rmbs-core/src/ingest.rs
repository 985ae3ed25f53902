//! Ingestion helpers: collateral payload normalization and servicer
//! performance tape preparation.
//!
//! Servicer tapes arrive as loosely-typed rows (CSV or JSON) with vendor
//! column-name variations. This module normalizes aliases, coerces periods,
//! splits loan-level from pool-level rows, and aggregates everything into
//! one typed row per period for the simulation driver.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::{Map, Value as Json};

use crate::types::Money;

/// Column aliases accepted from servicer tapes.
const COLUMN_ALIASES: &[(&str, &str)] = &[
    ("BondID", "BondId"),
    ("LoanID", "LoanId"),
    ("EndingBalance", "EndBalance"),
    ("Prepayments", "Prepayment"),
    ("Recovery", "Recoveries"),
];

/// Flow columns summed when grouping pool-level rows by period.
const SUM_COLUMNS: &[&str] = &[
    "InterestCollected",
    "PrincipalCollected",
    "RealizedLoss",
    "ScheduledPrincipal",
    "Prepayment",
    "ScheduledInterest",
    "ServicerAdvances",
    "Recoveries",
    "Defaults",
];

/// Rate/balance columns where the last reported value per period wins.
const LAST_COLUMNS: &[&str] = &[
    "Delinq30",
    "Delinq60",
    "Delinq90Plus",
    "Delinq60Plus",
    "CPR",
    "CDR",
    "Severity",
    "EndBalance",
];

/// Columns summed when aggregating loan-level rows to pool level.
const LOAN_SUM_COLUMNS: &[&str] = &[
    "InterestCollected",
    "PrincipalCollected",
    "RealizedLoss",
    "EndBalance",
];

/// Lenient JSON-to-Decimal conversion: numbers and numeric strings.
pub fn json_decimal(value: &Json) -> Option<Decimal> {
    match value {
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                n.as_f64().and_then(|f| Decimal::try_from(f).ok())
            }
        }
        Json::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<Decimal>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(|f| Decimal::try_from(f).ok()))
        }
        _ => None,
    }
}

pub(crate) fn json_i64(value: &Json) -> Option<i64> {
    match value {
        Json::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Json::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

fn json_text(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Collateral normalization
// ---------------------------------------------------------------------------

fn loan_number(loan: &Map<String, Json>, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        if let Some(value) = loan.get(*key) {
            if !value.is_null() {
                return json_decimal(value);
            }
        }
    }
    None
}

/// Normalize a collateral payload:
///
/// - unwrap `{deal_id, data: {...}}` envelopes (up to 5 levels), carrying
///   the top-level `deal_id` into the unwrapped payload;
/// - when a `loans` array is present, derive pool-level `original_balance`,
///   `current_balance`, `wac`, and `wam` from the loan records, overwriting
///   any provided aggregates.
pub fn normalize_collateral(collateral: &Map<String, Json>) -> Map<String, Json> {
    let mut current = collateral.clone();
    let mut depth = 0;
    while depth < 5 {
        let wrapped = match current.get("data").and_then(Json::as_object) {
            Some(inner) => inner.clone(),
            None => break,
        };
        let mut next = wrapped;
        if let Some(deal_id) = current.get("deal_id") {
            if !next.contains_key("deal_id") {
                next.insert("deal_id".to_string(), deal_id.clone());
            }
        }
        current = next;
        depth += 1;
    }

    let loans = match current.get("loans").and_then(Json::as_array) {
        Some(loans) if !loans.is_empty() => loans.clone(),
        _ => return current,
    };

    let mut orig_sum = Decimal::ZERO;
    let mut curr_sum = Decimal::ZERO;
    let mut wac_num = Decimal::ZERO;
    let mut wam_num = Decimal::ZERO;

    for loan in loans.iter().filter_map(Json::as_object) {
        let orig = loan_number(loan, &["original_balance", "OriginalBalance", "orig_balance"]);
        let mut curr = loan_number(loan, &["current_balance", "CurrentBalance", "end_balance"]);
        let rate = loan_number(loan, &["note_rate", "NoteRate", "coupon"]);
        let term = loan_number(
            loan,
            &["remaining_term_months", "RemainingTermMonths", "remaining_term"],
        );

        if let Some(orig) = orig {
            orig_sum += orig;
        }
        if curr.is_none() {
            curr = orig;
        }
        if let Some(curr) = curr {
            curr_sum += curr;
            if let Some(rate) = rate {
                wac_num += rate * curr;
            }
            if let Some(term) = term {
                wam_num += term * curr;
            }
        }
    }

    if curr_sum > Decimal::ZERO {
        current.insert(
            "original_balance".to_string(),
            Json::String(orig_sum.round_dp(2).to_string()),
        );
        current.insert(
            "current_balance".to_string(),
            Json::String(curr_sum.round_dp(2).to_string()),
        );
        if wac_num > Decimal::ZERO {
            current.insert(
                "wac".to_string(),
                Json::String((wac_num / curr_sum).round_dp(6).to_string()),
            );
        }
        if wam_num > Decimal::ZERO {
            let wam = (wam_num / curr_sum).round_dp(0);
            current.insert("wam".to_string(), Json::String(wam.to_string()));
        }
    }

    current
}

// ---------------------------------------------------------------------------
// Performance tape preparation
// ---------------------------------------------------------------------------

/// One pool-level period aggregated from the servicer tape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolPeriodRow {
    pub period: i64,
    pub interest_collected: Money,
    pub principal_collected: Money,
    pub realized_loss: Money,
    pub prepayment: Money,
    pub scheduled_principal: Money,
    pub scheduled_interest: Money,
    pub servicer_advances: Money,
    pub recoveries: Money,
    pub defaults: Money,
    pub end_balance: Option<Money>,
    pub delinq30: Option<Money>,
    pub delinq60: Option<Money>,
    pub delinq90_plus: Option<Money>,
    pub delinq60_plus: Option<Money>,
    pub cpr: Option<Money>,
    pub cdr: Option<Money>,
    pub severity: Option<Money>,
    pub pool_status: Option<String>,
}

/// Normalized servicer tape: one aggregated row per period, plus per-bond
/// tape balances used for reconciliation.
#[derive(Debug, Clone, Default)]
pub struct PreparedTape {
    pub pool_rows: Vec<PoolPeriodRow>,
    pub bond_balances_by_period: BTreeMap<i64, BTreeMap<String, Money>>,
}

impl PreparedTape {
    pub fn latest_period(&self) -> Option<i64> {
        let pool_max = self.pool_rows.iter().map(|r| r.period).max();
        let bond_max = self.bond_balances_by_period.keys().max().copied();
        pool_max.max(bond_max)
    }

    /// Last reported pool end balance, in period order.
    pub fn latest_end_balance(&self) -> Option<Money> {
        self.pool_rows
            .iter()
            .rev()
            .find_map(|r| r.end_balance)
    }

    pub fn total_principal_collected(&self) -> Money {
        self.pool_rows.iter().map(|r| r.principal_collected).sum()
    }
}

fn normalize_row(row: &Map<String, Json>) -> Map<String, Json> {
    let mut out = row.clone();
    for (alias, canonical) in COLUMN_ALIASES {
        if out.contains_key(*alias) && !out.contains_key(*canonical) {
            if let Some(value) = out.remove(*alias) {
                out.insert((*canonical).to_string(), value);
            }
        }
    }
    out
}

fn row_number(row: &Map<String, Json>, key: &str) -> Option<Decimal> {
    row.get(key).and_then(json_decimal)
}

/// Normalize and aggregate raw tape rows.
///
/// Rows without a numeric `Period` are dropped. When any row carries a
/// `LoanId`, the tape is treated as loan-level: loan rows are summed by
/// period over [`LOAN_SUM_COLUMNS`] and bond-level extraction is skipped.
/// Otherwise rows are grouped by period with sum aggregation for flow
/// columns and last-value aggregation for rate/balance columns.
pub fn prepare_performance(rows: &[Map<String, Json>]) -> PreparedTape {
    let mut normalized: Vec<(i64, Map<String, Json>)> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut row = normalize_row(row);
        let period = match row.get("Period").and_then(json_i64) {
            Some(p) => p,
            None => continue,
        };
        if row_number(&row, "PrincipalCollected").is_none() {
            let sched = row_number(&row, "ScheduledPrincipal").unwrap_or(Decimal::ZERO);
            let prepay = row_number(&row, "Prepayment").unwrap_or(Decimal::ZERO);
            if row.contains_key("ScheduledPrincipal") || row.contains_key("Prepayment") {
                row.insert(
                    "PrincipalCollected".to_string(),
                    Json::String((sched + prepay).to_string()),
                );
            }
        }
        normalized.push((period, row));
    }

    let loan_level = normalized
        .iter()
        .any(|(_, row)| row.get("LoanId").map_or(false, |v| !v.is_null()));

    let mut by_period: BTreeMap<i64, Vec<&Map<String, Json>>> = BTreeMap::new();
    for (period, row) in &normalized {
        let is_loan_row = row.get("LoanId").map_or(false, |v| !v.is_null());
        if loan_level && !is_loan_row {
            continue;
        }
        by_period.entry(*period).or_default().push(row);
    }

    let mut pool_rows = Vec::with_capacity(by_period.len());
    for (period, rows) in &by_period {
        let mut agg = PoolPeriodRow {
            period: *period,
            ..Default::default()
        };

        if loan_level {
            let mut end_balance_seen = false;
            let mut end_balance_sum = Decimal::ZERO;
            for row in rows {
                for col in LOAN_SUM_COLUMNS {
                    let value = match row_number(row, col) {
                        Some(v) => v,
                        None => continue,
                    };
                    match *col {
                        "InterestCollected" => agg.interest_collected += value,
                        "PrincipalCollected" => agg.principal_collected += value,
                        "RealizedLoss" => agg.realized_loss += value,
                        "EndBalance" => {
                            end_balance_seen = true;
                            end_balance_sum += value;
                        }
                        _ => unreachable!(),
                    }
                }
                if let Some(status) = row.get("PoolStatus").and_then(json_text) {
                    agg.pool_status = Some(status);
                }
            }
            if end_balance_seen {
                agg.end_balance = Some(end_balance_sum);
            }
        } else {
            for row in rows {
                for col in SUM_COLUMNS {
                    let value = match row_number(row, col) {
                        Some(v) => v,
                        None => continue,
                    };
                    match *col {
                        "InterestCollected" => agg.interest_collected += value,
                        "PrincipalCollected" => agg.principal_collected += value,
                        "RealizedLoss" => agg.realized_loss += value,
                        "ScheduledPrincipal" => agg.scheduled_principal += value,
                        "Prepayment" => agg.prepayment += value,
                        "ScheduledInterest" => agg.scheduled_interest += value,
                        "ServicerAdvances" => agg.servicer_advances += value,
                        "Recoveries" => agg.recoveries += value,
                        "Defaults" => agg.defaults += value,
                        _ => unreachable!(),
                    }
                }
                for col in LAST_COLUMNS {
                    let value = match row_number(row, col) {
                        Some(v) => v,
                        None => continue,
                    };
                    match *col {
                        "Delinq30" => agg.delinq30 = Some(value),
                        "Delinq60" => agg.delinq60 = Some(value),
                        "Delinq90Plus" => agg.delinq90_plus = Some(value),
                        "Delinq60Plus" => agg.delinq60_plus = Some(value),
                        "CPR" => agg.cpr = Some(value),
                        "CDR" => agg.cdr = Some(value),
                        "Severity" => agg.severity = Some(value),
                        "EndBalance" => agg.end_balance = Some(value),
                        _ => unreachable!(),
                    }
                }
                if let Some(status) = row.get("PoolStatus").and_then(json_text) {
                    agg.pool_status = Some(status);
                }
            }
        }

        pool_rows.push(agg);
    }

    let mut bond_balances_by_period: BTreeMap<i64, BTreeMap<String, Money>> = BTreeMap::new();
    if !loan_level {
        for (period, row) in &normalized {
            let bond_id = match row.get("BondId").and_then(json_text) {
                Some(id) => id,
                None => continue,
            };
            let balance = match row_number(row, "BondBalance") {
                Some(b) => b,
                None => continue,
            };
            bond_balances_by_period
                .entry(*period)
                .or_default()
                .insert(bond_id, balance);
        }
    }

    PreparedTape {
        pool_rows,
        bond_balances_by_period,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn rows(values: Json) -> Vec<Map<String, Json>> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_aliases_accepted() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "EndingBalance": 900.0, "Prepayments": 10.0,
             "Recovery": 5.0, "ScheduledPrincipal": 2.0}
        ])));
        let row = &tape.pool_rows[0];
        assert_eq!(row.end_balance, Some(dec!(900)));
        assert_eq!(row.prepayment, dec!(10));
        assert_eq!(row.recoveries, dec!(5));
    }

    #[test]
    fn test_non_numeric_period_dropped() {
        let tape = prepare_performance(&rows(json!([
            {"Period": "not-a-period", "InterestCollected": 1.0},
            {"Period": "2", "InterestCollected": 3.0}
        ])));
        assert_eq!(tape.pool_rows.len(), 1);
        assert_eq!(tape.pool_rows[0].period, 2);
    }

    #[test]
    fn test_principal_collected_computed_from_components() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "ScheduledPrincipal": 100.0, "Prepayment": 25.0}
        ])));
        assert_eq!(tape.pool_rows[0].principal_collected, dec!(125));
    }

    #[test]
    fn test_pool_rows_sum_flows_and_keep_last_rates() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "InterestCollected": 10.0, "Delinq60Plus": 0.02, "EndBalance": 990.0},
            {"Period": 1, "InterestCollected": 5.0, "Delinq60Plus": 0.03, "EndBalance": 980.0}
        ])));
        let row = &tape.pool_rows[0];
        assert_eq!(row.interest_collected, dec!(15));
        assert_eq!(row.delinq60_plus, Some(dec!(0.03)));
        assert_eq!(row.end_balance, Some(dec!(980)));
    }

    #[test]
    fn test_loan_level_rows_are_summed() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "LoanId": "L1", "InterestCollected": 100.0,
             "PrincipalCollected": 500.0},
            {"Period": 1, "LoanId": "L2", "InterestCollected": 150.0,
             "PrincipalCollected": 600.0},
            {"Period": 2, "LoanId": "L1", "InterestCollected": 95.0,
             "PrincipalCollected": 510.0},
            {"Period": 2, "LoanId": "L2", "InterestCollected": 145.0,
             "PrincipalCollected": 590.0}
        ])));
        assert_eq!(tape.pool_rows.len(), 2);
        assert_eq!(tape.pool_rows[0].interest_collected, dec!(250));
        assert_eq!(tape.pool_rows[1].interest_collected, dec!(240));
        assert_eq!(tape.pool_rows[0].principal_collected, dec!(1100));
    }

    #[test]
    fn test_bond_rows_extracted_when_pool_level() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "InterestCollected": 10.0},
            {"Period": 1, "BondID": "A", "BondBalance": 999000.0},
            {"Period": 1, "BondId": "B", "BondBalance": 250000.0}
        ])));
        let bonds = &tape.bond_balances_by_period[&1];
        assert_eq!(bonds["A"], dec!(999000));
        assert_eq!(bonds["B"], dec!(250000));
    }

    #[test]
    fn test_bond_rows_skipped_when_loan_level() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "LoanId": "L1", "InterestCollected": 10.0},
            {"Period": 1, "BondId": "A", "BondBalance": 999000.0}
        ])));
        assert!(tape.bond_balances_by_period.is_empty());
    }

    #[test]
    fn test_latest_helpers() {
        let tape = prepare_performance(&rows(json!([
            {"Period": 1, "PrincipalCollected": 100.0, "EndBalance": 900.0},
            {"Period": 2, "PrincipalCollected": 50.0},
            {"Period": 3, "BondId": "A", "BondBalance": 800.0}
        ])));
        assert_eq!(tape.latest_period(), Some(3));
        assert_eq!(tape.latest_end_balance(), Some(dec!(900)));
        assert_eq!(tape.total_principal_collected(), dec!(150));
    }

    #[test]
    fn test_collateral_envelope_unwrapped() {
        let payload = json!({
            "deal_id": "DEMO",
            "data": {"data": {"original_balance": 1000.0, "wac": 0.06}}
        });
        let normalized = normalize_collateral(payload.as_object().unwrap());
        assert_eq!(
            normalized.get("original_balance").and_then(json_decimal),
            Some(dec!(1000))
        );
        assert_eq!(
            normalized.get("deal_id").and_then(Json::as_str),
            Some("DEMO")
        );
    }

    #[test]
    fn test_loan_level_collateral_aggregated() {
        let payload = json!({
            "loans": [
                {"original_balance": 600.0, "current_balance": 500.0,
                 "note_rate": 0.05, "remaining_term_months": 300},
                {"original_balance": 600.0, "current_balance": 250.0,
                 "note_rate": 0.08, "remaining_term_months": 360}
            ]
        });
        let normalized = normalize_collateral(payload.as_object().unwrap());
        assert_eq!(
            normalized.get("original_balance").and_then(json_decimal),
            Some(dec!(1200))
        );
        assert_eq!(
            normalized.get("current_balance").and_then(json_decimal),
            Some(dec!(750))
        );
        // wac = (0.05*500 + 0.08*250) / 750 = 0.06
        assert_eq!(normalized.get("wac").and_then(json_decimal), Some(dec!(0.06)));
        // wam = (300*500 + 360*250) / 750 = 320
        assert_eq!(normalized.get("wam").and_then(json_decimal), Some(dec!(320)));
    }

    #[test]
    fn test_loan_missing_current_defaults_to_original() {
        let payload = json!({
            "loans": [{"OriginalBalance": 100.0, "NoteRate": 0.06}]
        });
        let normalized = normalize_collateral(payload.as_object().unwrap());
        assert_eq!(
            normalized.get("current_balance").and_then(json_decimal),
            Some(dec!(100))
        );
    }
}
