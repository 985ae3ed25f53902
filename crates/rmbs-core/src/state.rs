//! Mutable deal state and period snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::error::RmbsError;
use crate::expr::Value;
use crate::ingest::json_decimal;
use crate::loader::DealDefinition;
use crate::types::Money;
use crate::RmbsResult;

/// Cash buckets may dip this far below zero to absorb float rounding.
pub const WITHDRAW_TOLERANCE: Decimal = dec!(0.00001);

/// Ledger seeded at zero for every deal.
pub const CUMULATIVE_LOSS_LEDGER: &str = "CumulativeLoss";

/// Per-bond running balances.
#[derive(Debug, Clone, PartialEq)]
pub struct BondState {
    pub original_balance: Money,
    pub current_balance: Money,
    pub deferred_balance: Money,
    pub interest_shortfall: Money,
}

impl BondState {
    pub fn new(original_balance: Money) -> Self {
        BondState {
            original_balance,
            current_balance: original_balance,
            deferred_balance: Decimal::ZERO,
            interest_shortfall: Decimal::ZERO,
        }
    }

    /// Pool-style factor: current over original, 0 for a zero-original bond.
    pub fn factor(&self) -> Decimal {
        if self.original_balance.is_zero() {
            Decimal::ZERO
        } else {
            self.current_balance / self.original_balance
        }
    }
}

/// Immutable record of deal state at the close of one period.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// ISO date of the period close.
    pub date: String,
    pub period: u32,
    pub funds: BTreeMap<String, Money>,
    pub ledgers: BTreeMap<String, Money>,
    pub bond_balances: BTreeMap<String, Money>,
    pub variables: BTreeMap<String, Value>,
    pub flags: BTreeMap<String, bool>,
}

/// Mutable simulation state for one deal.
///
/// Created from a frozen [`DealDefinition`], mutated by the simulation
/// driver (deposits, collateral updates) and the waterfall runner, and
/// frozen per-period by [`DealState::snapshot`].
#[derive(Debug, Clone)]
pub struct DealState {
    pub def_: Arc<DealDefinition>,
    pub current_date: Option<NaiveDate>,
    /// Equals `history.len()` between periods.
    pub period_index: u32,
    /// Funds and accounts share this namespace.
    pub cash_balances: BTreeMap<String, Money>,
    pub ledgers: BTreeMap<String, Money>,
    pub bonds: BTreeMap<String, BondState>,
    pub variables: BTreeMap<String, Value>,
    pub flags: BTreeMap<String, bool>,
    /// Mutable copy of the definition's collateral attributes.
    pub collateral: Map<String, Json>,
    /// Per-run variable rule overrides. The definition itself stays frozen;
    /// the runner consults this map before `def_.variables`.
    pub rule_overrides: BTreeMap<String, String>,
    pub history: Vec<Snapshot>,
}

impl DealState {
    pub fn new(definition: Arc<DealDefinition>) -> Self {
        let mut cash_balances = BTreeMap::new();
        for fund_id in definition.funds.keys() {
            cash_balances.insert(fund_id.clone(), Decimal::ZERO);
        }
        for account_id in definition.accounts.keys() {
            cash_balances.insert(account_id.clone(), Decimal::ZERO);
        }

        let mut bonds = BTreeMap::new();
        for (bond_id, bond) in &definition.bonds {
            bonds.insert(bond_id.clone(), BondState::new(bond.original_balance));
        }

        let mut ledgers = BTreeMap::new();
        ledgers.insert(CUMULATIVE_LOSS_LEDGER.to_string(), Decimal::ZERO);

        DealState {
            collateral: definition.collateral.clone(),
            def_: definition,
            current_date: None,
            period_index: 0,
            cash_balances,
            ledgers,
            bonds,
            variables: BTreeMap::new(),
            flags: BTreeMap::new(),
            rule_overrides: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    fn bucket_mut(&mut self, bucket_id: &str) -> RmbsResult<&mut Money> {
        self.cash_balances
            .get_mut(bucket_id)
            .ok_or_else(|| RmbsError::UnknownBucket(bucket_id.to_string()))
    }

    pub fn deposit(&mut self, bucket_id: &str, amount: Money) -> RmbsResult<()> {
        if amount < Decimal::ZERO {
            return Err(RmbsError::NegativeDeposit {
                bucket: bucket_id.to_string(),
                amount,
            });
        }
        *self.bucket_mut(bucket_id)? += amount;
        Ok(())
    }

    pub fn withdraw(&mut self, bucket_id: &str, amount: Money) -> RmbsResult<()> {
        let balance = self.bucket_mut(bucket_id)?;
        if *balance < amount - WITHDRAW_TOLERANCE {
            return Err(RmbsError::InsufficientFunds {
                bucket: bucket_id.to_string(),
                requested: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    pub fn transfer(&mut self, from_id: &str, to_id: &str, amount: Money) -> RmbsResult<()> {
        // Validate the target before touching the source so a failed
        // transfer leaves both buckets unchanged.
        if !self.cash_balances.contains_key(to_id) {
            return Err(RmbsError::UnknownBucket(to_id.to_string()));
        }
        self.withdraw(from_id, amount)?;
        *self.bucket_mut(to_id)? += amount;
        Ok(())
    }

    /// Pay principal to a bond, capped at its remaining balance. A no-op for
    /// a retired bond or a non-positive amount.
    pub fn pay_principal(
        &mut self,
        bond_id: &str,
        amount: Money,
        source_bucket: &str,
    ) -> RmbsResult<()> {
        let payment = match self.bonds.get(bond_id) {
            None => return Err(RmbsError::UnknownBond(bond_id.to_string())),
            Some(b) if b.current_balance <= Decimal::ZERO || amount <= Decimal::ZERO => {
                return Ok(())
            }
            Some(b) => amount.min(b.current_balance),
        };
        self.withdraw(source_bucket, payment)?;
        if let Some(bond) = self.bonds.get_mut(bond_id) {
            bond.current_balance = (bond.current_balance - payment).max(Decimal::ZERO);
        }
        Ok(())
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_ledger(&mut self, ledger_id: &str, value: Money) {
        self.ledgers.insert(ledger_id.to_string(), value);
    }

    pub fn ledger(&self, ledger_id: &str) -> Money {
        self.ledgers
            .get(ledger_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Numeric collateral attribute, 0 when missing or non-numeric.
    pub fn collateral_number(&self, key: &str) -> Money {
        self.collateral
            .get(key)
            .and_then(json_decimal)
            .unwrap_or(Decimal::ZERO)
    }

    /// Overwrite a numeric collateral attribute. Stored in the string form
    /// used by `serde-with-str` so no precision is lost round-tripping.
    pub fn set_collateral_number(&mut self, key: &str, value: Money) {
        self.collateral
            .insert(key.to_string(), Json::String(value.to_string()));
    }

    /// Close the period: bump `period_index` and append an independent copy
    /// of funds, ledgers, bond balances, variables, and flags.
    pub fn snapshot(&mut self, current_date: NaiveDate) {
        self.current_date = Some(current_date);
        self.period_index += 1;
        let snap = Snapshot {
            date: current_date.format("%Y-%m-%d").to_string(),
            period: self.period_index,
            funds: self.cash_balances.clone(),
            ledgers: self.ledgers.clone(),
            bond_balances: self
                .bonds
                .iter()
                .map(|(id, b)| (id.clone(), b.current_balance))
                .collect(),
            variables: self.variables.clone(),
            flags: self.flags.clone(),
        };
        self.history.push(snap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DealLoader;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_state() -> DealState {
        let spec = json!({
            "meta": {"deal_id": "STATE_TEST"},
            "bonds": [
                {"id": "A", "original_balance": 1000.0,
                 "coupon": {"kind": "FIXED", "fixed_rate": 0.05},
                 "priority": {"interest": 1, "principal": 1}}
            ],
            "funds": [
                {"id": "IAF"}, {"id": "PAF"}
            ],
            "accounts": [{"id": "RES", "type": "RESERVE"}],
            "collateral": {"original_balance": 1000.0, "current_balance": 1000.0},
            "waterfalls": {}
        });
        let deal = DealLoader::new()
            .load(spec.as_object().unwrap())
            .unwrap();
        DealState::new(Arc::new(deal))
    }

    #[test]
    fn test_initialization() {
        let state = sample_state();
        assert_eq!(state.period_index, 0);
        assert_eq!(state.cash_balances.len(), 3);
        assert_eq!(state.cash_balances["IAF"], Decimal::ZERO);
        assert_eq!(state.ledger(CUMULATIVE_LOSS_LEDGER), Decimal::ZERO);
        assert_eq!(state.bonds["A"].current_balance, dec!(1000));
        assert_eq!(state.bonds["A"].factor(), Decimal::ONE);
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut state = sample_state();
        state.deposit("IAF", dec!(500)).unwrap();
        assert_eq!(state.cash_balances["IAF"], dec!(500));
        state.withdraw("IAF", dec!(200)).unwrap();
        assert_eq!(state.cash_balances["IAF"], dec!(300));
    }

    #[test]
    fn test_negative_deposit_rejected() {
        let mut state = sample_state();
        let err = state.deposit("IAF", dec!(-1)).unwrap_err();
        assert!(matches!(err, RmbsError::NegativeDeposit { .. }));
    }

    #[test]
    fn test_unknown_bucket_rejected() {
        let mut state = sample_state();
        assert!(matches!(
            state.deposit("XYZ", dec!(1)).unwrap_err(),
            RmbsError::UnknownBucket(_)
        ));
    }

    #[test]
    fn test_overdraw_rejected_within_tolerance() {
        let mut state = sample_state();
        state.deposit("IAF", dec!(100)).unwrap();
        // Within the rounding tolerance: allowed
        state.withdraw("IAF", dec!(100.000005)).unwrap();
        // Clearly past it: rejected
        let mut state2 = sample_state();
        state2.deposit("IAF", dec!(100)).unwrap();
        assert!(state2.withdraw("IAF", dec!(100.1)).is_err());
    }

    #[test]
    fn test_transfer_atomicity() {
        let mut state = sample_state();
        state.deposit("IAF", dec!(100)).unwrap();
        assert!(state.transfer("IAF", "NOPE", dec!(50)).is_err());
        assert_eq!(state.cash_balances["IAF"], dec!(100));
        state.transfer("IAF", "RES", dec!(50)).unwrap();
        assert_eq!(state.cash_balances["IAF"], dec!(50));
        assert_eq!(state.cash_balances["RES"], dec!(50));
    }

    #[test]
    fn test_pay_principal_caps_at_balance() {
        let mut state = sample_state();
        state.deposit("PAF", dec!(5000)).unwrap();
        state.pay_principal("A", dec!(5000), "PAF").unwrap();
        assert_eq!(state.bonds["A"].current_balance, Decimal::ZERO);
        // Only the capped amount left the bucket
        assert_eq!(state.cash_balances["PAF"], dec!(4000));
        // Retired bond: further payments are a no-op
        state.pay_principal("A", dec!(100), "PAF").unwrap();
        assert_eq!(state.cash_balances["PAF"], dec!(4000));
    }

    #[test]
    fn test_snapshot_copies_are_independent() {
        let mut state = sample_state();
        state.deposit("IAF", dec!(10)).unwrap();
        state.set_variable("X", dec!(1));
        state.snapshot(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
        assert_eq!(state.period_index, 1);
        assert_eq!(state.history.len(), 1);

        state.deposit("IAF", dec!(90)).unwrap();
        state.set_variable("X", dec!(2));
        let snap = &state.history[0];
        assert_eq!(snap.funds["IAF"], dec!(10));
        assert_eq!(snap.variables["X"], Value::Number(dec!(1)));
        assert_eq!(snap.date, "2025-01-31");
    }

    #[test]
    fn test_collateral_number_roundtrip() {
        let mut state = sample_state();
        assert_eq!(state.collateral_number("current_balance"), dec!(1000));
        state.set_collateral_number("current_balance", dec!(123.45));
        assert_eq!(state.collateral_number("current_balance"), dec!(123.45));
        assert_eq!(state.collateral_number("missing"), Decimal::ZERO);
    }
}
