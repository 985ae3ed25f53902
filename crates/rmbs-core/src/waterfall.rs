//! Per-period waterfall orchestration.
//!
//! Within a period, execution order is strict: trigger tests, derived
//! variables, interest waterfall, principal waterfall, loss allocation.

use log::info;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::RmbsError;
use crate::expr::ExpressionEngine;
use crate::loader::{PassIf, StepAction, WaterfallStep};
use crate::state::{DealState, CUMULATIVE_LOSS_LEDGER};
use crate::RmbsResult;

/// Payments smaller than this are not emitted.
pub const PAYMENT_EPSILON: Decimal = dec!(0.000001);

/// Shortfalls smaller than this are not ledgered.
pub const SHORTFALL_THRESHOLD: Decimal = dec!(0.01);

/// Executes one deal period against a [`DealState`].
#[derive(Debug, Clone, Default)]
pub struct WaterfallRunner {
    engine: ExpressionEngine,
}

impl WaterfallRunner {
    pub fn new(engine: ExpressionEngine) -> Self {
        WaterfallRunner { engine }
    }

    /// Evaluate tests and variables without executing waterfalls. Used for
    /// historical actuals where cashflows are recorded, not simulated.
    pub fn evaluate_period(&self, state: &mut DealState) -> RmbsResult<()> {
        self.run_tests(state)?;
        self.calculate_variables(state)?;
        Ok(())
    }

    /// Run one full period: tests, variables, interest waterfall, principal
    /// waterfall, loss allocation.
    pub fn run_period(&self, state: &mut DealState) -> RmbsResult<()> {
        info!("--- Running period {} ---", state.period_index + 1);

        // Tests first, so variables can read tests.<id>.failed
        self.run_tests(state)?;
        self.calculate_variables(state)?;

        info!("Executing interest waterfall");
        self.execute_waterfall(state, "interest")?;

        info!("Executing principal waterfall");
        self.execute_waterfall(state, "principal")?;

        self.allocate_losses(state)?;
        Ok(())
    }

    fn run_tests(&self, state: &mut DealState) -> RmbsResult<()> {
        let def = state.def_.clone();
        for test in &def.tests {
            let value = self.engine.evaluate_number(&test.value_rule, state)?;
            let threshold = self.engine.evaluate_number(&test.threshold_rule, state)?;

            let passed = match test.pass_if {
                PassIf::ValueLtThreshold => value < threshold,
                PassIf::ValueLeqThreshold => value <= threshold,
                PassIf::ValueGtThreshold => value > threshold,
                PassIf::ValueGeqThreshold => value >= threshold,
            };

            state.flags.insert(test.id.clone(), !passed);
            if !passed {
                for effect in &test.effects {
                    state.flags.insert(effect.set_flag.clone(), true);
                }
            }
        }
        Ok(())
    }

    /// Evaluate every deal variable in declaration order. A variable that
    /// references a not-yet-computed variable observes its previous-period
    /// value through the state.
    fn calculate_variables(&self, state: &mut DealState) -> RmbsResult<()> {
        let def = state.def_.clone();
        for (name, rule) in &def.variables {
            let rule = state
                .rule_overrides
                .get(name)
                .map(String::as_str)
                .unwrap_or(rule);
            let value = self.engine.evaluate(rule, state)?;
            state.set_variable(name, value);
        }
        Ok(())
    }

    fn execute_waterfall(&self, state: &mut DealState, waterfall_name: &str) -> RmbsResult<()> {
        let def = state.def_.clone();
        let waterfall = match def.waterfalls.get(waterfall_name) {
            Some(w) => w,
            None => return Ok(()),
        };

        for step in &waterfall.steps {
            let condition = step.condition.as_deref().unwrap_or("true");
            if !self.engine.evaluate_condition(condition, state)? {
                continue;
            }

            let available = state
                .cash_balances
                .get(&step.from_fund)
                .copied()
                .unwrap_or(Decimal::ZERO);

            let target = match step.amount_rule.as_str() {
                "ALL" | "REMAINING" => available,
                rule => self.engine.evaluate_number(rule, state)?,
            };

            let payment = available.min(target.max(Decimal::ZERO));
            if payment > PAYMENT_EPSILON {
                self.dispatch(state, step, payment)?;
            }

            let shortfall = target - payment;
            if shortfall > SHORTFALL_THRESHOLD {
                if let Some(ledger_id) = &step.unpaid_ledger_id {
                    let current = state.ledger(ledger_id);
                    state.set_ledger(ledger_id, current + shortfall);
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        state: &mut DealState,
        step: &WaterfallStep,
        payment: Decimal,
    ) -> RmbsResult<()> {
        match step.action {
            StepAction::PayBondInterest => {
                // Interest paid is observable via fund flows and
                // deal-defined variables/ledgers; no bond-level receivable.
                state.withdraw(&step.from_fund, payment)
            }
            StepAction::PayBondPrincipal => {
                let group = step.group.as_deref().ok_or_else(|| {
                    RmbsError::Calculation(format!(
                        "principal step '{}' has no bond group",
                        step.id
                    ))
                })?;
                state.pay_principal(group, payment, &step.from_fund)
            }
            StepAction::TransferFund => {
                let to = step.to.as_deref().ok_or_else(|| {
                    RmbsError::Calculation(format!("transfer step '{}' has no target", step.id))
                })?;
                state.transfer(&step.from_fund, to, payment)
            }
            StepAction::PayFee => state.withdraw(&step.from_fund, payment),
        }
    }

    /// Write bonds down by the period's realized loss, in the deal's
    /// write-down order, and accrue the loss into the CumulativeLoss ledger.
    fn allocate_losses(&self, state: &mut DealState) -> RmbsResult<()> {
        let loss = state
            .get_variable("RealizedLoss")
            .and_then(|v| v.as_number().ok())
            .unwrap_or(Decimal::ZERO);
        if loss <= Decimal::ZERO {
            return Ok(());
        }

        let def = state.def_.clone();
        let order = def
            .waterfalls
            .get("loss_allocation")
            .map(|w| w.write_down_order.as_slice())
            .unwrap_or(&[]);

        let mut remaining = loss;
        for bond_id in order {
            if remaining <= Decimal::ZERO {
                break;
            }
            if let Some(bond) = state.bonds.get_mut(bond_id) {
                let write_down = bond.current_balance.min(remaining);
                bond.current_balance -= write_down;
                remaining -= write_down;
            }
        }

        let cumulative = state.ledger(CUMULATIVE_LOSS_LEDGER);
        state.set_ledger(CUMULATIVE_LOSS_LEDGER, cumulative + loss);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;
    use crate::loader::DealLoader;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn build_state(spec: serde_json::Value) -> DealState {
        let deal = DealLoader::new().load(spec.as_object().unwrap()).unwrap();
        DealState::new(Arc::new(deal))
    }

    fn sample_state() -> DealState {
        build_state(json!({
            "meta": {"deal_id": "WF_TEST"},
            "bonds": [
                {"id": "A", "original_balance": 1_000_000.0,
                 "coupon": {"kind": "FIXED", "fixed_rate": 0.05},
                 "priority": {"interest": 1, "principal": 1}},
                {"id": "B", "original_balance": 250_000.0,
                 "coupon": {"kind": "FIXED", "fixed_rate": 0.07},
                 "priority": {"interest": 2, "principal": 2}}
            ],
            "funds": [{"id": "IAF"}, {"id": "PAF"}, {"id": "RESERVE"}],
            "variables": {
                "SeniorInterestDue": "bonds.A.balance * 0.05 / 12"
            },
            "tests": [
                {"id": "DelinqTest",
                 "calc": {"value_rule": "DelinqRate"},
                 "threshold": {"rule": "0.05"},
                 "pass_if": "VALUE_LT_THRESHOLD",
                 "effects": [{"set_flag": "Turbo"}]}
            ],
            "collateral": {"original_balance": 1_250_000.0,
                           "current_balance": 1_250_000.0},
            "waterfalls": {
                "interest": {"steps": [
                    {"id": "INT_A", "action": "PAY_BOND_INTEREST", "from_fund": "IAF",
                     "group": "A", "amount_rule": "SeniorInterestDue",
                     "unpaid_ledger_id": "UnpaidSeniorInterest"},
                    {"id": "INT_SWEEP", "action": "TRANSFER_FUND", "from_fund": "IAF",
                     "to": "RESERVE", "amount_rule": "REMAINING"}
                ]},
                "principal": {"steps": [
                    {"id": "PRIN_A", "action": "PAY_BOND_PRINCIPAL", "from_fund": "PAF",
                     "group": "A", "amount_rule": "ALL"},
                    {"id": "PRIN_B", "action": "PAY_BOND_PRINCIPAL", "from_fund": "PAF",
                     "group": "B", "amount_rule": "REMAINING"}
                ]},
                "loss_allocation": {"write_down_order": ["B", "A"]}
            }
        }))
    }

    #[test]
    fn test_tests_run_before_variables_and_set_flags() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.08));
        let runner = WaterfallRunner::default();
        runner.evaluate_period(&mut state).unwrap();
        assert_eq!(state.flags["DelinqTest"], true);
        assert_eq!(state.flags["Turbo"], true);
        // Variables computed after tests
        assert_eq!(
            state.variables["SeniorInterestDue"],
            Value::Number(dec!(1_000_000) * dec!(0.05) / dec!(12))
        );
    }

    #[test]
    fn test_passing_test_leaves_flag_false() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.01));
        WaterfallRunner::default().evaluate_period(&mut state).unwrap();
        assert_eq!(state.flags["DelinqTest"], false);
        assert!(!state.flags.contains_key("Turbo"));
    }

    #[test]
    fn test_interest_step_pays_due_and_sweeps_remainder() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.0));
        state.deposit("IAF", dec!(10_000)).unwrap();
        WaterfallRunner::default().run_period(&mut state).unwrap();

        let due = dec!(1_000_000) * dec!(0.05) / dec!(12);
        assert_eq!(state.cash_balances["IAF"], Decimal::ZERO);
        assert_eq!(state.cash_balances["RESERVE"], dec!(10_000) - due);
        // Fully paid: no shortfall ledger entry
        assert_eq!(state.ledger("UnpaidSeniorInterest"), Decimal::ZERO);
    }

    #[test]
    fn test_shortfall_accumulates_in_ledger() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.0));
        state.deposit("IAF", dec!(1000)).unwrap();
        WaterfallRunner::default().run_period(&mut state).unwrap();

        let due = dec!(1_000_000) * dec!(0.05) / dec!(12);
        assert_eq!(state.ledger("UnpaidSeniorInterest"), due - dec!(1000));
        assert_eq!(state.cash_balances["IAF"], Decimal::ZERO);
    }

    #[test]
    fn test_sequential_principal_with_remaining() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.0));
        state.deposit("PAF", dec!(1_100_000)).unwrap();
        WaterfallRunner::default().run_period(&mut state).unwrap();

        assert_eq!(state.bonds["A"].current_balance, Decimal::ZERO);
        assert_eq!(state.bonds["B"].current_balance, dec!(150_000));
        assert_eq!(state.cash_balances["PAF"], Decimal::ZERO);
    }

    #[test]
    fn test_condition_gates_step() {
        let mut state = build_state(json!({
            "meta": {"deal_id": "COND_TEST"},
            "bonds": [
                {"id": "A", "original_balance": 1000.0,
                 "coupon": {"kind": "FIXED"},
                 "priority": {"interest": 1, "principal": 1}}
            ],
            "funds": [{"id": "PAF"}, {"id": "RESERVE"}],
            "tests": [
                {"id": "OC",
                 "calc": {"value_rule": "bonds.A.balance"},
                 "threshold": {"rule": "500"},
                 "pass_if": "VALUE_LT_THRESHOLD"}
            ],
            "collateral": {},
            "waterfalls": {
                "principal": {"steps": [
                    {"id": "TURBO", "action": "TRANSFER_FUND", "from_fund": "PAF",
                     "to": "RESERVE", "condition": "tests.OC.failed",
                     "amount_rule": "ALL"},
                    {"id": "PRIN_A", "action": "PAY_BOND_PRINCIPAL", "from_fund": "PAF",
                     "group": "A", "amount_rule": "REMAINING"}
                ]}
            }
        }));
        state.deposit("PAF", dec!(600)).unwrap();
        WaterfallRunner::default().run_period(&mut state).unwrap();
        // OC test failed (1000 >= 500): turbo step diverts everything
        assert_eq!(state.cash_balances["RESERVE"], dec!(600));
        assert_eq!(state.bonds["A"].current_balance, dec!(1000));
    }

    #[test]
    fn test_loss_allocation_order_and_cumulative_loss() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.0));
        state.set_variable("RealizedLoss", dec!(400_000));
        // Variables are recomputed by run_period, so inject the loss through
        // allocate_losses directly via a period with no deal variables for it
        let runner = WaterfallRunner::default();
        runner.run_period(&mut state).unwrap();

        // B absorbs its full 250k, A absorbs the remaining 150k
        assert_eq!(state.bonds["B"].current_balance, Decimal::ZERO);
        assert_eq!(state.bonds["A"].current_balance, dec!(850_000));
        assert_eq!(state.ledger(CUMULATIVE_LOSS_LEDGER), dec!(400_000));
    }

    #[test]
    fn test_loss_allocation_is_monotonic() {
        let mut state = sample_state();
        state.set_variable("DelinqRate", dec!(0.0));
        let runner = WaterfallRunner::default();

        state.set_variable("RealizedLoss", dec!(100_000));
        runner.run_period(&mut state).unwrap();
        assert_eq!(state.ledger(CUMULATIVE_LOSS_LEDGER), dec!(100_000));

        state.set_variable("RealizedLoss", dec!(50_000));
        runner.run_period(&mut state).unwrap();
        assert_eq!(state.ledger(CUMULATIVE_LOSS_LEDGER), dec!(150_000));
    }

    #[test]
    fn test_negative_target_pays_nothing() {
        let mut state = build_state(json!({
            "meta": {"deal_id": "NEG_TEST"},
            "bonds": [],
            "funds": [{"id": "IAF"}],
            "collateral": {},
            "waterfalls": {
                "interest": {"steps": [
                    {"id": "FEE", "action": "PAY_FEE", "from_fund": "IAF",
                     "amount_rule": "0 - 100"}
                ]}
            }
        }));
        state.deposit("IAF", dec!(500)).unwrap();
        WaterfallRunner::default().run_period(&mut state).unwrap();
        assert_eq!(state.cash_balances["IAF"], dec!(500));
    }

    #[test]
    fn test_evaluation_error_aborts_period() {
        let mut state = build_state(json!({
            "meta": {"deal_id": "ERR_TEST"},
            "bonds": [],
            "funds": [{"id": "IAF"}],
            "variables": {"Broken": "NoSuchName + 1"},
            "collateral": {},
            "waterfalls": {}
        }));
        let err = WaterfallRunner::default().run_period(&mut state).unwrap_err();
        assert!(err.is_evaluation());
    }
}
