//! Simulation driver.
//!
//! Orchestrates a full deal run: load and validate the deal, apply servicer
//! actuals period by period, align state to the latest actual, project the
//! remaining horizon with the rule-based collateral model (or an external
//! ML cashflow provider), execute the waterfall each period, reconcile
//! model balances against the tape, and flatten history into a report.
//!
//! The driver is purely CPU-bound: callers hand it fully materialized
//! inputs and may run many simulations in parallel, each with its own
//! [`DealState`]. Host cancellation is observed at period boundaries via
//! [`CancelToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use log::info;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::collateral::{CollateralModel, PeriodCashflow};
use crate::error::RmbsError;
use crate::expr::ExpressionEngine;
use crate::ingest::{json_decimal, normalize_collateral, prepare_performance, PoolPeriodRow};
use crate::loader::DealLoader;
use crate::report::ReportGenerator;
use crate::state::DealState;
use crate::types::{Money, Rate};
use crate::waterfall::WaterfallRunner;
use crate::RmbsResult;

/// Bond balances within this distance of the tape reconcile clean.
pub const RECONCILIATION_TOLERANCE: Decimal = dec!(1.0);

/// Default cleanup-call trigger: pool factor at or below 10%.
const CLEANUP_POOL_FACTOR: Decimal = dec!(0.10);

/// Coupon assumed for cleanup-call accrued interest when a bond has none.
const DEFAULT_CLEANUP_COUPON: Decimal = dec!(0.05);

/// Interest collections are deposited here.
const INTEREST_FUND: &str = "IAF";

/// Principal collections are deposited here.
const PRINCIPAL_FUND: &str = "PAF";

fn default_horizon() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

/// CPR/CDR/severity scenario assumptions for the projection phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScenarioAssumptions {
    pub cpr: Rate,
    pub cdr: Rate,
    pub severity: Rate,
}

/// Everything a simulation run needs, fully materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationInput {
    /// Deal spec tree (meta, bonds, funds, waterfalls, ...).
    pub deal: Map<String, Json>,
    /// Collateral payload; envelopes and loan-level payloads are normalized.
    #[serde(default)]
    pub collateral: Map<String, Json>,
    /// Raw servicer tape rows (actuals).
    #[serde(default)]
    pub performance_rows: Vec<Map<String, Json>>,
    #[serde(default)]
    pub assumptions: ScenarioAssumptions,
    /// Total periods to carry the deal to, actuals included.
    #[serde(default = "default_horizon")]
    pub horizon_periods: u32,
    /// When false, actual periods only evaluate tests and variables; cash
    /// is recorded but not routed, and bond balances come from the tape.
    #[serde(default = "default_true")]
    pub apply_waterfall_to_actuals: bool,
    /// Anchor for snapshot dates (`start + 30·period` days). Defaults to
    /// today; pin it for reproducible runs.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

/// Model-vs-tape reconciliation verdict for one bond and period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    #[serde(rename = "BALANCE_MISMATCH")]
    BalanceMismatch,
    #[serde(rename = "UNKNOWN_BOND")]
    UnknownBond,
    #[serde(rename = "MISSING_IN_TAPE")]
    MissingInTape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationEntry {
    pub period: i64,
    pub bond_id: String,
    pub model_balance: Option<Money>,
    pub tape_balance: Option<Money>,
    pub delta: Option<Money>,
    pub status: ReconciliationStatus,
}

/// Report plus reconciliation entries: the canonical run output.
#[derive(Debug, Serialize)]
pub struct SimulationOutput {
    pub report: crate::report::CashflowReport,
    pub reconciliation: Vec<ReconciliationEntry>,
}

// ---------------------------------------------------------------------------
// ML provider seam
// ---------------------------------------------------------------------------

/// Configuration forwarded to an external ML cashflow provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlModelConfig {
    pub rate_scenario: String,
    pub start_rate: Decimal,
    pub rate_sensitivity: Decimal,
    pub base_cpr: Rate,
    pub base_cdr: Rate,
    pub base_severity: Rate,
    pub feature_source: String,
    pub prepay_model_key: String,
    pub default_model_key: String,
}

impl MlModelConfig {
    fn from_json(ml_config: &Map<String, Json>, assumptions: &ScenarioAssumptions) -> Self {
        let text = |key: &str, default: &str| {
            ml_config
                .get(key)
                .and_then(Json::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let number = |key: &str, default: Decimal| {
            ml_config.get(key).and_then(json_decimal).unwrap_or(default)
        };
        MlModelConfig {
            rate_scenario: text("rate_scenario", "rally"),
            start_rate: number("start_rate", dec!(0.045)),
            rate_sensitivity: number("rate_sensitivity", Decimal::ONE),
            base_cpr: number("base_cpr", assumptions.cpr),
            base_cdr: number("base_cdr", assumptions.cdr),
            base_severity: number("base_severity", assumptions.severity),
            feature_source: text("feature_source", "simulated"),
            prepay_model_key: text("prepay_model_key", "prepay"),
            default_model_key: text("default_model_key", "default"),
        }
    }
}

/// One projection request to an external provider.
#[derive(Debug, Clone)]
pub struct MlCashflowRequest {
    pub origination_uri: String,
    pub performance_uri: Option<String>,
    /// Number of monthly periods to project (also the rate-path length).
    pub periods: u32,
    pub config: MlModelConfig,
}

/// Externally supplied loan-level cashflow model.
///
/// The core never trains or loads models itself; hosts inject an
/// implementation and the driver consults it when the collateral config
/// enables ML. An empty result is a failure.
pub trait MlCashflowProvider {
    fn generate_cashflows(
        &self,
        request: &MlCashflowRequest,
    ) -> Result<Vec<PeriodCashflow>, Box<dyn std::error::Error + Send + Sync>>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Host cancellation flag, observed before each actual and projected period.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run a full deal simulation and return the cashflow report plus the
/// model-vs-tape reconciliation.
pub fn run_simulation(
    input: &SimulationInput,
    ml_provider: Option<&dyn MlCashflowProvider>,
    cancel: Option<&CancelToken>,
) -> RmbsResult<SimulationOutput> {
    // Load and validate the deal with the normalized collateral attached
    let collateral = normalize_collateral(&input.collateral);
    let mut merged_deal = input.deal.clone();
    merged_deal.insert("collateral".to_string(), Json::Object(collateral.clone()));
    let definition = Arc::new(DealLoader::new().load(&merged_deal)?);

    let mut state = DealState::new(definition.clone());
    let engine = ExpressionEngine::new();
    let runner = WaterfallRunner::new(engine.clone());

    let tape = prepare_performance(&input.performance_rows);
    let start_date = input.start_date.unwrap_or_else(|| Utc::now().date_naive());
    let mut reconciliation: Vec<ReconciliationEntry> = Vec::new();

    // Apply actuals
    for row in &tape.pool_rows {
        check_cancelled(cancel, state.period_index)?;
        apply_actual_period(&mut state, row)?;

        if input.apply_waterfall_to_actuals {
            runner.run_period(&mut state)?;
        } else {
            runner.evaluate_period(&mut state)?;
        }

        if let Some(tape_balances) = tape.bond_balances_by_period.get(&row.period) {
            reconcile_period(&state, row.period, tape_balances, &mut reconciliation);
        }

        state.snapshot(start_date + Duration::days(30 * row.period));
    }

    // Align to the latest actual period
    if let Some(latest) = tape.latest_period() {
        let latest = latest.max(0) as u32;
        state.period_index = state.period_index.max(latest);
        if !input.apply_waterfall_to_actuals {
            if let Some(balances) = tape.bond_balances_by_period.get(&i64::from(latest)) {
                for (bond_id, balance) in balances {
                    if let Some(bond) = state.bonds.get_mut(bond_id) {
                        bond.current_balance = *balance;
                    }
                }
            }
        }
    }

    // Project the remaining horizon
    let remaining = input.horizon_periods.saturating_sub(state.period_index);
    if remaining > 0 {
        let original_balance = collateral
            .get("original_balance")
            .and_then(json_decimal)
            .unwrap_or(Decimal::ZERO);

        let (projected, ml_used) = generate_projection(
            &mut state,
            &collateral,
            &tape,
            &input.assumptions,
            remaining,
            original_balance,
            ml_provider,
        )?;

        let pre_projection_index = state.period_index;
        for row in &projected {
            let period = pre_projection_index + row.period;
            check_cancelled(cancel, period)?;
            apply_projected_period(&mut state, row, ml_used)?;

            let triggered = check_cleanup_call(&state, &engine);
            state.set_variable("CleanupCallTriggered", triggered);
            if triggered {
                info!("Cleanup call exercised at period {}", period);
                state.set_variable("CleanupCallExercised", true);
                execute_cleanup_call(&mut state);
                state.snapshot(start_date + Duration::days(30 * i64::from(period)));
                break;
            }

            runner.run_period(&mut state)?;
            state.snapshot(start_date + Duration::days(30 * i64::from(period)));
        }
    }

    let report = ReportGenerator::new(&state.history).generate();
    Ok(SimulationOutput {
        report,
        reconciliation,
    })
}

fn check_cancelled(cancel: Option<&CancelToken>, period: u32) -> RmbsResult<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(RmbsError::Cancelled(period)),
        _ => Ok(()),
    }
}

/// Deposit one actual period's collections and mirror its metrics into
/// deal variables.
fn apply_actual_period(state: &mut DealState, row: &PoolPeriodRow) -> RmbsResult<()> {
    state.deposit(INTEREST_FUND, row.interest_collected)?;
    state.deposit(PRINCIPAL_FUND, row.principal_collected)?;

    state.set_variable("RealizedLoss", row.realized_loss);
    state.set_variable("InputInterestCollected", row.interest_collected);
    state.set_variable("InputPrincipalCollected", row.principal_collected);
    state.set_variable("InputRealizedLoss", row.realized_loss);
    state.set_variable("InputPrepayment", row.prepayment);
    state.set_variable("InputScheduledPrincipal", row.scheduled_principal);
    state.set_variable("InputScheduledInterest", row.scheduled_interest);
    state.set_variable("InputServicerAdvances", row.servicer_advances);
    state.set_variable("InputRecoveries", row.recoveries);

    for (name, value) in [
        ("Delinq30", row.delinq30),
        ("Delinq60", row.delinq60),
        ("Delinq90Plus", row.delinq90_plus),
        ("Delinq60Plus", row.delinq60_plus),
    ] {
        if let Some(value) = value {
            state.set_variable(name, value);
        }
    }

    // Balance-weighted 60+ delinquency, computed against the pool balance
    // before this period's EndBalance overwrite
    if let Some(rate) = row.delinq60_plus {
        let current = state.collateral_number("current_balance");
        state.set_variable("Delinq60PlusBalance", rate * current);
    }

    if let Some(end_balance) = row.end_balance {
        state.set_collateral_number("current_balance", end_balance);
        state.set_variable("PoolEndBalance", end_balance);
        state.set_variable("InputEndBalance", end_balance);
    }

    if let Some(status) = &row.pool_status {
        state.set_variable("PoolStatus", status.clone());
    }

    state.set_variable("ModelSource", "Actuals");
    state.set_variable("MLUsed", false);
    Ok(())
}

fn reconcile_period(
    state: &DealState,
    period: i64,
    tape_balances: &std::collections::BTreeMap<String, Money>,
    out: &mut Vec<ReconciliationEntry>,
) {
    for (bond_id, tape_balance) in tape_balances {
        match state.bonds.get(bond_id) {
            Some(bond) => {
                let delta = bond.current_balance - tape_balance;
                if delta.abs() > RECONCILIATION_TOLERANCE {
                    out.push(ReconciliationEntry {
                        period,
                        bond_id: bond_id.clone(),
                        model_balance: Some(bond.current_balance),
                        tape_balance: Some(*tape_balance),
                        delta: Some(delta),
                        status: ReconciliationStatus::BalanceMismatch,
                    });
                }
            }
            None => out.push(ReconciliationEntry {
                period,
                bond_id: bond_id.clone(),
                model_balance: None,
                tape_balance: Some(*tape_balance),
                delta: None,
                status: ReconciliationStatus::UnknownBond,
            }),
        }
    }

    for (bond_id, bond) in &state.bonds {
        if !tape_balances.contains_key(bond_id) {
            out.push(ReconciliationEntry {
                period,
                bond_id: bond_id.clone(),
                model_balance: Some(bond.current_balance),
                tape_balance: None,
                delta: None,
                status: ReconciliationStatus::MissingInTape,
            });
        }
    }
}

/// Produce the projection rows, via the ML provider when the collateral
/// config enables it, otherwise the rule-based collateral model.
fn generate_projection(
    state: &mut DealState,
    collateral: &Map<String, Json>,
    tape: &crate::ingest::PreparedTape,
    assumptions: &ScenarioAssumptions,
    remaining: u32,
    original_balance: Money,
    ml_provider: Option<&dyn MlCashflowProvider>,
) -> RmbsResult<(Vec<PeriodCashflow>, bool)> {
    let ml_config = collateral
        .get("ml_config")
        .and_then(Json::as_object)
        .cloned()
        .unwrap_or_default();
    let ml_kind = collateral
        .get("model_interface")
        .and_then(|m| m.get("kind"))
        .and_then(Json::as_str)
        .unwrap_or_default();
    let ml_enabled = ml_config
        .get("enabled")
        .and_then(Json::as_bool)
        .unwrap_or(false)
        || matches!(ml_kind, "FREDDIE_MAC_ML" | "ML_PORTFOLIO");

    let loan_data = collateral
        .get("loan_data")
        .and_then(Json::as_object)
        .cloned()
        .unwrap_or_default();
    let source_uri = loan_data
        .get("schema_ref")
        .and_then(|s| s.get("source_uri"))
        .and_then(Json::as_str)
        .or_else(|| ml_config.get("origination_source_uri").and_then(Json::as_str))
        .map(str::to_string);
    let performance_uri = loan_data
        .get("performance_uri")
        .and_then(Json::as_str)
        .map(str::to_string);

    if ml_enabled {
        let source_uri = source_uri.ok_or_else(|| RmbsError::InvalidInput {
            field: "collateral.loan_data.schema_ref.source_uri".into(),
            reason: "ML models enabled but no origination source URI provided.".into(),
        })?;
        let provider = ml_provider
            .ok_or_else(|| RmbsError::External("no ML cashflow provider configured".into()))?;

        let config = MlModelConfig::from_json(&ml_config, assumptions);
        state.set_variable("MLSourceURI", source_uri.clone());
        state.set_variable("MLFeatureSource", config.feature_source.clone());
        state.set_variable("MLRateScenario", config.rate_scenario.clone());
        state.set_variable("MLStartRate", config.start_rate);
        state.set_variable("MLRateSensitivity", config.rate_sensitivity);
        state.set_variable("MLBaseCPR", config.base_cpr);
        state.set_variable("MLBaseCDR", config.base_cdr);
        state.set_variable("MLBaseSeverity", config.base_severity);

        let request = MlCashflowRequest {
            origination_uri: source_uri,
            performance_uri,
            periods: remaining,
            config,
        };
        let rows = provider
            .generate_cashflows(&request)
            .map_err(|e| RmbsError::External(e.to_string()))?;
        if rows.is_empty() {
            return Err(RmbsError::External(
                "ML cashflow generation returned no rows".into(),
            ));
        }
        return Ok((rows, true));
    }

    let wac = collateral
        .get("wac")
        .and_then(json_decimal)
        .unwrap_or(dec!(0.06));
    let wam = collateral
        .get("wam")
        .and_then(json_decimal)
        .and_then(|w| w.round_dp(0).to_u32())
        .unwrap_or(360);

    let mut start_balance = tape
        .latest_end_balance()
        .unwrap_or_else(|| state.collateral_number("current_balance"));
    if start_balance.is_zero() && !tape.pool_rows.is_empty() {
        start_balance =
            (original_balance - tape.total_principal_collected()).max(Decimal::ZERO);
    }

    let model = CollateralModel::new(original_balance, wac, wam);
    let rows = model.generate_cashflows(
        remaining,
        assumptions.cpr,
        assumptions.cdr,
        assumptions.severity,
        Some(start_balance),
    )?;
    Ok((rows, false))
}

fn apply_projected_period(
    state: &mut DealState,
    row: &PeriodCashflow,
    ml_used: bool,
) -> RmbsResult<()> {
    state.deposit(INTEREST_FUND, row.interest_collected)?;
    state.deposit(PRINCIPAL_FUND, row.principal_collected)?;

    state.set_variable("RealizedLoss", row.realized_loss);
    state.set_variable("InputInterestCollected", row.interest_collected);
    state.set_variable("InputPrincipalCollected", row.principal_collected);
    state.set_variable("InputRealizedLoss", row.realized_loss);
    state.set_variable("InputEndBalance", row.end_balance);
    state.set_variable("InputPrepayment", row.prepayment);
    state.set_variable("InputScheduledPrincipal", row.scheduled_principal);
    state.set_variable("InputScheduledInterest", row.scheduled_interest);
    state.set_variable("InputServicerAdvances", row.servicer_advances);
    state.set_variable("InputRecoveries", row.recoveries);
    state.set_variable("ModelSource", if ml_used { "ML" } else { "RuleBased" });
    state.set_variable("MLUsed", ml_used);

    // Keep the pool balance current so factor-based rules (and the default
    // cleanup-call check) see the projected paydown
    state.set_collateral_number("current_balance", row.end_balance.max(Decimal::ZERO));
    state.set_variable("PoolEndBalance", row.end_balance);

    // Delinquency triggers are driven by actuals; projected periods reset
    // the trigger rule rather than mutating the frozen definition
    if state.def_.variable_rule("DelinqTrigger").is_some() {
        state
            .rule_overrides
            .insert("DelinqTrigger".to_string(), "false".to_string());
    }
    Ok(())
}

/// Cleanup-call breach check: the deal's threshold rule when present (an
/// evaluation failure falls back), else the default 10% pool-factor test.
fn check_cleanup_call(state: &DealState, engine: &ExpressionEngine) -> bool {
    let cleanup = match &state.def_.options.cleanup_call {
        Some(c) if c.enabled => c,
        _ => return false,
    };

    if let Some(rule) = &cleanup.threshold_rule {
        if let Ok(breached) = engine.evaluate_condition(rule, state) {
            return breached;
        }
    }

    let original = state.collateral_number("original_balance");
    let current = state.collateral_number("current_balance");
    if original > Decimal::ZERO {
        current / original <= CLEANUP_POOL_FACTOR
    } else {
        false
    }
}

/// Pay off every bond at par plus one month of coupon, clear the cash
/// buckets and collateral, and mark the deal terminated.
fn execute_cleanup_call(state: &mut DealState) {
    let mut cleanup_amount = Decimal::ZERO;
    let definition = state.def_.clone();

    for (bond_id, bond_state) in state.bonds.iter_mut() {
        if bond_state.current_balance <= Decimal::ZERO {
            continue;
        }
        let principal_payoff = bond_state.current_balance;
        let coupon = definition
            .get_bond(bond_id)
            .and_then(|b| b.fixed_rate)
            .unwrap_or(DEFAULT_CLEANUP_COUPON);
        let accrued_interest = principal_payoff * coupon / Decimal::from(12);
        cleanup_amount += principal_payoff + accrued_interest;

        bond_state.current_balance = Decimal::ZERO;
        bond_state.interest_shortfall = Decimal::ZERO;
    }

    state.set_variable("CleanupCallAmount", cleanup_amount);
    state.set_variable("DealTerminated", true);

    // Remaining cash goes to the residual holder
    for balance in state.cash_balances.values_mut() {
        *balance = Decimal::ZERO;
    }
    state.set_collateral_number("current_balance", Decimal::ZERO);
}
