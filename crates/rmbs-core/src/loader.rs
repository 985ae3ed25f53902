//! Deal definition loader and validator.
//!
//! Parses a deal spec (a JSON tree) in three phases:
//!
//! 1. Syntactic validation — structural schema check, when one is configured.
//! 2. Hydration — raw JSON into typed, immutable domain objects.
//! 3. Semantic validation — cross-reference integrity (bonds, funds,
//!    waterfalls, write-down order). All semantic errors are accumulated and
//!    reported together.
//!
//! The output is an immutable [`DealDefinition`] that can be shared across
//! concurrent simulations.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use serde_json::{Map, Value as Json};

use crate::error::RmbsError;
use crate::ingest::{json_decimal, json_i64};
use crate::types::{Money, Rate};
use crate::RmbsResult;

// ---------------------------------------------------------------------------
// Domain objects
// ---------------------------------------------------------------------------

/// Coupon types supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponType {
    Fixed,
    Float,
    Wac,
    Variable,
}

impl CouponType {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "FIXED" => Some(CouponType::Fixed),
            "FLOAT" => Some(CouponType::Float),
            "WAC" => Some(CouponType::Wac),
            "VARIABLE" => Some(CouponType::Variable),
            _ => None,
        }
    }
}

/// Waterfall step actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    PayBondInterest,
    PayBondPrincipal,
    TransferFund,
    PayFee,
}

impl StepAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "PAY_BOND_INTEREST" => Some(StepAction::PayBondInterest),
            "PAY_BOND_PRINCIPAL" => Some(StepAction::PayBondPrincipal),
            "TRANSFER_FUND" => Some(StepAction::TransferFund),
            "PAY_FEE" => Some(StepAction::PayFee),
            _ => None,
        }
    }
}

/// Comparison operator applied between a test's value and threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassIf {
    ValueLtThreshold,
    ValueLeqThreshold,
    ValueGtThreshold,
    ValueGeqThreshold,
}

impl PassIf {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "VALUE_LT_THRESHOLD" => Some(PassIf::ValueLtThreshold),
            "VALUE_LEQ_THRESHOLD" => Some(PassIf::ValueLeqThreshold),
            "VALUE_GT_THRESHOLD" => Some(PassIf::ValueGtThreshold),
            "VALUE_GEQ_THRESHOLD" => Some(PassIf::ValueGeqThreshold),
            _ => None,
        }
    }
}

/// Immutable bond (tranche) definition.
#[derive(Debug, Clone)]
pub struct Bond {
    pub id: String,
    /// Bond type label (e.g. "NOTE", "IO", "PO").
    pub bond_type: String,
    pub original_balance: Money,
    pub coupon_type: CouponType,
    /// Payment priority for interest (lower = more senior).
    pub priority_interest: i64,
    /// Payment priority for principal (lower = more senior).
    pub priority_principal: i64,
    /// Additional interest calculation rules, passed through verbatim.
    pub interest_rules: Map<String, Json>,
    pub fixed_rate: Option<Rate>,
    /// Name of the deal variable capping a VARIABLE coupon.
    pub variable_cap_ref: Option<String>,
}

/// Cash fund definition (e.g. IAF, PAF).
#[derive(Debug, Clone)]
pub struct Fund {
    pub id: String,
    pub description: String,
}

/// Reserve or control account definition.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub account_type: String,
}

/// A single step in an interest or principal waterfall.
#[derive(Debug, Clone)]
pub struct WaterfallStep {
    pub id: String,
    pub action: StepAction,
    pub from_fund: String,
    pub to: Option<String>,
    /// Bond id for PAY_BOND_* actions.
    pub group: Option<String>,
    /// Gating condition; absent means always run.
    pub condition: Option<String>,
    /// Expression, or the literals "ALL" / "REMAINING".
    pub amount_rule: String,
    /// Ledger accumulating unpaid amounts when the step comes up short.
    pub unpaid_ledger_id: Option<String>,
}

/// A named waterfall: ordered steps, plus the write-down order used by
/// loss allocation.
#[derive(Debug, Clone, Default)]
pub struct WaterfallSpec {
    pub steps: Vec<WaterfallStep>,
    pub write_down_order: Vec<String>,
}

/// Flag set when a failed test fires.
#[derive(Debug, Clone)]
pub struct TestEffect {
    pub set_flag: String,
}

/// Trigger test definition.
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub id: String,
    pub value_rule: String,
    pub threshold_rule: String,
    pub pass_if: PassIf,
    pub effects: Vec<TestEffect>,
}

/// Optional cleanup-call terms.
#[derive(Debug, Clone, Default)]
pub struct CleanupCall {
    pub enabled: bool,
    pub threshold_rule: Option<String>,
}

/// Deal-level options.
#[derive(Debug, Clone, Default)]
pub struct DealOptions {
    pub cleanup_call: Option<CleanupCall>,
}

/// Validated, immutable deal definition used by the simulation engine.
///
/// Funds and accounts share one cash-bucket namespace at runtime; the
/// loader rejects duplicate ids across the two.
#[derive(Debug, Clone)]
pub struct DealDefinition {
    pub meta: Map<String, Json>,
    pub dates: Map<String, Json>,
    pub bonds: BTreeMap<String, Bond>,
    pub funds: BTreeMap<String, Fund>,
    pub accounts: BTreeMap<String, Account>,
    /// Variable name → rule expression, in declaration order.
    pub variables: Vec<(String, String)>,
    pub tests: Vec<TestSpec>,
    pub collateral: Map<String, Json>,
    pub waterfalls: BTreeMap<String, WaterfallSpec>,
    pub options: DealOptions,
}

impl DealDefinition {
    pub fn get_bond(&self, bond_id: &str) -> Option<&Bond> {
        self.bonds.get(bond_id)
    }

    pub fn deal_id(&self) -> Option<&str> {
        self.meta.get("deal_id").and_then(Json::as_str)
    }

    pub fn variable_rule(&self, name: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rule)| rule.as_str())
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a deal JSON structure, validate it, and hydrate domain objects.
#[derive(Debug, Default)]
pub struct DealLoader {
    schema: Option<Json>,
}

impl DealLoader {
    pub fn new() -> Self {
        DealLoader { schema: None }
    }

    /// Configure a structural schema (an object with `required` and
    /// `properties.<key>.type` entries) checked before hydration.
    pub fn with_schema(schema: Json) -> Self {
        DealLoader {
            schema: Some(schema),
        }
    }

    /// Parse and validate a deal spec into a [`DealDefinition`].
    pub fn load(&self, spec: &Map<String, Json>) -> RmbsResult<DealDefinition> {
        let deal_id = spec
            .get("meta")
            .and_then(|m| m.get("deal_id"))
            .and_then(Json::as_str)
            .unwrap_or("Unknown");
        info!("Loading deal: {}", deal_id);

        self.validate_syntax(spec)?;
        let deal = hydrate(spec)?;
        validate_semantics(&deal)?;

        info!("Deal loaded and validated successfully.");
        Ok(deal)
    }

    fn validate_syntax(&self, spec: &Map<String, Json>) -> RmbsResult<()> {
        let schema = match &self.schema {
            Some(s) => s,
            None => {
                warn!("No schema configured. Skipping syntactic validation.");
                return Ok(());
            }
        };

        if let Some(required) = schema.get("required").and_then(Json::as_array) {
            for key in required.iter().filter_map(Json::as_str) {
                if !spec.contains_key(key) {
                    return Err(RmbsError::SchemaViolation {
                        path: key.to_string(),
                        message: format!("required property '{}' is missing", key),
                    });
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(Json::as_object) {
            for (key, prop) in props {
                let expected = match prop.get("type").and_then(Json::as_str) {
                    Some(t) => t,
                    None => continue,
                };
                let actual = match spec.get(key) {
                    Some(v) => v,
                    None => continue,
                };
                if !json_type_matches(actual, expected) {
                    return Err(RmbsError::SchemaViolation {
                        path: key.to_string(),
                        message: format!(
                            "expected {}, found {}",
                            expected,
                            json_type_name(actual)
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

fn json_type_matches(value: &Json, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        _ => true,
    }
}

fn json_type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Hydration
// ---------------------------------------------------------------------------

fn schema_err(path: impl Into<String>, message: impl Into<String>) -> RmbsError {
    RmbsError::SchemaViolation {
        path: path.into(),
        message: message.into(),
    }
}

fn require_object<'a>(
    spec: &'a Map<String, Json>,
    key: &str,
) -> RmbsResult<&'a Map<String, Json>> {
    spec.get(key)
        .ok_or_else(|| schema_err(key, format!("Missing required field: {}", key)))?
        .as_object()
        .ok_or_else(|| schema_err(key, "expected an object"))
}

fn optional_object(spec: &Map<String, Json>, key: &str) -> Map<String, Json> {
    spec.get(key)
        .and_then(Json::as_object)
        .cloned()
        .unwrap_or_default()
}

fn optional_array<'a>(spec: &'a Map<String, Json>, key: &str) -> &'a [Json] {
    spec.get(key)
        .and_then(Json::as_array)
        .map_or(&[][..], Vec::as_slice)
}

fn string_field(obj: &Map<String, Json>, key: &str, path: &str) -> RmbsResult<String> {
    obj.get(key)
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| schema_err(path, format!("Missing required field: {}", key)))
}

fn int_field(obj: &Map<String, Json>, key: &str, path: &str) -> RmbsResult<i64> {
    obj.get(key)
        .and_then(json_i64)
        .ok_or_else(|| schema_err(path, format!("Missing required field: {}", key)))
}

fn hydrate(spec: &Map<String, Json>) -> RmbsResult<DealDefinition> {
    let meta = require_object(spec, "meta")?.clone();
    let dates = optional_object(spec, "dates");
    let collateral = optional_object(spec, "collateral");

    // Funds
    let mut funds = BTreeMap::new();
    for (i, f) in optional_array(spec, "funds").iter().enumerate() {
        let path = format!("funds[{}]", i);
        let obj = f
            .as_object()
            .ok_or_else(|| schema_err(&path, "expected an object"))?;
        let id = string_field(obj, "id", &path)?;
        let description = obj
            .get("description")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        funds.insert(id.clone(), Fund { id, description });
    }

    // Accounts
    let mut accounts = BTreeMap::new();
    for (i, a) in optional_array(spec, "accounts").iter().enumerate() {
        let path = format!("accounts[{}]", i);
        let obj = a
            .as_object()
            .ok_or_else(|| schema_err(&path, "expected an object"))?;
        let id = string_field(obj, "id", &path)?;
        let account_type = string_field(obj, "type", &path)?;
        accounts.insert(id.clone(), Account { id, account_type });
    }

    // Bonds
    let mut bonds = BTreeMap::new();
    for (i, b) in optional_array(spec, "bonds").iter().enumerate() {
        let path = format!("bonds[{}]", i);
        let obj = b
            .as_object()
            .ok_or_else(|| schema_err(&path, "expected an object"))?;
        let id = string_field(obj, "id", &path)?;
        let original_balance = obj
            .get("original_balance")
            .and_then(json_decimal)
            .ok_or_else(|| schema_err(&path, "Missing required field: original_balance"))?;

        let coupon = obj
            .get("coupon")
            .and_then(Json::as_object)
            .ok_or_else(|| schema_err(&path, "Missing required field: coupon"))?;
        let kind = coupon
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| schema_err(&path, "Missing required field: coupon.kind"))?;
        let coupon_type = CouponType::parse(kind)
            .ok_or_else(|| schema_err(&path, format!("Unknown coupon kind: {}", kind)))?;

        let priority = obj
            .get("priority")
            .and_then(Json::as_object)
            .ok_or_else(|| schema_err(&path, "Missing required field: priority"))?;
        let priority_interest = int_field(priority, "interest", &path)?;
        let priority_principal = int_field(priority, "principal", &path)?;

        let bond = Bond {
            id: id.clone(),
            bond_type: obj
                .get("type")
                .and_then(Json::as_str)
                .unwrap_or("NOTE")
                .to_string(),
            original_balance,
            coupon_type,
            priority_interest,
            priority_principal,
            interest_rules: obj
                .get("interest_rules")
                .and_then(Json::as_object)
                .cloned()
                .unwrap_or_default(),
            fixed_rate: coupon.get("fixed_rate").and_then(json_decimal),
            variable_cap_ref: coupon
                .get("variable_cap")
                .and_then(Json::as_str)
                .map(str::to_string),
        };
        bonds.insert(id, bond);
    }

    // Variables — declaration order is preserved and is the evaluation order.
    let mut variables = Vec::new();
    for (name, rule) in &optional_object(spec, "variables") {
        let rule_str = match rule {
            Json::String(s) => s.clone(),
            Json::Number(n) => n.to_string(),
            Json::Bool(b) => b.to_string(),
            other => {
                return Err(schema_err(
                    format!("variables.{}", name),
                    format!("expected an expression string, found {}", json_type_name(other)),
                ))
            }
        };
        variables.push((name.clone(), rule_str));
    }

    // Tests
    let mut tests = Vec::new();
    for (i, t) in optional_array(spec, "tests").iter().enumerate() {
        let path = format!("tests[{}]", i);
        let obj = t
            .as_object()
            .ok_or_else(|| schema_err(&path, "expected an object"))?;
        let id = string_field(obj, "id", &path)?;
        let value_rule = obj
            .get("calc")
            .and_then(|c| c.get("value_rule"))
            .and_then(Json::as_str)
            .unwrap_or("0")
            .to_string();
        let threshold_rule = obj
            .get("threshold")
            .and_then(|c| c.get("rule"))
            .and_then(Json::as_str)
            .unwrap_or("0")
            .to_string();
        let pass_if_str = obj
            .get("pass_if")
            .and_then(Json::as_str)
            .unwrap_or("VALUE_LT_THRESHOLD");
        let pass_if = PassIf::parse(pass_if_str)
            .ok_or_else(|| schema_err(&path, format!("Unknown pass_if operator: {}", pass_if_str)))?;
        let mut effects = Vec::new();
        for e in obj
            .get("effects")
            .and_then(Json::as_array)
            .map_or(&[][..], Vec::as_slice)
        {
            if let Some(flag) = e.get("set_flag").and_then(Json::as_str) {
                effects.push(TestEffect {
                    set_flag: flag.to_string(),
                });
            }
        }
        tests.push(TestSpec {
            id,
            value_rule,
            threshold_rule,
            pass_if,
            effects,
        });
    }

    // Waterfalls
    let raw_waterfalls = require_object(spec, "waterfalls")?;
    let mut waterfalls = BTreeMap::new();
    for (name, wf) in raw_waterfalls {
        let obj = wf
            .as_object()
            .ok_or_else(|| schema_err(format!("waterfalls.{}", name), "expected an object"))?;
        let mut steps = Vec::new();
        let raw_steps = obj
            .get("steps")
            .and_then(Json::as_array)
            .map_or(&[][..], Vec::as_slice);
        for (i, s) in raw_steps.iter().enumerate() {
            let path = format!("waterfalls.{}.steps[{}]", name, i);
            let step_obj = s
                .as_object()
                .ok_or_else(|| schema_err(&path, "expected an object"))?;
            let action_str = step_obj
                .get("action")
                .and_then(Json::as_str)
                .ok_or_else(|| schema_err(&path, "Missing required field: action"))?;
            let action = StepAction::parse(action_str)
                .ok_or_else(|| schema_err(&path, format!("Unknown step action: {}", action_str)))?;
            steps.push(WaterfallStep {
                id: step_obj
                    .get("id")
                    .and_then(Json::as_str)
                    .unwrap_or_default()
                    .to_string(),
                action,
                from_fund: string_field(step_obj, "from_fund", &path)?,
                to: step_obj.get("to").and_then(Json::as_str).map(str::to_string),
                group: step_obj
                    .get("group")
                    .and_then(Json::as_str)
                    .map(str::to_string),
                condition: step_obj
                    .get("condition")
                    .and_then(Json::as_str)
                    .map(str::to_string),
                amount_rule: step_obj
                    .get("amount_rule")
                    .and_then(Json::as_str)
                    .unwrap_or("0")
                    .to_string(),
                unpaid_ledger_id: step_obj
                    .get("unpaid_ledger_id")
                    .and_then(Json::as_str)
                    .map(str::to_string),
            });
        }
        let write_down_order = obj
            .get("write_down_order")
            .and_then(Json::as_array)
            .map_or(Vec::new(), |a| {
                a.iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect()
            });
        waterfalls.insert(
            name.clone(),
            WaterfallSpec {
                steps,
                write_down_order,
            },
        );
    }

    // Options
    let options_obj = optional_object(spec, "options");
    let cleanup_call = options_obj
        .get("cleanup_call")
        .and_then(Json::as_object)
        .map(|c| CleanupCall {
            enabled: c.get("enabled").and_then(Json::as_bool).unwrap_or(false),
            threshold_rule: c
                .get("threshold_rule")
                .and_then(Json::as_str)
                .map(str::to_string),
        });

    Ok(DealDefinition {
        meta,
        dates,
        bonds,
        funds,
        accounts,
        variables,
        tests,
        collateral,
        waterfalls,
        options: DealOptions { cleanup_call },
    })
}

// ---------------------------------------------------------------------------
// Semantic validation
// ---------------------------------------------------------------------------

fn validate_semantics(deal: &DealDefinition) -> RmbsResult<()> {
    let mut errors: Vec<String> = Vec::new();

    let valid_funds: BTreeSet<&str> = deal.funds.keys().map(String::as_str).collect();
    let valid_accounts: BTreeSet<&str> = deal.accounts.keys().map(String::as_str).collect();
    let valid_variables: BTreeSet<&str> =
        deal.variables.iter().map(|(n, _)| n.as_str()).collect();
    let valid_sources: BTreeSet<&str> = valid_funds.union(&valid_accounts).copied().collect();

    // Funds and accounts share one cash-bucket namespace.
    for id in valid_funds.intersection(&valid_accounts) {
        errors.push(format!(
            "Bucket id '{}' is defined as both a fund and an account.",
            id
        ));
    }

    for bond in deal.bonds.values() {
        if let Some(cap) = &bond.variable_cap_ref {
            if !valid_variables.contains(cap.as_str()) {
                errors.push(format!(
                    "Bond '{}' references undefined variable cap '{}'",
                    bond.id, cap
                ));
            }
        }
    }

    for (wf_name, wf) in &deal.waterfalls {
        for (idx, step) in wf.steps.iter().enumerate() {
            let step_ref = format!("{}.Step[{}] (ID: {})", wf_name, idx + 1, step.id);

            if !valid_sources.contains(step.from_fund.as_str()) {
                errors.push(format!(
                    "{}: Source '{}' is not a valid Fund or Account.",
                    step_ref, step.from_fund
                ));
            }

            if step.action == StepAction::TransferFund {
                match &step.to {
                    Some(to) if !valid_sources.contains(to.as_str()) => {
                        errors.push(format!(
                            "{}: Transfer target '{}' is not a valid Fund or Account.",
                            step_ref, to
                        ));
                    }
                    None => {
                        errors.push(format!("{}: Transfer step has no target.", step_ref));
                    }
                    _ => {}
                }
            }
        }

        for bond_id in &wf.write_down_order {
            if !deal.bonds.contains_key(bond_id) {
                errors.push(format!(
                    "{}.write_down_order references unknown bond '{}'",
                    wf_name, bond_id
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        log::error!("Semantic validation failed:\n{}", errors.join("\n"));
        Err(RmbsError::LogicIntegrity(errors.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn sample_spec() -> Map<String, Json> {
        json!({
            "meta": {"deal_id": "DEMO_2025"},
            "dates": {"cutoff": "2025-01-01", "frequency": "MONTHLY"},
            "bonds": [
                {
                    "id": "A",
                    "type": "NOTE",
                    "original_balance": 1_000_000.0,
                    "coupon": {"kind": "FIXED", "fixed_rate": 0.05},
                    "priority": {"interest": 1, "principal": 1}
                },
                {
                    "id": "B",
                    "type": "NOTE",
                    "original_balance": 250_000.0,
                    "coupon": {"kind": "FIXED", "fixed_rate": 0.07},
                    "priority": {"interest": 2, "principal": 2}
                }
            ],
            "funds": [
                {"id": "IAF", "description": "Interest Available Fund"},
                {"id": "PAF", "description": "Principal Available Fund"}
            ],
            "accounts": [
                {"id": "RES", "type": "RESERVE"}
            ],
            "variables": {
                "SeniorInterestDue": "bonds.A.balance * 0.05 / 12"
            },
            "tests": [
                {
                    "id": "OCTest",
                    "calc": {"value_rule": "bonds.A.balance"},
                    "threshold": {"rule": "collateral.current_balance"},
                    "pass_if": "VALUE_LT_THRESHOLD",
                    "effects": [{"set_flag": "OCBreached"}]
                }
            ],
            "collateral": {
                "original_balance": 1_250_000.0,
                "current_balance": 1_250_000.0,
                "wac": 0.06,
                "wam": 360
            },
            "waterfalls": {
                "interest": {"steps": [
                    {"id": "INT_A", "action": "PAY_BOND_INTEREST",
                     "from_fund": "IAF", "group": "A", "amount_rule": "ALL"}
                ]},
                "principal": {"steps": [
                    {"id": "PRIN_A", "action": "PAY_BOND_PRINCIPAL",
                     "from_fund": "PAF", "group": "A", "amount_rule": "ALL"},
                    {"id": "PRIN_B", "action": "PAY_BOND_PRINCIPAL",
                     "from_fund": "PAF", "group": "B", "amount_rule": "REMAINING"}
                ]},
                "loss_allocation": {"write_down_order": ["B", "A"]}
            }
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_load_sample_spec() {
        let deal = DealLoader::new().load(&sample_spec()).unwrap();
        assert_eq!(deal.deal_id(), Some("DEMO_2025"));
        assert_eq!(deal.bonds.len(), 2);
        assert_eq!(deal.funds.len(), 2);
        assert_eq!(deal.accounts.len(), 1);
        let a = deal.get_bond("A").unwrap();
        assert_eq!(a.original_balance, dec!(1_000_000));
        assert_eq!(a.coupon_type, CouponType::Fixed);
        assert_eq!(a.fixed_rate, Some(dec!(0.05)));
        assert_eq!(
            deal.waterfalls["loss_allocation"].write_down_order,
            vec!["B".to_string(), "A".to_string()]
        );
    }

    #[test]
    fn test_load_is_idempotent() {
        let spec = sample_spec();
        let first = DealLoader::new().load(&spec).unwrap();
        let second = DealLoader::new().load(&spec).unwrap();
        assert_eq!(
            first.bonds.keys().collect::<Vec<_>>(),
            second.bonds.keys().collect::<Vec<_>>()
        );
        assert_eq!(first.variables, second.variables);
        assert_eq!(first.waterfalls.len(), second.waterfalls.len());
    }

    #[test]
    fn test_missing_meta_fails() {
        let mut spec = sample_spec();
        spec.remove("meta");
        let err = DealLoader::new().load(&spec).unwrap_err();
        assert!(matches!(err, RmbsError::SchemaViolation { .. }));
    }

    #[test]
    fn test_missing_waterfalls_fails() {
        let mut spec = sample_spec();
        spec.remove("waterfalls");
        assert!(DealLoader::new().load(&spec).is_err());
    }

    #[test]
    fn test_unknown_coupon_kind_fails() {
        let mut spec = sample_spec();
        spec["bonds"][0]["coupon"]["kind"] = json!("STEP_UP");
        let err = DealLoader::new().load(&spec).unwrap_err();
        match err {
            RmbsError::SchemaViolation { message, .. } => {
                assert!(message.contains("Unknown coupon kind: STEP_UP"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_bond_balance_fails() {
        let mut spec = sample_spec();
        spec["bonds"][1].as_object_mut().unwrap().remove("original_balance");
        assert!(DealLoader::new().load(&spec).is_err());
    }

    #[test]
    fn test_semantic_errors_are_accumulated() {
        let mut spec = sample_spec();
        spec["waterfalls"]["interest"]["steps"][0]["from_fund"] = json!("NOPE");
        spec["waterfalls"]["loss_allocation"]["write_down_order"] = json!(["B", "Z"]);
        let err = DealLoader::new().load(&spec).unwrap_err();
        match err {
            RmbsError::LogicIntegrity(msg) => {
                assert!(msg.contains("'NOPE' is not a valid Fund or Account"));
                assert!(msg.contains("unknown bond 'Z'"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable_cap_fails() {
        let mut spec = sample_spec();
        spec["bonds"][0]["coupon"] =
            json!({"kind": "VARIABLE", "variable_cap": "MissingCap"});
        let err = DealLoader::new().load(&spec).unwrap_err();
        match err {
            RmbsError::LogicIntegrity(msg) => {
                assert!(msg.contains("undefined variable cap 'MissingCap'"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_bucket_id_fails() {
        let mut spec = sample_spec();
        spec["accounts"] = json!([{"id": "IAF", "type": "RESERVE"}]);
        let err = DealLoader::new().load(&spec).unwrap_err();
        match err {
            RmbsError::LogicIntegrity(msg) => {
                assert!(msg.contains("both a fund and an account"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_transfer_without_target_fails() {
        let mut spec = sample_spec();
        spec["waterfalls"]["interest"]["steps"] = json!([
            {"id": "X", "action": "TRANSFER_FUND", "from_fund": "IAF", "amount_rule": "ALL"}
        ]);
        assert!(DealLoader::new().load(&spec).is_err());
    }

    #[test]
    fn test_schema_required_key_enforced() {
        let schema = json!({"required": ["meta", "waterfalls", "bonds"]});
        let mut spec = sample_spec();
        spec.remove("bonds");
        let err = DealLoader::with_schema(schema).load(&spec).unwrap_err();
        match err {
            RmbsError::SchemaViolation { path, .. } => assert_eq!(path, "bonds"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_schema_type_mismatch() {
        let schema = json!({"properties": {"bonds": {"type": "array"}}});
        let mut spec = sample_spec();
        spec["bonds"] = json!({"id": "A"});
        assert!(DealLoader::with_schema(schema).load(&spec).is_err());
    }
}
