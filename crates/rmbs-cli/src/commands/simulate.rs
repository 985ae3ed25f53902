use chrono::NaiveDate;
use clap::Args;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use rmbs_core::simulation::{run_simulation, ScenarioAssumptions, SimulationInput};

use crate::input;

#[derive(Args)]
pub struct SimulateArgs {
    /// Deal spec JSON file (stdin when piped and omitted)
    #[arg(long)]
    pub deal: Option<String>,

    /// Collateral payload JSON file
    #[arg(long)]
    pub collateral: Option<String>,

    /// Servicer performance tape CSV file
    #[arg(long)]
    pub tape: Option<String>,

    /// Annualized constant prepayment rate (0.10 = 10% CPR)
    #[arg(long, default_value = "0.0")]
    pub cpr: Decimal,

    /// Annualized constant default rate (0.01 = 1% CDR)
    #[arg(long, default_value = "0.0")]
    pub cdr: Decimal,

    /// Loss severity on defaults (0.40 = 40% loss given default)
    #[arg(long, default_value = "0.0")]
    pub severity: Decimal,

    /// Total periods to carry the deal to, actuals included
    #[arg(long, default_value_t = 60)]
    pub horizon: u32,

    /// Evaluate tests/variables on actuals without routing cash through
    /// the waterfall
    #[arg(long)]
    pub evaluate_only: bool,

    /// Anchor date for snapshot dates (YYYY-MM-DD; defaults to today)
    #[arg(long)]
    pub start_date: Option<NaiveDate>,
}

pub fn run_simulate(args: SimulateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let deal: Map<String, Value> = if let Some(ref path) = args.deal {
        input::read_json(path)?
    } else if let Some(data) = input::read_stdin()? {
        serde_json::from_value(data)?
    } else {
        return Err("--deal <file.json> or stdin required".into());
    };

    let collateral: Map<String, Value> = match args.collateral {
        Some(ref path) => input::read_json(path)?,
        None => Map::new(),
    };

    let performance_rows = match args.tape {
        Some(ref path) => input::read_tape_csv(path)?,
        None => Vec::new(),
    };

    let sim_input = SimulationInput {
        deal,
        collateral,
        performance_rows,
        assumptions: ScenarioAssumptions {
            cpr: args.cpr,
            cdr: args.cdr,
            severity: args.severity,
        },
        horizon_periods: args.horizon,
        apply_waterfall_to_actuals: !args.evaluate_only,
        start_date: args.start_date,
    };

    let output = run_simulation(&sim_input, None, None)?;
    Ok(serde_json::to_value(output)?)
}
