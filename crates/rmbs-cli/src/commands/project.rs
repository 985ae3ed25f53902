use clap::Args;
use rust_decimal::Decimal;
use serde_json::Value;

use rmbs_core::collateral::CollateralModel;

#[derive(Args)]
pub struct ProjectArgs {
    /// Starting pool balance
    #[arg(long)]
    pub balance: Decimal,

    /// Weighted-average coupon (annual, 0.06 = 6%)
    #[arg(long, default_value = "0.06")]
    pub wac: Decimal,

    /// Weighted-average maturity in months
    #[arg(long, default_value_t = 360)]
    pub wam: u32,

    /// Number of monthly periods to project
    #[arg(long, default_value_t = 60)]
    pub periods: u32,

    /// Annualized constant prepayment rate
    #[arg(long, default_value = "0.0")]
    pub cpr: Decimal,

    /// Annualized constant default rate
    #[arg(long, default_value = "0.0")]
    pub cdr: Decimal,

    /// Loss severity on defaults
    #[arg(long, default_value = "0.0")]
    pub severity: Decimal,
}

pub fn run_project(args: ProjectArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let model = CollateralModel::new(args.balance, args.wac, args.wam);
    let rows = model.generate_cashflows(args.periods, args.cpr, args.cdr, args.severity, None)?;
    Ok(serde_json::to_value(rows)?)
}
