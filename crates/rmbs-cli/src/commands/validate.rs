use clap::Args;
use serde_json::{json, Map, Value};

use rmbs_core::loader::DealLoader;

use crate::input;

#[derive(Args)]
pub struct ValidateArgs {
    /// Deal spec JSON file (stdin when piped and omitted)
    #[arg(long)]
    pub deal: Option<String>,
}

pub fn run_validate(args: ValidateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let spec: Map<String, Value> = if let Some(ref path) = args.deal {
        input::read_json(path)?
    } else if let Some(data) = input::read_stdin()? {
        serde_json::from_value(data)?
    } else {
        return Err("--deal <file.json> or stdin required".into());
    };

    let deal = DealLoader::new().load(&spec)?;

    let bonds: Vec<Value> = deal
        .bonds
        .values()
        .map(|b| {
            json!({
                "id": b.id,
                "type": b.bond_type,
                "original_balance": b.original_balance,
                "priority_interest": b.priority_interest,
                "priority_principal": b.priority_principal,
            })
        })
        .collect();

    let waterfalls: Map<String, Value> = deal
        .waterfalls
        .iter()
        .map(|(name, wf)| {
            (
                name.clone(),
                json!({
                    "steps": wf.steps.len(),
                    "write_down_order": wf.write_down_order,
                }),
            )
        })
        .collect();

    Ok(json!({
        "valid": true,
        "deal_id": deal.deal_id(),
        "bonds": bonds,
        "funds": deal.funds.keys().collect::<Vec<_>>(),
        "accounts": deal.accounts.keys().collect::<Vec<_>>(),
        "variables": deal.variables.len(),
        "tests": deal.tests.len(),
        "waterfalls": waterfalls,
        "cleanup_call_enabled": deal
            .options
            .cleanup_call
            .as_ref()
            .map(|c| c.enabled)
            .unwrap_or(false),
    }))
}
