mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;

use commands::project::ProjectArgs;
use commands::simulate::SimulateArgs;
use commands::validate::ValidateArgs;

/// RMBS deal cashflow analytics
#[derive(Parser)]
#[command(
    name = "rmbs",
    version,
    about = "RMBS deal cashflow analytics",
    long_about = "Runs rule-driven RMBS deal simulations: loads a deal spec, \
                  applies servicer actuals, projects collateral cashflows under \
                  CPR/CDR/severity assumptions, executes the payment waterfall, \
                  and reconciles model balances against the servicer tape."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full deal simulation (actuals + projection + reconciliation)
    Simulate(SimulateArgs),
    /// Project collateral pool cashflows under CPR/CDR/severity
    Project(ProjectArgs),
    /// Load and validate a deal spec
    Validate(ValidateArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Simulate(args) => commands::simulate::run_simulate(args),
        Commands::Project(args) => commands::project::run_project(args),
        Commands::Validate(args) => commands::validate::run_validate(args),
        Commands::Version => {
            println!("rmbs {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
