use clap::{Parser, Subcommand};

use crate::strategy::{ExecutionReport, Projection, ProjectionInputs};

#[derive(Parser)]
#[command(name = "deltacarry")]
#[command(version = "0.1.0")]
#[command(about = "Delta-neutral lending/perp carry coordinator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, env = "CARRY_CONFIG_DIR", default_value = "config")]
    pub config_dir: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Track hedge positions and lending balances until Ctrl-C
    Monitor,
    /// Project the carry and, if it clears the threshold, enter it
    Execute {
        /// Run even though positions are already open
        #[arg(long)]
        allow_existing: bool,
    },
    /// Print the projected return for one unit of collateral
    Project,
}

pub fn print_projection(base_asset: &str, inputs: &ProjectionInputs, projection: &Projection) {
    println!();
    println!(
        "Strategy breakdown (1 {} @ ${:.2})",
        base_asset, inputs.base_price
    );
    println!(
        "  Supply APY:      {:>8.2}%   ${:>10.2}",
        inputs.supply_apy * 100.0,
        projection.supply_earnings_usd
    );
    println!(
        "  Borrow APY:      {:>8.2}%   ${:>10.2}   ({:.0}% of {:.0}% LTV)",
        inputs.borrow_apy * 100.0,
        projection.borrow_cost_usd,
        inputs.borrow_fraction_of_ltv * 100.0,
        inputs.base_ltv * 100.0
    );
    println!(
        "  Net lending APY: {:>8.2}%",
        projection.lending_net_apy * 100.0
    );
    println!(
        "  Funding APY:     {:>8.2}%   ${:>10.2}",
        inputs.funding_apy * 100.0,
        projection.hedge_funding_usd
    );
    println!(
        "  Global net APY:  {:>8.2}%   ${:>10.2}",
        projection.net_apy_pct, projection.net_profit_usd
    );
    println!();
}

pub fn print_report(report: &ExecutionReport) {
    println!();
    println!("Entry {} complete", report.run_id);
    println!("  Swapped:   {}", report.quote_swapped);
    println!("  Supplied:  {}", report.base_supplied);
    println!("  Borrowed:  {}", report.quote_borrowed);
    println!(
        "  Bridged:   confirmed after {} poll(s)",
        report.bridge_confirmed_after
    );
    println!("  Hedge:     short {}", report.hedge_size);
    for fill in &report.fills {
        println!(
            "    fill oid={} size={} px={}",
            fill.oid,
            fill.total_sz.unwrap_or_default(),
            fill.avg_px.unwrap_or_default()
        );
    }
    println!();
}
