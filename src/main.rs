use anyhow::{Context, Result};
use clap::Parser;
use deltacarry::cli::{self, Cli, Commands};
use deltacarry::config::AppConfig;
use deltacarry::coordinator::{Coordinator, LogDisplay};
use deltacarry::error::CarryError;
use deltacarry::exchange::HedgeExchange;
use deltacarry::strategy::{
    fetch_inputs, project, should_execute, RetryPolicy, WorkflowParams,
};
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{build_venues, init_logging, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config_dir)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Monitor => run_monitor(config).await,
        Commands::Execute { allow_existing } => run_execute(config, allow_existing).await,
        Commands::Project => run_project(config).await,
    }
}

async fn run_monitor(config: AppConfig) -> Result<()> {
    let (lending, hedge) = build_venues(&config)?;
    let coordinator = Coordinator::from_config(&config, lending, hedge, Arc::new(LogDisplay))?;

    info!("Initializing connections...");
    tokio::select! {
        result = coordinator.initialize() => result?,
        _ = signal::ctrl_c() => {
            info!("Interrupted during startup");
            coordinator.stream().stop().await;
            return Ok(());
        }
    }
    coordinator.wait_all_ready().await;
    info!("All data sources ready");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(coordinator.run(shutdown_rx));

    signal::ctrl_c().await?;
    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    handle.await.context("coordinator task failed")?;
    Ok(())
}

/// Build a coordinator with the hedge account and funding rates pulled over REST.
async fn prepare(config: &AppConfig) -> Result<Coordinator> {
    let (lending, hedge) = build_venues(config)?;

    let contexts = hedge
        .asset_contexts()
        .await
        .context("failed to fetch funding rates")?;
    let coordinator =
        Coordinator::from_config(config, lending, hedge.clone(), Arc::new(LogDisplay))?;
    for context in contexts.into_values() {
        coordinator.tracker().contexts().update(context);
    }
    coordinator
        .sync_hedge_state()
        .await
        .context("failed to load hedge account")?;
    Ok(coordinator)
}

async fn project_for(config: &AppConfig, coordinator: &Coordinator) -> Result<f64> {
    let funding = coordinator.tracker().funding_rate(&config.hedge.symbol);
    let borrow_fraction = config
        .strategy
        .borrow_fraction_of_ltv
        .to_f64()
        .unwrap_or_default();

    let inputs = fetch_inputs(
        coordinator.lending().as_ref(),
        &config.lending.base_asset,
        &config.lending.quote_asset,
        funding,
        config.strategy.funding_payments_per_year,
        borrow_fraction,
    )
    .await?;
    let projection = project(&inputs);
    cli::print_projection(&config.lending.base_asset, &inputs, &projection);
    Ok(projection.net_apy_pct)
}

async fn run_project(config: AppConfig) -> Result<()> {
    let coordinator = prepare(&config).await?;
    let apy_pct = project_for(&config, &coordinator).await?;
    let verdict = if should_execute(apy_pct, config.strategy.min_profitability) {
        "clears"
    } else {
        "does not clear"
    };
    println!(
        "Projected {:.2}% {} the {:.0}% entry threshold",
        apy_pct,
        verdict,
        config.strategy.min_profitability * 100.0
    );
    Ok(())
}

async fn run_execute(config: AppConfig, allow_existing: bool) -> Result<()> {
    let coordinator = prepare(&config).await?;

    if !coordinator.hedge().is_dry_run() {
        return Err(CarryError::Unsupported(
            "live entry needs a signing hedge venue; set hedge.dry_run = true".to_string(),
        )
        .into());
    }

    // The workflow cannot tell how far an earlier run got.
    if coordinator.has_open_positions().await? {
        if !allow_existing {
            return Err(CarryError::InvalidState(
                "positions already open; pass --allow-existing to enter anyway".to_string(),
            )
            .into());
        }
        warn!("Entering with positions already open");
    }

    let apy_pct = project_for(&config, &coordinator).await?;
    if !should_execute(apy_pct, config.strategy.min_profitability) {
        info!("Projected return below threshold, not entering");
        return Ok(());
    }

    let workflow = coordinator.workflow(
        WorkflowParams::from_config(&config),
        RetryPolicy::from_config(&config.execution),
    );
    match workflow.execute().await {
        Ok(report) => {
            cli::print_report(&report);
            Ok(())
        }
        Err(e) => {
            if e.has_side_effects() {
                error!(error = %e, "Entry stopped part-way; reconcile venue state by hand");
            } else {
                error!(error = %e, "Entry aborted before any venue state changed");
            }
            Err(e.into())
        }
    }
}
