use anyhow::{Context, Result};
use deltacarry::adapters::{HyperliquidRest, PaperLending, TransferHook};
use deltacarry::config::{AppConfig, LoggingConfig};
use deltacarry::error::CarryError;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if logging.level.is_empty() || logging.level == "info" {
            EnvFilter::new("info,deltacarry=debug")
        } else {
            EnvFilter::new(&logging.level)
        }
    });

    // File logging only when CARRY_LOG_DIR is set and writable.
    //
    // `tracing_appender::rolling::daily` panics if it can't create the initial file,
    // so writability is checked first.
    let log_dir = std::env::var("CARRY_LOG_DIR").ok();
    let file_layer = log_dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory {} ({}), file logging disabled", dir, e);
            return None;
        }
        let test_path = std::path::Path::new(dir).join(".deltacarry_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&test_path) {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(dir, "deltacarry.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir, e
                );
                None
            }
        }
    });

    let text_layer = (!logging.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });
    let json_layer = logging
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/deltacarry.log", dir);
    }
}

/// Load config and refuse to start on any invalid value.
pub fn load_config(config_dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir))?;
    config
        .validate()
        .map_err(|errors| CarryError::Validation(errors.join("; ")))?;
    Ok(config)
}

/// Paper lending venue plus the hedge client.
///
/// Transfers of the quote asset to the bridge deposit address are credited to the
/// hedge client's simulated margin, so bridge polling sees the deposit land.
pub fn build_venues(config: &AppConfig) -> Result<(Arc<PaperLending>, Arc<HyperliquidRest>)> {
    let hedge = Arc::new(
        HyperliquidRest::new(&config.hedge.rest_url, config.hedge.dry_run)
            .context("failed to build hedge client")?,
    );

    let bridge = Arc::clone(&hedge);
    let quote = config.lending.quote_asset.clone();
    let deposit = config.hedge.deposit_address.clone();
    let hook: TransferHook = Arc::new(move |asset: &str, to: &str, amount: Decimal| {
        if asset == quote && to.eq_ignore_ascii_case(&deposit) {
            bridge.credit_bridge_deposit(amount);
        }
    });

    let lending = Arc::new(PaperLending::from_config(&config.lending).with_transfer_hook(hook));
    info!(
        lending = "paper",
        hedge = %config.hedge.rest_url,
        dry_run = config.hedge.dry_run,
        "Venues ready"
    );
    Ok((lending, hedge))
}
