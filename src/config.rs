use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub hedge: HedgeConfig,
    pub lending: LendingConfig,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// WebSocket endpoint of the hedge exchange push feed
    pub ws_url: String,
    /// Account whose snapshots and funding events are subscribed
    pub wallet_address: String,
    /// Coins to subscribe active-context updates for
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,
    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Keep-alive ping cadence
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_coins() -> Vec<String> {
    vec!["ETH".to_string()]
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgeConfig {
    /// REST endpoint (the `/info` path is appended)
    pub rest_url: String,
    /// Perp symbol used for the short hedge
    pub symbol: String,
    /// Max slippage for the market order (e.g., 0.01 = 1%)
    pub slippage: Decimal,
    /// Address the borrowed quote asset is sent to
    pub deposit_address: String,
    /// Simulate order placement instead of submitting
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LendingConfig {
    /// Collateral asset symbol (e.g., "WETH")
    pub base_asset: String,
    /// Borrowed asset symbol (e.g., "USDC")
    pub quote_asset: String,
    /// Paper venue: idle quote balance held in the wallet
    #[serde(default)]
    pub paper_quote_balance: Decimal,
    /// Paper venue: oracle price of the base asset in USD
    #[serde(default)]
    pub paper_base_price: Decimal,
    /// Paper venue: base asset LTV (e.g., 0.8)
    #[serde(default)]
    pub paper_base_ltv: f64,
    /// Paper venue: base asset supply APR
    #[serde(default)]
    pub paper_supply_rate: f64,
    /// Paper venue: quote asset variable borrow APR
    #[serde(default)]
    pub paper_borrow_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Minimum projected return before entering, as a multiple (2.0 = 200%)
    pub min_profitability: f64,
    /// Fraction of the base asset LTV to borrow (e.g., 0.5)
    pub borrow_fraction_of_ltv: Decimal,
    /// Fraction of idle quote balance to swap into collateral
    pub swap_fraction: Decimal,
    /// Minimum-out guard relative to the oracle-priced amount
    #[serde(default = "default_swap_min_out_ratio")]
    pub swap_min_out_ratio: Decimal,
    /// Buffer percentage below which a position is flagged near liquidation
    #[serde(default = "default_warning_threshold_pct")]
    pub warning_threshold_pct: f64,
    /// Funding payments per year (hourly funding)
    #[serde(default = "default_funding_payments_per_year")]
    pub funding_payments_per_year: u32,
}

fn default_swap_min_out_ratio() -> Decimal {
    Decimal::new(995, 3)
}

fn default_warning_threshold_pct() -> f64 {
    10.0
}

fn default_funding_payments_per_year() -> u32 {
    8760
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Interval between hedge account polls while waiting for the bridge deposit
    #[serde(default = "default_bridge_poll_interval_ms")]
    pub bridge_poll_interval_ms: u64,
    /// Maximum number of hedge account polls
    #[serde(default = "default_bridge_max_retries")]
    pub bridge_max_retries: u32,
}

fn default_bridge_poll_interval_ms() -> u64 {
    1000
}

fn default_bridge_max_retries() -> u32 {
    30
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            bridge_poll_interval_ms: 1000,
            bridge_max_retries: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Lending refresh cadence
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Self::default_config();

        let builder = Config::builder()
            .set_default("stream.ws_url", defaults.stream.ws_url)?
            .set_default("stream.wallet_address", "")?
            .set_default("hedge.rest_url", defaults.hedge.rest_url)?
            .set_default("hedge.symbol", defaults.hedge.symbol)?
            .set_default("hedge.slippage", defaults.hedge.slippage.to_string())?
            .set_default("hedge.deposit_address", defaults.hedge.deposit_address)?
            .set_default("lending.base_asset", defaults.lending.base_asset)?
            .set_default("lending.quote_asset", defaults.lending.quote_asset)?
            .set_default(
                "lending.paper_quote_balance",
                defaults.lending.paper_quote_balance.to_string(),
            )?
            .set_default(
                "lending.paper_base_price",
                defaults.lending.paper_base_price.to_string(),
            )?
            .set_default("lending.paper_base_ltv", defaults.lending.paper_base_ltv)?
            .set_default("lending.paper_supply_rate", defaults.lending.paper_supply_rate)?
            .set_default("lending.paper_borrow_rate", defaults.lending.paper_borrow_rate)?
            .set_default("strategy.min_profitability", defaults.strategy.min_profitability)?
            .set_default(
                "strategy.borrow_fraction_of_ltv",
                defaults.strategy.borrow_fraction_of_ltv.to_string(),
            )?
            .set_default("strategy.swap_fraction", defaults.strategy.swap_fraction.to_string())?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CARRY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CARRY_STREAM__WALLET_ADDRESS, etc.)
            .add_source(
                Environment::with_prefix("CARRY")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Default configuration for a mainnet ETH/USDC carry in dry-run mode
    pub fn default_config() -> Self {
        use rust_decimal_macros::dec;

        Self {
            stream: StreamConfig {
                ws_url: "wss://api.hyperliquid.xyz/ws".to_string(),
                wallet_address: String::new(),
                coins: default_coins(),
                reconnect_delay_ms: default_reconnect_delay_ms(),
                ping_interval_secs: default_ping_interval_secs(),
                connect_timeout_secs: default_connect_timeout_secs(),
            },
            hedge: HedgeConfig {
                rest_url: "https://api.hyperliquid.xyz".to_string(),
                symbol: "ETH".to_string(),
                slippage: dec!(0.01),
                deposit_address: "0x2df1c51e09aecf9cacb7bc98cb1742757f163df7".to_string(),
                dry_run: true,
            },
            lending: LendingConfig {
                base_asset: "WETH".to_string(),
                quote_asset: "USDC".to_string(),
                paper_quote_balance: dec!(1000),
                paper_base_price: dec!(3000),
                paper_base_ltv: 0.8,
                paper_supply_rate: 0.02,
                paper_borrow_rate: 0.05,
            },
            strategy: StrategyConfig {
                min_profitability: 2.0,
                borrow_fraction_of_ltv: dec!(0.5),
                swap_fraction: dec!(0.1),
                swap_min_out_ratio: default_swap_min_out_ratio(),
                warning_threshold_pct: default_warning_threshold_pct(),
                funding_payments_per_year: default_funding_payments_per_year(),
            },
            execution: ExecutionConfig::default(),
            coordinator: CoordinatorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stream.wallet_address.trim().is_empty() {
            errors.push("stream.wallet_address must be set".to_string());
        }

        match Url::parse(&self.stream.ws_url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            _ => errors.push(format!(
                "stream.ws_url must be a ws:// or wss:// URL, got {}",
                self.stream.ws_url
            )),
        }

        match Url::parse(&self.hedge.rest_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => errors.push(format!(
                "hedge.rest_url must be an http(s) URL, got {}",
                self.hedge.rest_url
            )),
        }

        if self.stream.reconnect_delay_ms == 0 {
            errors.push("stream.reconnect_delay_ms must be positive".to_string());
        }

        if self.hedge.slippage <= Decimal::ZERO || self.hedge.slippage >= Decimal::ONE {
            errors.push("hedge.slippage must be between 0 and 1".to_string());
        }

        let fractions = [
            ("strategy.borrow_fraction_of_ltv", self.strategy.borrow_fraction_of_ltv),
            ("strategy.swap_fraction", self.strategy.swap_fraction),
            ("strategy.swap_min_out_ratio", self.strategy.swap_min_out_ratio),
        ];
        for (name, value) in fractions {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                errors.push(format!("{name} must be in (0, 1], got {value}"));
            }
        }

        if self.strategy.funding_payments_per_year == 0 {
            errors.push("strategy.funding_payments_per_year must be positive".to_string());
        }

        if self.execution.bridge_max_retries == 0 {
            errors.push("execution.bridge_max_retries must be at least 1".to_string());
        }

        if self.coordinator.refresh_interval_ms == 0 {
            errors.push("coordinator.refresh_interval_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
