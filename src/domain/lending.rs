use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Fallback;
use crate::error::Result;
use crate::strategy::risk;

const STABLECOINS: &[&str] = &["USDC", "USDT", "DAI", "USDC.E", "USDBC", "LUSD", "FRAX"];

pub fn is_stablecoin(symbol: &str) -> bool {
    STABLECOINS.contains(&symbol.to_ascii_uppercase().as_str())
}

/// USD price for a reserve asset; stablecoins fall back to 1 and anything else to 0.
pub fn usd_price(symbol: &str, oracle: Result<f64>) -> Fallback<f64> {
    let fallback = if is_stablecoin(symbol) { 1.0 } else { 0.0 };
    match oracle {
        Ok(price) if price.is_finite() && price > 0.0 => Fallback::fresh(price),
        Ok(price) => Fallback::degraded(fallback, format!("{symbol}: bad oracle price {price}")),
        Err(e) => Fallback::from_result(Err(e), fallback, symbol),
    }
}

/// Receipt for a submitted lending-venue transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub success: bool,
    /// Amount received, for swaps that report it
    #[serde(default)]
    pub amount_out: Option<Decimal>,
}

impl TxReceipt {
    pub fn confirmed(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            success: true,
            amount_out: None,
        }
    }

    pub fn with_amount_out(mut self, amount: Decimal) -> Self {
        self.amount_out = Some(amount);
        self
    }
}

/// Reserve configuration and current rates; rates are APRs as fractions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveData {
    pub symbol: String,
    pub ltv: f64,
    pub liquidation_threshold: f64,
    pub liquidation_bonus: f64,
    /// Supply APR
    pub liquidity_rate: f64,
    pub variable_borrow_rate: f64,
    pub collateral_enabled: bool,
    pub borrowing_enabled: bool,
}

impl ReserveData {
    pub fn supply_apy(&self) -> f64 {
        risk::apr_to_apy(self.liquidity_rate)
    }

    pub fn borrow_apy(&self) -> f64 {
        risk::apr_to_apy(self.variable_borrow_rate)
    }
}

/// Account-level lending position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccountData {
    pub total_collateral_usd: f64,
    pub total_debt_usd: f64,
    pub available_borrows_usd: f64,
    pub current_liquidation_threshold: f64,
    pub ltv: f64,
    pub health_factor: f64,
}

/// One reserve the account supplies to or borrows from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReservePosition {
    pub symbol: String,
    pub supply_balance: f64,
    pub borrow_balance: f64,
    pub price_usd: Fallback<f64>,
    pub supply_apr: f64,
    pub borrow_apr: f64,
    pub liquidation_threshold: f64,
    pub usage_as_collateral: bool,
}

impl UserReservePosition {
    pub fn supply_usd(&self) -> f64 {
        self.supply_balance * self.price_usd.value
    }

    pub fn borrow_usd(&self) -> f64 {
        self.borrow_balance * self.price_usd.value
    }

    pub fn is_empty(&self) -> bool {
        self.supply_balance == 0.0 && self.borrow_balance == 0.0
    }
}

/// Portfolio-level view over all lending reserves
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LendingSummary {
    pub total_supply_usd: f64,
    pub total_borrow_usd: f64,
    pub net_worth_usd: f64,
    pub supply_apr: f64,
    pub borrow_apr: f64,
    pub supply_apy: f64,
    pub borrow_apy: f64,
    pub net_apy: f64,
    /// `+inf` with no debt
    pub health_factor: f64,
    /// Any reserve priced from a fallback value
    pub degraded: bool,
}

impl LendingSummary {
    pub fn from_reserves(reserves: &[UserReservePosition]) -> Self {
        let mut total_supply_usd = 0.0;
        let mut total_borrow_usd = 0.0;
        let mut weighted_supply_apr = 0.0;
        let mut weighted_borrow_apr = 0.0;
        let mut weighted_threshold = 0.0;

        for reserve in reserves {
            let supply_usd = reserve.supply_usd();
            let borrow_usd = reserve.borrow_usd();

            total_supply_usd += supply_usd;
            total_borrow_usd += borrow_usd;
            weighted_supply_apr += reserve.supply_apr * supply_usd;
            weighted_borrow_apr += reserve.borrow_apr * borrow_usd;

            if reserve.usage_as_collateral {
                weighted_threshold += supply_usd * reserve.liquidation_threshold;
            }
        }

        let supply_apr = if total_supply_usd > 0.0 {
            weighted_supply_apr / total_supply_usd
        } else {
            0.0
        };
        let borrow_apr = if total_borrow_usd > 0.0 {
            weighted_borrow_apr / total_borrow_usd
        } else {
            0.0
        };

        let supply_apy = risk::apr_to_apy(supply_apr);
        let borrow_apy = risk::apr_to_apy(borrow_apr);

        let health_factor = if total_borrow_usd > 0.0 {
            weighted_threshold / total_borrow_usd
        } else {
            f64::INFINITY
        };

        Self {
            total_supply_usd,
            total_borrow_usd,
            net_worth_usd: total_supply_usd - total_borrow_usd,
            supply_apr,
            borrow_apr,
            supply_apy,
            borrow_apy,
            net_apy: risk::net_apy(supply_apy, borrow_apy, total_supply_usd, total_borrow_usd),
            health_factor,
            degraded: reserves.iter().any(|r| r.price_usd.degraded),
        }
    }

    pub fn has_positions(&self) -> bool {
        self.total_supply_usd > 0.0 || self.total_borrow_usd > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CarryError;

    fn reserve(symbol: &str, supply: f64, borrow: f64, price: f64) -> UserReservePosition {
        UserReservePosition {
            symbol: symbol.to_string(),
            supply_balance: supply,
            borrow_balance: borrow,
            price_usd: Fallback::fresh(price),
            supply_apr: 0.02,
            borrow_apr: 0.05,
            liquidation_threshold: 0.825,
            usage_as_collateral: supply > 0.0,
        }
    }

    #[test]
    fn test_summary_without_debt_has_infinite_health() {
        let summary = LendingSummary::from_reserves(&[reserve("WETH", 1.0, 0.0, 3000.0)]);
        assert_eq!(summary.total_supply_usd, 3000.0);
        assert!(summary.health_factor.is_infinite());
        assert!((summary.net_apy - summary.supply_apy).abs() < 1e-12);
        assert!(summary.has_positions());
    }

    #[test]
    fn test_summary_weights_by_usd() {
        let summary = LendingSummary::from_reserves(&[
            reserve("WETH", 1.0, 0.0, 3000.0),
            reserve("USDC", 0.0, 1200.0, 1.0),
        ]);
        assert_eq!(summary.total_borrow_usd, 1200.0);
        assert_eq!(summary.net_worth_usd, 1800.0);
        assert!((summary.health_factor - 3000.0 * 0.825 / 1200.0).abs() < 1e-12);
        assert_eq!(summary.supply_apr, 0.02);
        assert_eq!(summary.borrow_apr, 0.05);
        assert!(!summary.degraded);
    }

    #[test]
    fn test_usd_price_fallbacks() {
        let stable = usd_price("usdc", Err(CarryError::Connection("rpc".into())));
        assert!(stable.degraded);
        assert_eq!(stable.value, 1.0);

        let unknown = usd_price("PEPE", Ok(0.0));
        assert!(unknown.degraded);
        assert_eq!(unknown.value, 0.0);

        assert_eq!(usd_price("WETH", Ok(3000.0)), Fallback::fresh(3000.0));
    }
}
