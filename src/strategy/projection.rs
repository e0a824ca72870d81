//! Expected annual return of the carry, before entry and on live positions.
//!
//! All rates are fractions; only `net_apy_pct` is a percentage, since that is what the
//! entry gate compares against.

use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tracing::debug;

use crate::domain::{PositionInfo, UserReservePosition};
use crate::error::{CarryError, Result};
use crate::exchange::LendingProtocol;
use crate::strategy::risk;

/// Market inputs for projecting one unit of supplied base asset
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProjectionInputs {
    pub base_price: f64,
    pub base_ltv: f64,
    pub borrow_fraction_of_ltv: f64,
    pub supply_apy: f64,
    pub borrow_apy: f64,
    /// Annualized funding earned by the short hedge
    pub funding_apy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub supply_usd: f64,
    pub borrow_usd: f64,
    pub supply_earnings_usd: f64,
    pub borrow_cost_usd: f64,
    pub hedge_funding_usd: f64,
    pub net_profit_usd: f64,
    /// Lending-only yield on equity
    pub lending_net_apy: f64,
    /// Net profit over equity, in percent
    pub net_apy_pct: f64,
}

impl Projection {
    fn from_legs(
        supply_usd: f64,
        borrow_usd: f64,
        supply_apy: f64,
        borrow_apy: f64,
        hedge_funding_usd: f64,
    ) -> Self {
        let supply_earnings_usd = supply_usd * supply_apy;
        let borrow_cost_usd = borrow_usd * borrow_apy;
        let net_profit_usd = supply_earnings_usd - borrow_cost_usd + hedge_funding_usd;

        let equity = supply_usd - borrow_usd;
        let net_apy_pct = if equity > 0.0 {
            net_profit_usd / equity * 100.0
        } else {
            0.0
        };

        Self {
            supply_usd,
            borrow_usd,
            supply_earnings_usd,
            borrow_cost_usd,
            hedge_funding_usd,
            net_profit_usd,
            lending_net_apy: risk::net_apy(supply_apy, borrow_apy, supply_usd, borrow_usd),
            net_apy_pct,
        }
    }
}

/// Project the carry for one unit of base asset supplied at the oracle price.
///
/// The hedge is sized to the supplied amount, so its funding leg is
/// `base_price * funding_apy`.
pub fn project(inputs: &ProjectionInputs) -> Projection {
    let supply_usd = inputs.base_price;
    let borrow_usd = inputs.base_price * inputs.base_ltv * inputs.borrow_fraction_of_ltv;

    Projection::from_legs(
        supply_usd,
        borrow_usd,
        inputs.supply_apy,
        inputs.borrow_apy,
        inputs.base_price * inputs.funding_apy,
    )
}

/// Return on the positions actually held.
///
/// `hedge.notional_usd` is signed, so a short earning positive funding contributes
/// `-notional * projected_apy > 0`.
pub fn global_return(
    base: &UserReservePosition,
    quote: &UserReservePosition,
    hedge: &PositionInfo,
) -> Projection {
    Projection::from_legs(
        base.supply_usd(),
        quote.borrow_usd(),
        risk::apr_to_apy(base.supply_apr),
        risk::apr_to_apy(quote.borrow_apr),
        -hedge.notional_usd * hedge.funding.projected_apy,
    )
}

/// Gather projection inputs from the lending venue and a periodic funding rate.
pub async fn fetch_inputs(
    lending: &dyn LendingProtocol,
    base_asset: &str,
    quote_asset: &str,
    periodic_funding_rate: f64,
    payments_per_year: u32,
    borrow_fraction_of_ltv: f64,
) -> Result<ProjectionInputs> {
    let base_price = lending
        .oracle_price(base_asset)
        .await?
        .to_f64()
        .unwrap_or(0.0);
    if base_price <= 0.0 {
        return Err(CarryError::MarketDataUnavailable(format!(
            "{} oracle price is {}",
            base_asset, base_price
        )));
    }

    let base = lending.get_reserve_data(base_asset).await?;
    let quote = lending.get_reserve_data(quote_asset).await?;

    let inputs = ProjectionInputs {
        base_price,
        base_ltv: base.ltv,
        borrow_fraction_of_ltv,
        supply_apy: base.supply_apy(),
        borrow_apy: quote.borrow_apy(),
        funding_apy: risk::annualize(periodic_funding_rate, payments_per_year, false),
    };
    debug!(?inputs, "Projection inputs");
    Ok(inputs)
}
