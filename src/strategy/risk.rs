//! Rate annualization, liquidation distance and portfolio yield.
//!
//! Everything here is a pure function over `f64`; callers own any state.

use crate::domain::RiskMetrics;

/// Hourly funding cadence on the hedge venue
pub const FUNDING_PAYMENTS_PER_YEAR: u32 = 8760;

/// Lending reserves accrue per second
pub const SECONDS_PER_YEAR: u32 = 31_536_000;

/// Default buffer percentage below which a position is flagged
pub const DEFAULT_WARNING_THRESHOLD_PCT: f64 = 10.0;

// ==================== Rates ====================

/// Annualize a periodic rate, returned as a fraction.
///
/// With `compound` the annual rate `r * n` is computed first and then compounded as
/// `(1 + annual / n)^n - 1`. The inner term reduces to the periodic rate again; the
/// two-stage form is kept as-is because stored projections were computed this way.
pub fn annualize(periodic_rate: f64, payments_per_year: u32, compound: bool) -> f64 {
    let n = f64::from(payments_per_year);
    let annual_rate = periodic_rate * n;

    if !compound {
        return annual_rate;
    }

    (1.0 + annual_rate / n).powf(n) - 1.0
}

/// Lending APR to APY with per-second compounding
pub fn apr_to_apy(apr: f64) -> f64 {
    annualize(apr / f64::from(SECONDS_PER_YEAR), SECONDS_PER_YEAR, true)
}

/// Net yield on equity for a supply/borrow book.
///
/// Zero when borrowing has consumed all equity.
pub fn net_apy(supply_apy: f64, borrow_apy: f64, supply_usd: f64, borrow_usd: f64) -> f64 {
    let net_worth = supply_usd - borrow_usd;
    if net_worth <= 0.0 {
        return 0.0;
    }

    supply_apy * (supply_usd / net_worth) - borrow_apy * (borrow_usd / net_worth)
}

// ==================== Liquidation ====================

pub fn maintenance_margin(max_leverage: f64) -> f64 {
    0.5 / max_leverage
}

pub fn liquidation_threshold(total_position_usd: f64, max_leverage: f64) -> f64 {
    maintenance_margin(max_leverage) * total_position_usd
}

pub fn margin_buffer(account_value: f64, liquidation_threshold: f64) -> f64 {
    account_value - liquidation_threshold
}

/// Buffer as a percentage of the threshold; `+inf` when nothing is at risk
pub fn buffer_percentage(margin_buffer: f64, liquidation_threshold: f64) -> f64 {
    if liquidation_threshold > 0.0 {
        margin_buffer / liquidation_threshold * 100.0
    } else {
        f64::INFINITY
    }
}

/// Full liquidation picture for one account/position pair
pub fn near_liquidation(
    account_value: f64,
    total_position_usd: f64,
    max_leverage: f64,
    warning_threshold_pct: f64,
) -> RiskMetrics {
    let maintenance_margin = maintenance_margin(max_leverage);
    let liquidation_threshold = liquidation_threshold(total_position_usd, max_leverage);
    let margin_buffer = margin_buffer(account_value, liquidation_threshold);
    let buffer_percentage = buffer_percentage(margin_buffer, liquidation_threshold);

    RiskMetrics {
        maintenance_margin,
        liquidation_threshold,
        margin_buffer,
        buffer_percentage,
        is_near: buffer_percentage < warning_threshold_pct,
    }
}
