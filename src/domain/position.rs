use serde::Serialize;

/// Funding accrued on a position and its forward-looking annualized rate.
///
/// `since_open` is reported from the holder's point of view: positive means the
/// position has been paid funding, negative means it has paid.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FundingInfo {
    pub all_time: f64,
    pub since_open: f64,
    pub since_change: f64,
    /// Sign-adjusted periodic rate (positive = position receives funding)
    pub current_rate: f64,
    /// `current_rate` annualized as a fraction
    pub projected_apy: f64,
}

/// Distance to liquidation for a cross-margin account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub maintenance_margin: f64,
    pub liquidation_threshold: f64,
    pub margin_buffer: f64,
    /// `+inf` when the liquidation threshold is zero
    pub buffer_percentage: f64,
    pub is_near: bool,
}

/// Derived view of one open perp position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionInfo {
    pub coin: String,
    /// Positive = long, negative = short; never zero
    pub signed_size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub max_leverage: u32,
    /// 0 when the venue reports no liquidation price
    pub liquidation_price: f64,
    pub notional_usd: f64,
    pub position_usd: f64,
    pub unrealized_pnl: f64,
    pub account_value: f64,
    pub funding: FundingInfo,
    pub risk: RiskMetrics,
}

impl PositionInfo {
    pub fn is_long(&self) -> bool {
        self.signed_size > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.signed_size < 0.0
    }
}

/// Aggregate over all hedge positions, weighted by notional
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HedgeSummary {
    pub total_position_usd: f64,
    pub total_notional_usd: f64,
    pub weighted_funding_rate: f64,
    pub weighted_funding_apy: f64,
    pub position_count: usize,
}
