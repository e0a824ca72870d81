use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{
    ConnectionState, Fallback, HedgeSummary, LendingSummary, PositionInfo, UserReservePosition,
};
use crate::strategy::Projection;

/// Everything the coordinator knows after one refresh
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub updated_at: DateTime<Utc>,
    pub stream_state: ConnectionState,
    pub positions: Vec<PositionInfo>,
    pub hedge: HedgeSummary,
    pub reserves: Vec<UserReservePosition>,
    pub lending: LendingSummary,
    pub base_price: Fallback<f64>,
    /// Present once both legs and the hedge are open
    pub global_return: Option<Projection>,
}

/// Receives a dashboard on every refresh
pub trait DisplaySink: Send + Sync {
    fn render(&self, dashboard: &Dashboard);
}

/// Structured log lines, one per position plus lending and totals
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn render(&self, dashboard: &Dashboard) {
        for p in &dashboard.positions {
            info!(
                coin = %p.coin,
                size = p.signed_size,
                entry = p.entry_price,
                mark = p.mark_price,
                position_usd = p.position_usd,
                upnl = p.unrealized_pnl,
                funding_rate = p.funding.current_rate,
                funding_apy_pct = p.funding.projected_apy * 100.0,
                funding_since_open = p.funding.since_open,
                buffer_pct = p.risk.buffer_percentage,
                "Hedge position"
            );
        }

        let l = &dashboard.lending;
        info!(
            supply_usd = l.total_supply_usd,
            borrow_usd = l.total_borrow_usd,
            net_worth_usd = l.net_worth_usd,
            supply_apy_pct = l.supply_apy * 100.0,
            borrow_apy_pct = l.borrow_apy * 100.0,
            net_apy_pct = l.net_apy * 100.0,
            health_factor = l.health_factor,
            base_price = dashboard.base_price.value,
            stream = %dashboard.stream_state,
            "Lending summary"
        );
        if l.degraded || dashboard.base_price.degraded {
            warn!("Lending summary uses fallback prices");
        }

        if let Some(global) = &dashboard.global_return {
            info!(
                net_apy_pct = global.net_apy_pct,
                net_profit_usd = global.net_profit_usd,
                "Total annualized return"
            );
        }
    }
}
