//! Derived hedge positions.
//!
//! The position set is rebuilt from scratch on every account snapshot and is a pure
//! function of (snapshot, context cache). Asset contexts arrive on their own feed and
//! may lag the snapshot; a coin without a cached context is priced with a zero
//! funding rate until one arrives.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::adapters::stream::{
    StreamClient, TOPIC_ACTIVE_ASSET_CTX, TOPIC_USER_FUNDINGS, TOPIC_WEB_DATA,
};
use crate::config::StrategyConfig;
use crate::domain::{
    AccountSnapshot, AssetContext, FundingInfo, HedgeSummary, LendingSummary, PositionInfo,
    RawPosition, RiskMetrics,
};
use crate::error::{CarryError, Result};
use crate::strategy::risk;

/// Latest context per symbol, replaced wholesale on each update
#[derive(Debug, Default)]
pub struct AssetContextCache {
    contexts: DashMap<String, AssetContext>,
}

impl AssetContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, context: AssetContext) {
        self.contexts.insert(context.symbol.clone(), context);
    }

    pub fn get(&self, symbol: &str) -> Option<AssetContext> {
        self.contexts.get(symbol).map(|c| c.clone())
    }

    /// Periodic funding rate, 0 when nothing is cached
    pub fn funding_rate(&self, symbol: &str) -> f64 {
        self.contexts
            .get(symbol)
            .map(|c| c.periodic_funding_rate)
            .unwrap_or(0.0)
    }

    /// Mark price, 0 when nothing is cached
    pub fn mark_price(&self, symbol: &str) -> f64 {
        self.contexts
            .get(symbol)
            .map(|c| c.mark_price)
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> HashMap<String, AssetContext> {
        self.contexts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

fn required(coin: &str, field: &str, value: Option<f64>) -> Result<f64> {
    value.ok_or_else(|| CarryError::DataUnavailable {
        coin: coin.to_string(),
        field: field.to_string(),
    })
}

/// Build one position. `Ok(None)` for a flat (zero-size) entry.
pub fn derive_position(
    raw: &RawPosition,
    account_value: Option<f64>,
    contexts: &AssetContextCache,
    warning_threshold_pct: f64,
    payments_per_year: u32,
) -> Result<Option<PositionInfo>> {
    let coin = raw.coin.as_deref().ok_or_else(|| CarryError::DataUnavailable {
        coin: "<unknown>".to_string(),
        field: "coin".to_string(),
    })?;

    let size = required(coin, "szi", raw.szi)?;
    if size == 0.0 {
        return Ok(None);
    }

    let entry_price = required(coin, "entryPx", raw.entry_px)?;
    let position_usd = required(coin, "positionValue", raw.position_value)?;
    let unrealized_pnl = required(coin, "unrealizedPnl", raw.unrealized_pnl)?;
    let max_leverage = required(coin, "maxLeverage", raw.max_leverage)?;
    let leverage = required(
        coin,
        "leverage.value",
        raw.leverage.as_ref().and_then(|l| l.value),
    )?;
    let cum_funding = raw
        .cum_funding
        .as_ref()
        .ok_or_else(|| CarryError::DataUnavailable {
            coin: coin.to_string(),
            field: "cumFunding".to_string(),
        })?;
    let account_value = required(coin, "marginSummary.accountValue", account_value)?;

    // Longs pay positive funding, shorts receive it
    let raw_rate = contexts.funding_rate(coin);
    let current_rate = if size > 0.0 { -raw_rate } else { raw_rate };

    let funding = FundingInfo {
        all_time: required(coin, "cumFunding.allTime", cum_funding.all_time)?,
        since_open: -required(coin, "cumFunding.sinceOpen", cum_funding.since_open)?,
        since_change: required(coin, "cumFunding.sinceChange", cum_funding.since_change)?,
        current_rate,
        projected_apy: risk::annualize(current_rate, payments_per_year, false),
    };

    let risk = risk::near_liquidation(
        account_value,
        position_usd,
        max_leverage,
        warning_threshold_pct,
    );

    Ok(Some(PositionInfo {
        coin: coin.to_string(),
        signed_size: size,
        entry_price,
        mark_price: contexts.mark_price(coin),
        leverage: leverage.trunc() as u32,
        max_leverage: max_leverage.trunc() as u32,
        liquidation_price: raw.liquidation_px.unwrap_or(0.0),
        notional_usd: size * entry_price,
        position_usd,
        unrealized_pnl,
        account_value,
        funding,
        risk,
    }))
}

/// Rebuild the full position set. Positions with missing fields are skipped and logged.
pub fn build_positions(
    snapshot: &AccountSnapshot,
    contexts: &AssetContextCache,
    warning_threshold_pct: f64,
    payments_per_year: u32,
) -> BTreeMap<String, PositionInfo> {
    let account_value = snapshot.account_value();
    let mut positions = BTreeMap::new();

    for raw in snapshot.positions() {
        let derived = raw.and_then(|raw| {
            derive_position(
                raw,
                account_value,
                contexts,
                warning_threshold_pct,
                payments_per_year,
            )
        });
        match derived {
            Ok(Some(position)) => {
                positions.insert(position.coin.clone(), position);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Skipping position"),
        }
    }

    positions
}

/// Owns the derived position set and the asset context cache
pub struct PositionTracker {
    contexts: AssetContextCache,
    positions: RwLock<BTreeMap<String, PositionInfo>>,
    warning_threshold_pct: f64,
    payments_per_year: u32,
}

impl PositionTracker {
    pub fn new(warning_threshold_pct: f64, payments_per_year: u32) -> Self {
        Self {
            contexts: AssetContextCache::new(),
            positions: RwLock::new(BTreeMap::new()),
            warning_threshold_pct,
            payments_per_year,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.warning_threshold_pct, config.funding_payments_per_year)
    }

    /// Register the tracker's handlers on a not-yet-started stream.
    pub fn attach(self: &Arc<Self>, stream: &StreamClient) -> Result<()> {
        let tracker = Arc::clone(self);
        stream.subscribe(TOPIC_WEB_DATA, move |data| tracker.on_web_data(data))?;

        let tracker = Arc::clone(self);
        stream.subscribe(TOPIC_ACTIVE_ASSET_CTX, move |data| {
            tracker.on_asset_context(data)
        })?;

        stream.subscribe(TOPIC_USER_FUNDINGS, |data| {
            debug!(payload = %data, "Funding event");
            Ok(())
        })?;
        Ok(())
    }

    pub fn contexts(&self) -> &AssetContextCache {
        &self.contexts
    }

    /// `activeAssetCtx` handler
    pub fn on_asset_context(&self, data: &Value) -> Result<()> {
        let context = AssetContext::from_message(data)?;
        debug!(
            coin = %context.symbol,
            funding = context.periodic_funding_rate,
            mark = context.mark_price,
            "Asset context updated"
        );
        self.contexts.update(context);
        Ok(())
    }

    /// `webData2` handler
    pub fn on_web_data(&self, data: &Value) -> Result<()> {
        match AccountSnapshot::from_web_data(data)? {
            Some(snapshot) => {
                self.apply_snapshot(snapshot);
                Ok(())
            }
            None => {
                debug!("Account message without clearinghouse state");
                Ok(())
            }
        }
    }

    /// Replace the snapshot and rebuild every position from it.
    pub fn apply_snapshot(&self, snapshot: AccountSnapshot) {
        let positions = build_positions(
            &snapshot,
            &self.contexts,
            self.warning_threshold_pct,
            self.payments_per_year,
        );
        debug!(positions = positions.len(), "Positions rebuilt");

        *self.positions.write().unwrap_or_else(|p| p.into_inner()) = positions;
    }

    // ==================== Queries ====================

    pub fn positions(&self) -> BTreeMap<String, PositionInfo> {
        self.positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn position(&self, coin: &str) -> Option<PositionInfo> {
        self.positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(coin)
            .cloned()
    }

    /// Funding info for one coin, or for every position when `coin` is `None`
    pub fn funding_info(&self, coin: Option<&str>) -> BTreeMap<String, FundingInfo> {
        self.select(coin, |p| p.funding.clone())
    }

    /// Risk metrics for one coin, or for every position when `coin` is `None`
    pub fn risk_metrics(&self, coin: Option<&str>) -> BTreeMap<String, RiskMetrics> {
        self.select(coin, |p| p.risk.clone())
    }

    fn select<T>(
        &self,
        coin: Option<&str>,
        f: impl Fn(&PositionInfo) -> T,
    ) -> BTreeMap<String, T> {
        let positions = self.positions.read().unwrap_or_else(|p| p.into_inner());
        positions
            .iter()
            .filter(|(c, _)| coin.map_or(true, |wanted| wanted == c.as_str()))
            .map(|(c, p)| (c.clone(), f(p)))
            .collect()
    }

    pub fn funding_rate(&self, coin: &str) -> f64 {
        self.contexts.funding_rate(coin)
    }

    pub fn mark_price(&self, coin: &str) -> f64 {
        self.contexts.mark_price(coin)
    }

    pub fn near_liquidation(&self) -> Vec<PositionInfo> {
        self.positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|p| p.risk.is_near)
            .cloned()
            .collect()
    }

    /// Notional-weighted funding across all positions
    pub fn summary(&self) -> HedgeSummary {
        let positions = self.positions.read().unwrap_or_else(|p| p.into_inner());

        let total_position_usd: f64 = positions.values().map(|p| p.position_usd).sum();
        let total_notional_usd: f64 = positions.values().map(|p| p.notional_usd).sum();
        let denominator = if positions.is_empty() {
            1.0
        } else {
            total_notional_usd
        };

        let weighted = |f: fn(&PositionInfo) -> f64| {
            positions.values().map(|p| f(p) * p.notional_usd).sum::<f64>() / denominator
        };

        HedgeSummary {
            total_position_usd,
            total_notional_usd,
            weighted_funding_rate: weighted(|p| p.funding.current_rate),
            weighted_funding_apy: weighted(|p| p.funding.projected_apy),
            position_count: positions.len(),
        }
    }

    /// Any hedge position, or any lending reserve with a balance
    pub fn has_open_positions(&self, lending: Option<&LendingSummary>) -> bool {
        let hedged = !self
            .positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty();
        hedged || lending.map_or(false, LendingSummary::has_positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn snapshot(positions: Value) -> AccountSnapshot {
        serde_json::from_value(json!({
            "assetPositions": positions,
            "marginSummary": {"accountValue": "10000.0"},
            "withdrawable": "8000.0"
        }))
        .unwrap()
    }

    fn raw_position(coin: &str, szi: &str) -> Value {
        json!({
            "type": "oneWay",
            "position": {
                "coin": coin,
                "szi": szi,
                "entryPx": "3000.0",
                "positionValue": "6200.0",
                "unrealizedPnl": "200.0",
                "liquidationPx": "1500.0",
                "leverage": {"type": "cross", "value": 3},
                "maxLeverage": 20,
                "cumFunding": {"allTime": "12.5", "sinceOpen": "10.0", "sinceChange": "1.0"}
            }
        })
    }

    fn context(symbol: &str, rate: f64, mark: f64) -> AssetContext {
        AssetContext {
            symbol: symbol.to_string(),
            periodic_funding_rate: rate,
            mark_price: mark,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_long_position_scenario() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker.contexts().update(context("ETH", 0.0001, 3100.0));
        tracker.apply_snapshot(snapshot(json!([raw_position("ETH", "2.0")])));

        let eth = tracker.position("ETH").unwrap();
        assert_eq!(eth.funding.since_open, -10.0);
        assert_eq!(eth.notional_usd, 6000.0);
        assert_eq!(eth.risk.maintenance_margin, 0.025);
        assert_eq!(eth.mark_price, 3100.0);
        assert_eq!(eth.funding.current_rate, -0.0001);
        assert_eq!(eth.funding.projected_apy, -0.0001 * 8760.0);
        assert_eq!(eth.leverage, 3);
        assert_eq!(eth.max_leverage, 20);
        assert!(eth.is_long());
    }

    #[test]
    fn test_short_keeps_raw_funding_sign() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker.contexts().update(context("ETH", 0.0001, 3100.0));
        tracker.apply_snapshot(snapshot(json!([raw_position("ETH", "-2.0")])));

        let eth = tracker.position("ETH").unwrap();
        assert_eq!(eth.funding.current_rate, 0.0001);
        assert_eq!(eth.notional_usd, -6000.0);
        assert!(eth.is_short());
    }

    #[test]
    fn test_zero_size_positions_are_absent() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker.apply_snapshot(snapshot(json!([
            raw_position("ETH", "0.0"),
            raw_position("BTC", "-0.1")
        ])));

        let positions = tracker.positions();
        assert!(!positions.contains_key("ETH"));
        assert!(positions.contains_key("BTC"));
        assert!(positions.values().all(|p| p.signed_size != 0.0));
    }

    #[test]
    fn test_missing_context_defaults_to_zero_rate() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker.apply_snapshot(snapshot(json!([raw_position("ETH", "-1.0")])));

        let eth = tracker.position("ETH").unwrap();
        assert_eq!(eth.funding.current_rate, 0.0);
        assert_eq!(eth.mark_price, 0.0);
    }

    #[test]
    fn test_malformed_position_is_skipped() {
        let mut broken = raw_position("BTC", "0.5");
        broken["position"]
            .as_object_mut()
            .unwrap()
            .remove("entryPx");

        let tracker = PositionTracker::new(10.0, 8760);
        tracker.apply_snapshot(snapshot(json!([broken, raw_position("ETH", "-1.0")])));

        assert!(tracker.position("BTC").is_none());
        assert!(tracker.position("ETH").is_some());
    }

    #[test]
    fn test_mistyped_position_does_not_keep_stale_set() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker.apply_snapshot(snapshot(json!([raw_position("ETH", "-1.0")])));

        let mut broken = raw_position("SOL", "3.0");
        broken["position"]["coin"] = json!(7);
        let mut bad_funding = raw_position("ARB", "10.0");
        bad_funding["position"]["cumFunding"] = json!("none");

        tracker
            .on_web_data(&json!({"clearinghouseState": {
                "assetPositions": [raw_position("BTC", "0.5"), broken, bad_funding],
                "marginSummary": {"accountValue": "10000.0"}
            }}))
            .unwrap();

        let positions = tracker.positions();
        assert_eq!(positions.len(), 1);
        assert!(positions.contains_key("BTC"));
        assert!(tracker.position("ETH").is_none());
    }

    #[test]
    fn test_snapshot_replaces_previous_set() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker.apply_snapshot(snapshot(json!([raw_position("ETH", "-1.0")])));
        tracker.apply_snapshot(snapshot(json!([raw_position("BTC", "-1.0")])));

        let positions = tracker.positions();
        assert_eq!(positions.len(), 1);
        assert!(positions.contains_key("BTC"));
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let contexts = AssetContextCache::new();
        contexts.update(context("ETH", 0.00002, 3000.0));
        let snap = snapshot(json!([raw_position("ETH", "-1.0"), raw_position("BTC", "0.2")]));

        let first = build_positions(&snap, &contexts, 10.0, 8760);
        let second = build_positions(&snap, &contexts, 10.0, 8760);
        assert_eq!(first, second);
    }

    #[test]
    fn test_handlers_decode_wire_payloads() {
        let tracker = PositionTracker::new(10.0, 8760);
        tracker
            .on_asset_context(&json!({"coin": "ETH", "ctx": {"funding": "0.00001", "markPx": "3050"}}))
            .unwrap();
        tracker
            .on_web_data(&json!({"clearinghouseState": snapshot_value()}))
            .unwrap();

        assert_eq!(tracker.funding_rate("ETH"), 0.00001);
        assert_eq!(tracker.position("ETH").unwrap().funding.current_rate, 0.00001);
        assert_eq!(tracker.funding_info(Some("ETH")).len(), 1);
        assert_eq!(tracker.risk_metrics(None).len(), 1);
        assert!(tracker.funding_info(Some("SOL")).is_empty());
    }

    fn snapshot_value() -> Value {
        json!({
            "assetPositions": [raw_position("ETH", "-1.0")],
            "marginSummary": {"accountValue": "10000.0"}
        })
    }

    #[test]
    fn test_summary_weights_by_notional() {
        let tracker = PositionTracker::new(10.0, 8760);
        assert_eq!(tracker.summary(), HedgeSummary::default());
        assert!(!tracker.has_open_positions(None));

        tracker.contexts().update(context("ETH", 0.0001, 3000.0));
        tracker.apply_snapshot(snapshot(json!([raw_position("ETH", "-1.0")])));

        let summary = tracker.summary();
        assert_eq!(summary.position_count, 1);
        assert_eq!(summary.total_notional_usd, -3000.0);
        assert!((summary.weighted_funding_rate - 0.0001).abs() < 1e-15);
        assert!(tracker.has_open_positions(None));
    }

    #[test]
    fn test_near_liquidation_flags_thin_accounts() {
        let tracker = PositionTracker::new(10.0, 8760);
        // threshold = 0.025 * 6200 = 155; account value 160 => ~3.2% buffer
        let thin: AccountSnapshot = serde_json::from_value(json!({
            "assetPositions": [raw_position("ETH", "-2.0")],
            "marginSummary": {"accountValue": "160.0"}
        }))
        .unwrap();
        tracker.apply_snapshot(thin);

        let near = tracker.near_liquidation();
        assert_eq!(near.len(), 1);
        assert!(near[0].risk.buffer_percentage < 10.0);
    }
}
