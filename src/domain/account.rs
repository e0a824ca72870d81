//! Venue-reported account state and hedge-exchange response shapes.
//!
//! Every numeric field is optional and every `assetPositions` entry decodes on its
//! own, so a single malformed position is skipped by the tracker without discarding
//! the rest of the snapshot.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::market::lenient_f64;
use crate::error::{CarryError, Result};

/// Full account snapshot (`clearinghouseState`). Replaces the previous one wholesale.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    #[serde(default, deserialize_with = "lenient_entries")]
    pub asset_positions: Vec<AssetPositionEntry>,
    #[serde(default, deserialize_with = "lenient_struct")]
    pub margin_summary: Option<MarginSummary>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub withdrawable: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AssetPositionEntry {
    #[serde(default)]
    pub position: Option<RawPosition>,
    /// Decode error for an entry whose shape did not match
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl AssetPositionEntry {
    fn rejected(reason: String) -> Self {
        Self {
            position: None,
            malformed: Some(reason),
        }
    }
}

/// Decode each entry separately; a bad entry is kept as a rejected placeholder.
fn lenient_entries<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<AssetPositionEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(values)) => values,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Ok(vec![AssetPositionEntry::rejected(format!(
                "assetPositions is not an array: {}",
                other
            ))])
        }
    };

    Ok(values
        .into_iter()
        .map(|value| {
            serde_json::from_value(value)
                .unwrap_or_else(|e| AssetPositionEntry::rejected(e.to_string()))
        })
        .collect())
}

/// `None` when the value is absent or has the wrong shape
fn lenient_struct<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    #[serde(default)]
    pub coin: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub szi: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub entry_px: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub position_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub unrealized_pnl: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub liquidation_px: Option<f64>,
    #[serde(default)]
    pub leverage: Option<RawLeverage>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub max_leverage: Option<f64>,
    #[serde(default)]
    pub cum_funding: Option<RawCumFunding>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawLeverage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCumFunding {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub all_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub since_open: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub since_change: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginSummary {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub account_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_ntl_pos: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_raw_usd: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_margin_used: Option<f64>,
}

impl AccountSnapshot {
    pub fn account_value(&self) -> Option<f64> {
        self.margin_summary.as_ref().and_then(|m| m.account_value)
    }

    /// Margin the exchange reports as available: `withdrawable` when present,
    /// otherwise the account value.
    pub fn available_margin(&self) -> f64 {
        self.withdrawable
            .or_else(|| self.account_value())
            .unwrap_or(0.0)
    }

    /// Every entry in order. Entries that failed to decode or carry no position
    /// come back as errors so callers can skip them individually.
    pub fn positions(&self) -> impl Iterator<Item = Result<&RawPosition>> {
        self.asset_positions.iter().map(|entry| match (&entry.position, &entry.malformed) {
            (Some(position), None) => Ok(position),
            (_, Some(reason)) => Err(CarryError::MessageDecode {
                topic: "webData2".to_string(),
                reason: reason.clone(),
            }),
            (None, None) => Err(CarryError::DataUnavailable {
                coin: "<unknown>".to_string(),
                field: "position".to_string(),
            }),
        })
    }

    /// Extract the snapshot from a `webData2` payload.
    ///
    /// Returns `Ok(None)` when the payload carries no clearinghouse state.
    pub fn from_web_data(data: &Value) -> Result<Option<Self>> {
        let Some(state) = data.get("clearinghouseState") else {
            return Ok(None);
        };
        serde_json::from_value(state.clone())
            .map(Some)
            .map_err(|e| CarryError::MessageDecode {
                topic: "webData2".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Exchange metadata (`meta` info request)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExchangeMeta {
    #[serde(default)]
    pub universe: Vec<AssetMeta>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub name: String,
    pub sz_decimals: u32,
    #[serde(default)]
    pub max_leverage: Option<u32>,
}

impl ExchangeMeta {
    pub fn size_decimals(&self, symbol: &str) -> Option<u32> {
        self.universe
            .iter()
            .find(|a| a.name == symbol)
            .map(|a| a.sz_decimals)
    }

    pub fn size_decimals_by_symbol(&self) -> HashMap<String, u32> {
        self.universe
            .iter()
            .map(|a| (a.name.clone(), a.sz_decimals))
            .collect()
    }
}

/// Order placement response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderResult {
    pub status: String,
    #[serde(default)]
    pub response: Option<OrderResponseBody>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderResponseBody {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<OrderStatuses>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrderStatuses {
    #[serde(default)]
    pub statuses: Vec<OrderStatusEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrderStatusEntry {
    #[serde(default)]
    pub filled: Option<FilledOrder>,
    #[serde(default)]
    pub resting: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledOrder {
    pub oid: u64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_sz: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avg_px: Option<f64>,
}

impl OrderResult {
    /// Fills reported for the order; any per-order error rejects the whole result.
    pub fn fills(&self) -> Result<Vec<FilledOrder>> {
        if self.status != "ok" {
            return Err(CarryError::OrderRejected(format!("status {}", self.status)));
        }

        let statuses = self
            .response
            .as_ref()
            .and_then(|r| r.data.as_ref())
            .map(|d| d.statuses.as_slice())
            .unwrap_or_default();

        let mut fills = Vec::with_capacity(statuses.len());
        for status in statuses {
            match (&status.filled, &status.error) {
                (Some(filled), _) => fills.push(filled.clone()),
                (None, Some(error)) => return Err(CarryError::OrderRejected(error.clone())),
                (None, None) => {
                    return Err(CarryError::OrderRejected(
                        "order resting, not filled".to_string(),
                    ))
                }
            }
        }

        if fills.is_empty() {
            return Err(CarryError::OrderRejected("no order statuses returned".to_string()));
        }
        Ok(fills)
    }
}

/// Generic acknowledgement for exchange actions such as bridge withdrawals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeAck {
    pub status: String,
    #[serde(default)]
    pub response: Option<Value>,
}

impl ExchangeAck {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn web_data() -> Value {
        json!({
            "clearinghouseState": {
                "assetPositions": [{
                    "type": "oneWay",
                    "position": {
                        "coin": "ETH",
                        "szi": "-0.5",
                        "entryPx": "3000.0",
                        "positionValue": "1550.0",
                        "unrealizedPnl": "-50.0",
                        "liquidationPx": null,
                        "leverage": {"type": "cross", "value": 5},
                        "maxLeverage": 25,
                        "cumFunding": {"allTime": "1.5", "sinceOpen": "-2.0", "sinceChange": "0.1"}
                    }
                }],
                "marginSummary": {"accountValue": "1200.0", "totalNtlPos": "1550.0"},
                "withdrawable": "900.0"
            },
            "serverTime": 1
        })
    }

    #[test]
    fn test_decode_web_data_snapshot() {
        let snapshot = AccountSnapshot::from_web_data(&web_data()).unwrap().unwrap();
        let pos = snapshot.positions().next().unwrap().unwrap();
        assert_eq!(pos.coin.as_deref(), Some("ETH"));
        assert_eq!(pos.szi, Some(-0.5));
        assert_eq!(pos.max_leverage, Some(25.0));
        assert_eq!(pos.liquidation_px, None);
        assert_eq!(pos.leverage.as_ref().and_then(|l| l.value), Some(5.0));
        assert_eq!(snapshot.account_value(), Some(1200.0));
        assert_eq!(snapshot.available_margin(), 900.0);
    }

    #[test]
    fn test_mistyped_entry_does_not_sink_the_snapshot() {
        let mut data = web_data();
        let entries = data["clearinghouseState"]["assetPositions"]
            .as_array_mut()
            .unwrap();
        entries.push(json!({"type": "oneWay", "position": {"coin": 7, "szi": "1.0"}}));
        entries.push(json!({"type": "oneWay", "position": {"coin": "SOL", "leverage": "high"}}));
        data["clearinghouseState"]["marginSummary"] = json!("n/a");

        let snapshot = AccountSnapshot::from_web_data(&data).unwrap().unwrap();
        let decoded: Vec<_> = snapshot.positions().collect();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_ref().unwrap().coin.as_deref(), Some("ETH"));
        assert!(matches!(decoded[1], Err(CarryError::MessageDecode { .. })));
        assert!(decoded[2].is_err());
        assert_eq!(snapshot.account_value(), None);
        assert_eq!(snapshot.available_margin(), 900.0);
    }

    #[test]
    fn test_web_data_without_clearinghouse_is_ignored() {
        assert!(AccountSnapshot::from_web_data(&json!({"serverTime": 1}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_available_margin_falls_back_to_account_value() {
        let snapshot: AccountSnapshot = serde_json::from_value(json!({
            "assetPositions": [],
            "marginSummary": {"accountValue": "250.5"}
        }))
        .unwrap();
        assert_eq!(snapshot.available_margin(), 250.5);
    }

    #[test]
    fn test_order_result_fills_and_errors() {
        let ok: OrderResult = serde_json::from_value(json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"filled": {"totalSz": "0.02", "avgPx": "1891.4", "oid": 77738308}}
            ]}}
        }))
        .unwrap();
        let fills = ok.fills().unwrap();
        assert_eq!(fills[0].oid, 77738308);
        assert_eq!(fills[0].total_sz, Some(0.02));

        let rejected: OrderResult = serde_json::from_value(json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"error": "Insufficient margin to place order."}
            ]}}
        }))
        .unwrap();
        assert!(matches!(rejected.fills(), Err(CarryError::OrderRejected(msg)) if msg.contains("Insufficient")));
    }

    #[test]
    fn test_meta_size_decimals() {
        let meta: ExchangeMeta = serde_json::from_value(json!({
            "universe": [{"name": "BTC", "szDecimals": 5}, {"name": "ETH", "szDecimals": 4, "maxLeverage": 25}]
        }))
        .unwrap();
        assert_eq!(meta.size_decimals("ETH"), Some(4));
        assert_eq!(meta.size_decimals("SOL"), None);
        assert_eq!(meta.size_decimals_by_symbol().len(), 2);
    }
}
