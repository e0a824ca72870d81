use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CarryError, Result};

/// Parse a venue number that may arrive as a JSON string or a JSON number.
pub fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Lenient numeric field: anything unparseable becomes `None` instead of failing the
/// whole message, so one bad position never poisons a snapshot.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

/// Latest funding rate and mark price for one symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetContext {
    pub symbol: String,
    /// Funding rate per payment period (hourly)
    pub periodic_funding_rate: f64,
    pub mark_price: f64,
    pub received_at: DateTime<Utc>,
}

/// `activeAssetCtx` payload: `{"coin": "ETH", "ctx": {"funding": "...", "markPx": "..."}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveAssetCtxMessage {
    pub coin: String,
    pub ctx: RawAssetCtx,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAssetCtx {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub funding: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub mark_px: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open_interest: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub oracle_px: Option<f64>,
}

impl AssetContext {
    /// Decode an `activeAssetCtx` payload.
    pub fn from_message(data: &Value) -> Result<Self> {
        let msg: ActiveAssetCtxMessage =
            serde_json::from_value(data.clone()).map_err(|e| CarryError::MessageDecode {
                topic: "activeAssetCtx".to_string(),
                reason: e.to_string(),
            })?;

        let missing = |field: &str| CarryError::MessageDecode {
            topic: "activeAssetCtx".to_string(),
            reason: format!("{} missing {}", msg.coin, field),
        };

        Ok(Self {
            periodic_funding_rate: msg.ctx.funding.ok_or_else(|| missing("funding"))?,
            mark_price: msg.ctx.mark_px.ok_or_else(|| missing("markPx"))?,
            symbol: msg.coin,
            received_at: Utc::now(),
        })
    }
}
