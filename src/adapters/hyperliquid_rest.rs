use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::{
    number_from_value, AccountSnapshot, AssetContext, ExchangeAck, ExchangeMeta, OrderResult,
    RawAssetCtx,
};
use crate::error::{CarryError, Result};
use crate::exchange::{unsupported, HedgeExchange};

const VENUE: &str = "hyperliquid";

/// Simulated side effects while in dry-run mode
#[derive(Debug, Default)]
struct DryRunLedger {
    bridged: Decimal,
    next_oid: u64,
}

/// Hedge venue client over the public `/info` endpoint.
///
/// Reads are always live. Order placement and bridge withdrawals require a signing
/// key and are only simulated (`dry_run = true`); live mode rejects them.
pub struct HyperliquidRest {
    http: Client,
    base_url: String,
    dry_run: bool,
    ledger: Mutex<DryRunLedger>,
}

impl HyperliquidRest {
    pub fn new(base_url: &str, dry_run: bool) -> Result<Self> {
        let http = Client::builder()
            .user_agent("deltacarry/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CarryError::Internal(format!("failed to build HTTP client: {}", e)))?;

        info!("Created Hyperliquid REST client (dry_run={})", dry_run);

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            dry_run,
            ledger: Mutex::new(DryRunLedger {
                bridged: Decimal::ZERO,
                next_oid: 1,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Credit a simulated bridge deposit; visible in `user_state` while dry-running.
    pub fn credit_bridge_deposit(&self, amount: Decimal) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        ledger.bridged += amount;
        info!(amount = %amount, total = %ledger.bridged, "DRY RUN: bridge deposit credited");
    }

    fn simulated_bridged(&self) -> Decimal {
        self.ledger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .bridged
    }

    async fn post_info<T: DeserializeOwned>(&self, body: Value) -> Result<T> {
        let url = format!("{}/info", self.base_url);
        debug!(%url, request = %body, "Info request");

        let resp = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(CarryError::Connection(format!(
                "info request {} failed: status={} body={}",
                body, status, text
            )));
        }

        serde_json::from_str(&text).map_err(|e| CarryError::MessageDecode {
            topic: body
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_string(),
            reason: e.to_string(),
        })
    }

    /// Mid prices for every listed coin
    pub async fn all_mids(&self) -> Result<HashMap<String, f64>> {
        let raw: HashMap<String, Value> = self.post_info(json!({"type": "allMids"})).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(coin, px)| number_from_value(&px).map(|px| (coin, px)))
            .collect())
    }

    /// Funding rate and mark price for every listed coin, from `metaAndAssetCtxs`.
    ///
    /// Coins whose context lacks either number are left out.
    pub async fn asset_contexts(&self) -> Result<HashMap<String, AssetContext>> {
        let (meta, contexts): (ExchangeMeta, Vec<RawAssetCtx>) = self
            .post_info(json!({"type": "metaAndAssetCtxs"}))
            .await?;

        let received_at = Utc::now();
        Ok(meta
            .universe
            .into_iter()
            .zip(contexts)
            .filter_map(|(asset, ctx)| {
                Some((
                    asset.name.clone(),
                    AssetContext {
                        symbol: asset.name,
                        periodic_funding_rate: ctx.funding?,
                        mark_price: ctx.mark_px?,
                        received_at,
                    },
                ))
            })
            .collect())
    }
}

#[async_trait]
impl HedgeExchange for HyperliquidRest {
    fn name(&self) -> &str {
        VENUE
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn user_state(&self, address: &str) -> Result<AccountSnapshot> {
        let mut snapshot: AccountSnapshot = self
            .post_info(json!({"type": "clearinghouseState", "user": address}))
            .await?;

        if self.dry_run {
            let bridged = self.simulated_bridged().to_f64().unwrap_or(0.0);
            if bridged > 0.0 {
                snapshot.withdrawable = Some(snapshot.withdrawable.unwrap_or(0.0) + bridged);
                let summary = snapshot.margin_summary.get_or_insert_with(Default::default);
                summary.account_value = Some(summary.account_value.unwrap_or(0.0) + bridged);
            }
        }
        Ok(snapshot)
    }

    async fn meta(&self) -> Result<ExchangeMeta> {
        self.post_info(json!({"type": "meta"})).await
    }

    async fn market_open(
        &self,
        symbol: &str,
        is_buy: bool,
        size: Decimal,
        slippage: Decimal,
    ) -> Result<OrderResult> {
        if !self.dry_run {
            return Err(unsupported("market_open", VENUE));
        }

        let mid = self
            .all_mids()
            .await?
            .get(symbol)
            .copied()
            .ok_or_else(|| CarryError::MarketDataUnavailable(format!("no mid for {}", symbol)))?;
        let mid = Decimal::from_f64(mid).unwrap_or_default();

        let oid = {
            let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
            let oid = ledger.next_oid;
            ledger.next_oid += 1;
            oid
        };

        info!(
            "DRY RUN: Would {} {} {} at market (mid {}, slippage {})",
            if is_buy { "buy" } else { "sell" },
            size,
            symbol,
            mid,
            slippage
        );

        let response = json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"filled": {"totalSz": size.to_string(), "avgPx": mid.to_string(), "oid": oid}}
            ]}}
        });
        Ok(serde_json::from_value(response)?)
    }

    async fn withdraw_from_bridge(&self, amount: Decimal, address: &str) -> Result<ExchangeAck> {
        if !self.dry_run {
            return Err(unsupported("withdraw_from_bridge", VENUE));
        }

        let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        if amount > ledger.bridged {
            return Err(CarryError::Validation(format!(
                "withdrawal {} exceeds simulated balance {}",
                amount, ledger.bridged
            )));
        }
        ledger.bridged -= amount;
        info!("DRY RUN: Would withdraw {} to {}", amount, address);

        Ok(ExchangeAck {
            status: "ok".to_string(),
            response: Some(json!({"type": "default"})),
        })
    }
}
