//! Five-step entry sequence: swap, supply, borrow, bridge, hedge.
//!
//! Steps run strictly in order and nothing is rolled back. A failure after the first
//! step is reported as [`ExecutionError::PartialExecution`] and needs manual
//! reconciliation. The workflow keeps no record of earlier runs, so calling
//! [`ExecutionWorkflow::execute`] again after a partial failure starts over from the
//! swap.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, ExecutionConfig};
use crate::domain::{FilledOrder, TxReceipt};
use crate::error::{CarryError, ExecutionError, Result, StepFailure};
use crate::exchange::{HedgeExchange, LendingProtocol};

/// Quote asset amounts are settled with 6 decimals
const QUOTE_DECIMALS: u32 = 6;

/// Entry gate: projected return in percent against a minimum multiple (2.0 = 200%).
pub fn should_execute(simulated_apy_pct: f64, min_profitability: f64) -> bool {
    let threshold = min_profitability * 100.0;
    let execute = simulated_apy_pct > threshold;
    info!(
        simulated_apy_pct,
        threshold_pct = threshold,
        execute,
        "Profitability check"
    );
    execute
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionStep {
    SwapCollateral,
    SupplyCollateral,
    BorrowAsset,
    BridgeTransfer,
    OpenHedge,
}

impl ExecutionStep {
    pub const ALL: [ExecutionStep; 5] = [
        ExecutionStep::SwapCollateral,
        ExecutionStep::SupplyCollateral,
        ExecutionStep::BorrowAsset,
        ExecutionStep::BridgeTransfer,
        ExecutionStep::OpenHedge,
    ];

    /// 1-based position in the sequence
    pub fn ordinal(&self) -> u8 {
        match self {
            ExecutionStep::SwapCollateral => 1,
            ExecutionStep::SupplyCollateral => 2,
            ExecutionStep::BorrowAsset => 3,
            ExecutionStep::BridgeTransfer => 4,
            ExecutionStep::OpenHedge => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStep::SwapCollateral => "swap_collateral",
            ExecutionStep::SupplyCollateral => "supply_collateral",
            ExecutionStep::BorrowAsset => "borrow_asset",
            ExecutionStep::BridgeTransfer => "bridge_transfer",
            ExecutionStep::OpenHedge => "open_hedge",
        }
    }
}

impl fmt::Display for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bounded confirmation polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(
            config.bridge_max_retries,
            Duration::from_millis(config.bridge_poll_interval_ms),
        )
    }

    /// Run `probe` until it reports `true`. Probe errors count as a failed attempt.
    ///
    /// Returns the attempt that succeeded, or `Timeout` once the budget is spent.
    pub async fn poll<F, Fut>(&self, what: &str, mut probe: F) -> Result<u32>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for attempt in 1..=self.max_attempts {
            match probe(attempt).await {
                Ok(true) => return Ok(attempt),
                Ok(false) => {}
                Err(e) => warn!(what, attempt, error = %e, "Confirmation probe failed"),
            }

            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        Err(CarryError::Timeout(format!(
            "{} not confirmed after {} attempts",
            what, self.max_attempts
        )))
    }
}

/// Inputs for one run of the sequence
#[derive(Debug, Clone)]
pub struct WorkflowParams {
    pub base_asset: String,
    pub quote_asset: String,
    pub hedge_symbol: String,
    /// Hedge account polled for the bridged deposit
    pub wallet_address: String,
    pub deposit_address: String,
    pub swap_fraction: Decimal,
    pub swap_min_out_ratio: Decimal,
    pub borrow_fraction_of_ltv: Decimal,
    pub slippage: Decimal,
}

impl WorkflowParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_asset: config.lending.base_asset.clone(),
            quote_asset: config.lending.quote_asset.clone(),
            hedge_symbol: config.hedge.symbol.clone(),
            wallet_address: config.stream.wallet_address.clone(),
            deposit_address: config.hedge.deposit_address.clone(),
            swap_fraction: config.strategy.swap_fraction,
            swap_min_out_ratio: config.strategy.swap_min_out_ratio,
            borrow_fraction_of_ltv: config.strategy.borrow_fraction_of_ltv,
            slippage: config.hedge.slippage,
        }
    }
}

/// What a completed run did
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub quote_swapped: Decimal,
    pub base_supplied: Decimal,
    pub quote_borrowed: Decimal,
    pub bridge_confirmed_after: u32,
    pub hedge_size: Decimal,
    pub fills: Vec<FilledOrder>,
    pub completed: Vec<ExecutionStep>,
}

pub struct ExecutionWorkflow {
    lending: Arc<dyn LendingProtocol>,
    hedge: Arc<dyn HedgeExchange>,
    params: WorkflowParams,
    bridge_retry: RetryPolicy,
}

fn confirm(receipt: TxReceipt, what: &str) -> Result<TxReceipt> {
    if receipt.success {
        info!(tx_hash = %receipt.tx_hash, what, "Transaction confirmed");
        Ok(receipt)
    } else {
        Err(CarryError::Transaction(format!(
            "{} reverted (tx {})",
            what, receipt.tx_hash
        )))
    }
}

fn to_decimal(value: f64, what: &str) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(CarryError::Validation(format!(
            "{} is not a finite number: {}",
            what, value
        )));
    }
    value
        .to_string()
        .parse::<Decimal>()
        .map_err(|e| CarryError::Validation(format!("{} {}: {}", what, value, e)))
}

impl ExecutionWorkflow {
    pub fn new(
        lending: Arc<dyn LendingProtocol>,
        hedge: Arc<dyn HedgeExchange>,
        params: WorkflowParams,
        bridge_retry: RetryPolicy,
    ) -> Self {
        Self {
            lending,
            hedge,
            params,
            bridge_retry,
        }
    }

    pub fn params(&self) -> &WorkflowParams {
        &self.params
    }

    /// Run the full sequence. The caller is expected to have passed [`should_execute`].
    pub async fn execute(&self) -> std::result::Result<ExecutionReport, ExecutionError> {
        let run_id = Uuid::new_v4();
        let p = &self.params;

        let idle = self
            .lending
            .wallet_balance(&p.quote_asset)
            .await
            .map_err(|e| ExecutionError::Precondition(format!("wallet balance: {}", e)))?;
        if idle <= Decimal::ZERO {
            return Err(ExecutionError::Precondition(format!(
                "no idle {} balance",
                p.quote_asset
            )));
        }

        let price = self
            .lending
            .oracle_price(&p.base_asset)
            .await
            .map_err(|e| ExecutionError::Precondition(format!("oracle price: {}", e)))?;
        if price <= Decimal::ZERO {
            return Err(ExecutionError::Precondition(format!(
                "invalid {} oracle price {}",
                p.base_asset, price
            )));
        }

        info!(%run_id, idle = %idle, price = %price, "Starting entry sequence");
        let mut completed = Vec::with_capacity(ExecutionStep::ALL.len());

        let quote_swapped = (idle * p.swap_fraction)
            .round_dp_with_strategy(QUOTE_DECIMALS, RoundingStrategy::ToZero);
        let base_amount = self
            .run_step(
                run_id,
                &mut completed,
                ExecutionStep::SwapCollateral,
                self.swap_collateral(quote_swapped, price),
            )
            .await?;

        self.run_step(
            run_id,
            &mut completed,
            ExecutionStep::SupplyCollateral,
            self.supply_collateral(base_amount),
        )
        .await?;

        let quote_borrowed = self
            .run_step(
                run_id,
                &mut completed,
                ExecutionStep::BorrowAsset,
                self.borrow(base_amount, price),
            )
            .await?;

        let bridge_confirmed_after = self
            .run_step(
                run_id,
                &mut completed,
                ExecutionStep::BridgeTransfer,
                self.bridge(quote_borrowed),
            )
            .await?;

        let (hedge_size, fills) = self
            .run_step(
                run_id,
                &mut completed,
                ExecutionStep::OpenHedge,
                self.open_hedge(base_amount),
            )
            .await?;

        info!(%run_id, "Entry sequence complete");
        Ok(ExecutionReport {
            run_id,
            quote_swapped,
            base_supplied: base_amount,
            quote_borrowed,
            bridge_confirmed_after,
            hedge_size,
            fills,
            completed,
        })
    }

    async fn run_step<T, F>(
        &self,
        run_id: Uuid,
        completed: &mut Vec<ExecutionStep>,
        step: ExecutionStep,
        action: F,
    ) -> std::result::Result<T, ExecutionError>
    where
        F: Future<Output = Result<T>>,
    {
        info!(%run_id, %step, ordinal = step.ordinal(), "Executing step");

        match action.await {
            Ok(value) => {
                completed.push(step);
                Ok(value)
            }
            Err(e) => {
                let failure = StepFailure::new(step, e);
                let err = if completed.is_empty() {
                    ExecutionError::Step(failure)
                } else {
                    ExecutionError::PartialExecution {
                        completed: completed.clone(),
                        failure,
                    }
                };
                error!(%run_id, %step, error = %err, "Entry sequence aborted");
                Err(err)
            }
        }
    }

    /// Step 1: returns the base amount received
    async fn swap_collateral(&self, quote_amount: Decimal, price: Decimal) -> Result<Decimal> {
        let p = &self.params;
        let min_out = quote_amount / price * p.swap_min_out_ratio;

        info!(
            amount = %quote_amount,
            min_out = %min_out,
            from = %p.quote_asset,
            to = %p.base_asset,
            "Swapping"
        );
        let receipt = self
            .lending
            .swap(&p.quote_asset, &p.base_asset, quote_amount, min_out)
            .await?;
        let receipt = confirm(receipt, "swap")?;

        let received = receipt.amount_out.unwrap_or(min_out);
        if received < min_out {
            return Err(CarryError::Transaction(format!(
                "swap returned {} below minimum {}",
                received, min_out
            )));
        }
        Ok(received)
    }

    /// Step 2
    async fn supply_collateral(&self, amount: Decimal) -> Result<()> {
        let p = &self.params;
        info!(amount = %amount, asset = %p.base_asset, "Supplying collateral");
        let receipt = self
            .lending
            .supply(&p.base_asset, amount, None, false)
            .await?;
        confirm(receipt, "supply")?;
        Ok(())
    }

    /// Step 3: `supplied USD * LTV * borrow fraction`, using fresh reserve data
    async fn borrow(&self, supplied: Decimal, price: Decimal) -> Result<Decimal> {
        let p = &self.params;
        let reserve = self.lending.get_reserve_data(&p.base_asset).await?;
        let ltv = to_decimal(reserve.ltv, "ltv")?;

        let amount = (supplied * price * ltv * p.borrow_fraction_of_ltv)
            .round_dp_with_strategy(QUOTE_DECIMALS, RoundingStrategy::ToZero);
        if amount <= Decimal::ZERO {
            return Err(CarryError::Validation(format!(
                "borrow amount {} is not positive (ltv {})",
                amount, reserve.ltv
            )));
        }

        info!(amount = %amount, asset = %p.quote_asset, ltv = reserve.ltv, "Borrowing");
        let receipt = self.lending.borrow_asset(&p.quote_asset, amount).await?;
        confirm(receipt, "borrow")?;
        Ok(amount)
    }

    /// Step 4: transfer, then poll the hedge account until the margin shows up
    async fn bridge(&self, amount: Decimal) -> Result<u32> {
        let p = &self.params;
        info!(amount = %amount, to = %p.deposit_address, "Bridging to hedge venue");
        let receipt = self
            .lending
            .transfer(&p.quote_asset, &p.deposit_address, amount)
            .await?;
        confirm(receipt, "bridge transfer")?;

        let target = amount.to_f64().unwrap_or(f64::MAX);
        let hedge = Arc::clone(&self.hedge);
        let wallet = p.wallet_address.clone();

        self.bridge_retry
            .poll("bridge deposit", |attempt| {
                let hedge = Arc::clone(&hedge);
                let wallet = wallet.clone();
                async move {
                    let available = hedge.user_state(&wallet).await?.available_margin();
                    info!(attempt, available, target, "Waiting for bridged margin");
                    Ok::<bool, CarryError>(available >= target)
                }
            })
            .await
    }

    /// Step 5: short the supplied amount, rounded to the venue's size precision
    async fn open_hedge(&self, base_amount: Decimal) -> Result<(Decimal, Vec<FilledOrder>)> {
        let p = &self.params;
        let meta = self.hedge.meta().await?;
        let decimals = meta
            .size_decimals(&p.hedge_symbol)
            .ok_or_else(|| CarryError::DataUnavailable {
                coin: p.hedge_symbol.clone(),
                field: "szDecimals".to_string(),
            })?;

        let size = base_amount.round_dp(decimals);
        if size <= Decimal::ZERO {
            return Err(CarryError::Validation(format!(
                "hedge size {} rounds to zero at {} decimals",
                base_amount, decimals
            )));
        }

        info!(symbol = %p.hedge_symbol, size = %size, slippage = %p.slippage, "Opening short hedge");
        let result = self
            .hedge
            .market_open(&p.hedge_symbol, false, size, p.slippage)
            .await?;

        let fills = result.fills()?;
        for fill in &fills {
            info!(
                oid = fill.oid,
                size = ?fill.total_sz,
                price = ?fill.avg_px,
                "Hedge order filled"
            );
        }
        Ok((size, fills))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::paper_lending::PaperLending;
    use crate::config::LendingConfig;
    use crate::domain::{AccountSnapshot, ExchangeMeta, OrderResult};
    use crate::exchange::MockHedgeExchange;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn lending_config() -> LendingConfig {
        LendingConfig {
            base_asset: "WETH".to_string(),
            quote_asset: "USDC".to_string(),
            paper_quote_balance: dec!(1000),
            paper_base_price: dec!(2000),
            paper_base_ltv: 0.8,
            paper_supply_rate: 0.02,
            paper_borrow_rate: 0.05,
        }
    }

    fn params() -> WorkflowParams {
        WorkflowParams {
            base_asset: "WETH".to_string(),
            quote_asset: "USDC".to_string(),
            hedge_symbol: "ETH".to_string(),
            wallet_address: "0xabc".to_string(),
            deposit_address: "0xbridge".to_string(),
            swap_fraction: dec!(0.1),
            swap_min_out_ratio: dec!(0.995),
            borrow_fraction_of_ltv: dec!(0.5),
            slippage: dec!(0.01),
        }
    }

    fn account_with_margin(margin: &str) -> AccountSnapshot {
        serde_json::from_value(json!({
            "assetPositions": [],
            "marginSummary": {"accountValue": margin},
            "withdrawable": margin
        }))
        .unwrap()
    }

    fn meta() -> ExchangeMeta {
        serde_json::from_value(json!({"universe": [{"name": "ETH", "szDecimals": 4}]})).unwrap()
    }

    fn filled() -> OrderResult {
        serde_json::from_value(json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"filled": {"totalSz": "0.0498", "avgPx": "2000.0", "oid": 42}}
            ]}}
        }))
        .unwrap()
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_should_execute_threshold() {
        assert!(!should_execute(150.0, 2.0));
        assert!(should_execute(250.0, 2.0));
        assert!(!should_execute(200.0, 2.0));
    }

    #[test]
    fn test_step_order() {
        let ordinals: Vec<u8> = ExecutionStep::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);
        assert_eq!(ExecutionStep::BridgeTransfer.to_string(), "bridge_transfer");
    }

    #[tokio::test]
    async fn test_retry_policy_times_out() {
        let policy = fast_retry(3);
        let mut calls = 0;
        let result = policy
            .poll("probe", |_| {
                calls += 1;
                async { Ok::<bool, CarryError>(false) }
            })
            .await;
        assert!(matches!(result, Err(CarryError::Timeout(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_full_sequence_succeeds() {
        let lending = Arc::new(PaperLending::from_config(&lending_config()));
        let mut hedge = MockHedgeExchange::new();
        hedge
            .expect_user_state()
            .returning(|_| Ok(account_with_margin("100.0")));
        hedge.expect_meta().times(1).returning(|| Ok(meta()));
        hedge
            .expect_market_open()
            .withf(|symbol, is_buy, size, _| {
                symbol.to_string() == "ETH" && !*is_buy && *size == dec!(0.05)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(filled()));

        let workflow =
            ExecutionWorkflow::new(lending.clone(), Arc::new(hedge), params(), fast_retry(3));
        let report = workflow.execute().await.unwrap();

        // 100 USDC at 2000 => 0.05 WETH, borrow 0.05 * 2000 * 0.8 * 0.5 = 40
        assert_eq!(report.quote_swapped, dec!(100));
        assert_eq!(report.base_supplied, dec!(0.05));
        assert_eq!(report.quote_borrowed, dec!(40));
        assert_eq!(report.hedge_size, dec!(0.05));
        assert_eq!(report.completed, ExecutionStep::ALL.to_vec());
        assert_eq!(report.fills[0].oid, 42);
    }

    #[tokio::test]
    async fn test_bridge_exhaustion_fails_step_four() {
        let lending = Arc::new(PaperLending::from_config(&lending_config()));
        let mut hedge = MockHedgeExchange::new();
        hedge
            .expect_user_state()
            .times(3)
            .returning(|_| Ok(account_with_margin("0.0")));
        hedge.expect_meta().times(0);
        hedge.expect_market_open().times(0);

        let workflow = ExecutionWorkflow::new(lending, Arc::new(hedge), params(), fast_retry(3));
        let err = workflow.execute().await.unwrap_err();

        assert_eq!(err.failed_step(), Some(ExecutionStep::BridgeTransfer));
        match err {
            ExecutionError::PartialExecution { completed, .. } => assert_eq!(
                completed,
                vec![
                    ExecutionStep::SwapCollateral,
                    ExecutionStep::SupplyCollateral,
                    ExecutionStep::BorrowAsset
                ]
            ),
            other => panic!("expected partial execution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frozen_reserve_is_partial_at_borrow() {
        let lending = Arc::new(PaperLending::from_config(&lending_config()));
        lending.set_borrowing_enabled("USDC", false);
        let mut hedge = MockHedgeExchange::new();
        hedge.expect_user_state().times(0);

        let workflow = ExecutionWorkflow::new(lending, Arc::new(hedge), params(), fast_retry(3));
        let err = workflow.execute().await.unwrap_err();

        assert!(err.has_side_effects());
        assert_eq!(err.failed_step(), Some(ExecutionStep::BorrowAsset));
    }

    #[tokio::test]
    async fn test_empty_wallet_is_precondition() {
        let mut config = lending_config();
        config.paper_quote_balance = dec!(0);
        let lending = Arc::new(PaperLending::from_config(&config));
        let hedge = MockHedgeExchange::new();

        let workflow = ExecutionWorkflow::new(lending, Arc::new(hedge), params(), fast_retry(3));
        let err = workflow.execute().await.unwrap_err();

        assert!(matches!(err, ExecutionError::Precondition(_)));
        assert!(!err.has_side_effects());
    }

    #[tokio::test]
    async fn test_rejected_order_fails_step_five() {
        let lending = Arc::new(PaperLending::from_config(&lending_config()));
        let mut hedge = MockHedgeExchange::new();
        hedge
            .expect_user_state()
            .returning(|_| Ok(account_with_margin("1000.0")));
        hedge.expect_meta().returning(|| Ok(meta()));
        hedge.expect_market_open().times(1).returning(|_, _, _, _| {
            Ok(serde_json::from_value(json!({
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [{"error": "Insufficient margin"}]}}
            }))
            .unwrap())
        });

        let workflow = ExecutionWorkflow::new(lending, Arc::new(hedge), params(), fast_retry(3));
        let err = workflow.execute().await.unwrap_err();
        assert_eq!(err.failed_step(), Some(ExecutionStep::OpenHedge));
        assert!(err.to_string().contains("Insufficient margin"));
    }
}
