//! Coordinator: owns the stream client, the position tracker and both venue handles.
//!
//! `initialize()` connects the stream and probes the lending venue, flipping one
//! readiness signal each. The `run()` loop uses `tokio::select!` to:
//!   - Refresh lending data on a fixed cadence and hand a dashboard to the display
//!   - Warn about positions close to liquidation
//!   - Recover from a failed refresh by forcing a stream reconnect
//!   - Stop the stream on shutdown

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::adapters::StreamClient;
use crate::config::AppConfig;
use crate::domain::{Fallback, LendingSummary};
use crate::error::{CarryError, Result};
use crate::exchange::{HedgeExchange, LendingProtocol};
use crate::strategy::{global_return, ExecutionWorkflow, PositionTracker, RetryPolicy, WorkflowParams};

use super::display::{Dashboard, DisplaySink};

/// One-shot readiness flag; clones observe the same flag.
#[derive(Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspend until set. No timeout.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What the coordinator needs to know about the carry it watches
#[derive(Debug, Clone)]
pub struct CoordinatorParams {
    pub refresh_interval: Duration,
    pub wallet_address: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub hedge_symbol: String,
}

impl CoordinatorParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            refresh_interval: Duration::from_millis(config.coordinator.refresh_interval_ms),
            wallet_address: config.stream.wallet_address.clone(),
            base_asset: config.lending.base_asset.clone(),
            quote_asset: config.lending.quote_asset.clone(),
            hedge_symbol: config.hedge.symbol.clone(),
        }
    }
}

/// Oracle price, or the last good one flagged as degraded
pub fn resolve_base_price(
    symbol: &str,
    oracle: Result<f64>,
    last_good: Option<f64>,
) -> Fallback<f64> {
    let fallback = last_good.unwrap_or(0.0);
    match oracle {
        Ok(price) if price.is_finite() && price > 0.0 => Fallback::fresh(price),
        Ok(price) => {
            warn!(%symbol, price, fallback, "Oracle returned unusable price");
            Fallback::degraded(fallback, format!("{symbol}: bad oracle price {price}"))
        }
        Err(e) => Fallback::from_result(Err(e), fallback, symbol),
    }
}

pub struct Coordinator {
    params: CoordinatorParams,
    stream: StreamClient,
    tracker: Arc<PositionTracker>,
    lending: Arc<dyn LendingProtocol>,
    hedge: Arc<dyn HedgeExchange>,
    display: Arc<dyn DisplaySink>,
    stream_ready: ReadySignal,
    lending_ready: ReadySignal,
    last_base_price: Option<f64>,
}

impl Coordinator {
    pub fn new(
        params: CoordinatorParams,
        stream: StreamClient,
        tracker: Arc<PositionTracker>,
        lending: Arc<dyn LendingProtocol>,
        hedge: Arc<dyn HedgeExchange>,
        display: Arc<dyn DisplaySink>,
    ) -> Self {
        Self {
            params,
            stream,
            tracker,
            lending,
            hedge,
            display,
            stream_ready: ReadySignal::new(),
            lending_ready: ReadySignal::new(),
            last_base_price: None,
        }
    }

    /// Build the stream client and tracker from config and wire the tracker's handlers.
    pub fn from_config(
        config: &AppConfig,
        lending: Arc<dyn LendingProtocol>,
        hedge: Arc<dyn HedgeExchange>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Self> {
        let stream = StreamClient::new(config.stream.clone());
        let tracker = Arc::new(PositionTracker::from_config(&config.strategy));
        tracker.attach(&stream)?;

        Ok(Self::new(
            CoordinatorParams::from_config(config),
            stream,
            tracker,
            lending,
            hedge,
            display,
        ))
    }

    pub fn stream(&self) -> &StreamClient {
        &self.stream
    }

    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    pub fn lending(&self) -> &Arc<dyn LendingProtocol> {
        &self.lending
    }

    pub fn hedge(&self) -> &Arc<dyn HedgeExchange> {
        &self.hedge
    }

    pub fn stream_ready(&self) -> &ReadySignal {
        &self.stream_ready
    }

    pub fn lending_ready(&self) -> &ReadySignal {
        &self.lending_ready
    }

    // ==================== Startup ====================

    /// Connect the stream and probe the lending venue concurrently.
    pub async fn initialize(&self) -> Result<()> {
        tokio::try_join!(self.initialize_stream(), self.initialize_lending())?;
        Ok(())
    }

    async fn initialize_stream(&self) -> Result<()> {
        self.stream.start()?;
        self.stream.wait_connected().await?;
        self.stream_ready.set();
        info!("Stream ready");
        Ok(())
    }

    async fn initialize_lending(&self) -> Result<()> {
        let account = self.lending.get_user_account_data().await?;
        self.lending_ready.set();
        info!(
            venue = self.lending.name(),
            collateral_usd = account.total_collateral_usd,
            debt_usd = account.total_debt_usd,
            health_factor = account.health_factor,
            "Lending ready"
        );
        Ok(())
    }

    /// Suspend until both the stream and the lending venue are ready. No timeout.
    pub async fn wait_all_ready(&self) {
        tokio::join!(self.stream_ready.wait(), self.lending_ready.wait());
    }

    /// Pull the hedge account over REST instead of waiting for the first push.
    pub async fn sync_hedge_state(&self) -> Result<()> {
        let snapshot = self.hedge.user_state(&self.params.wallet_address).await?;
        self.tracker.apply_snapshot(snapshot);
        Ok(())
    }

    /// Any hedge position or any lending balance
    pub async fn has_open_positions(&self) -> Result<bool> {
        let reserves = self.lending.get_user_reserves().await?;
        let lending = LendingSummary::from_reserves(&reserves);
        Ok(self.tracker.has_open_positions(Some(&lending)))
    }

    /// Entry workflow over this coordinator's venue handles
    pub fn workflow(&self, params: WorkflowParams, bridge_retry: RetryPolicy) -> ExecutionWorkflow {
        ExecutionWorkflow::new(
            Arc::clone(&self.lending),
            Arc::clone(&self.hedge),
            params,
            bridge_retry,
        )
    }

    // ==================== Refresh ====================

    async fn base_price(&mut self) -> Fallback<f64> {
        let oracle = self
            .lending
            .oracle_price(&self.params.base_asset)
            .await
            .and_then(|p| {
                p.to_f64()
                    .ok_or_else(|| CarryError::Validation(format!("price {} out of range", p)))
            });

        let price = resolve_base_price(&self.params.base_asset, oracle, self.last_base_price);
        if !price.degraded {
            self.last_base_price = Some(price.value);
        }
        price
    }

    /// One refresh iteration: re-fetch lending data and assemble the dashboard.
    pub async fn refresh(&mut self) -> Result<Dashboard> {
        let reserves = self.lending.get_user_reserves().await?;
        let lending = LendingSummary::from_reserves(&reserves);
        let base_price = self.base_price().await;

        let positions: Vec<_> = self.tracker.positions().into_values().collect();
        for p in positions.iter().filter(|p| p.risk.is_near) {
            warn!(
                coin = %p.coin,
                account_value = p.account_value,
                position_usd = p.position_usd,
                maintenance_margin = p.risk.maintenance_margin,
                liquidation_threshold = p.risk.liquidation_threshold,
                margin_buffer = p.risk.margin_buffer,
                buffer_pct = p.risk.buffer_percentage,
                "Position near liquidation"
            );
        }

        let base = reserves
            .iter()
            .find(|r| r.symbol == self.params.base_asset && r.supply_balance > 0.0);
        let quote = reserves
            .iter()
            .find(|r| r.symbol == self.params.quote_asset && r.borrow_balance > 0.0);
        let hedge = positions.iter().find(|p| p.coin == self.params.hedge_symbol);
        let global = match (base, quote, hedge) {
            (Some(base), Some(quote), Some(hedge)) => Some(global_return(base, quote, hedge)),
            _ => None,
        };

        debug!(
            reserves = reserves.len(),
            positions = positions.len(),
            "Refresh complete"
        );

        Ok(Dashboard {
            updated_at: Utc::now(),
            stream_state: self.stream.state(),
            hedge: self.tracker.summary(),
            positions,
            reserves,
            lending,
            base_price,
            global_return: global,
        })
    }

    /// Main loop; blocks until shutdown, then stops the stream.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.params.refresh_interval.as_millis() as u64,
            "coordinator starting refresh loop"
        );

        let mut refresh_tick = tokio::time::interval(self.params.refresh_interval);
        // Don't burst-fire missed ticks
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh_tick.tick() => {
                    match self.refresh().await {
                        Ok(dashboard) => self.display.render(&dashboard),
                        Err(e) => {
                            error!(error = %e, "Refresh failed, forcing stream reconnect");
                            self.stream.reconnect();
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("coordinator: shutdown signal received");
                    break;
                }
            }
        }

        self.stream.stop().await;
        info!("coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PaperLending;
    use crate::domain::{
        ConnectionState, ReserveData, TxReceipt, UserAccountData, UserReservePosition,
    };
    use crate::exchange::MockHedgeExchange;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDisplay {
        frames: Mutex<Vec<Dashboard>>,
    }

    impl DisplaySink for RecordingDisplay {
        fn render(&self, dashboard: &Dashboard) {
            self.frames.lock().unwrap().push(dashboard.clone());
        }
    }

    /// Lending venue whose RPC is down
    #[derive(Default)]
    struct UnreachableLending {
        calls: AtomicUsize,
    }

    impl UnreachableLending {
        fn down<T>(&self) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CarryError::Connection("rpc unreachable".to_string()))
        }
    }

    #[async_trait]
    impl LendingProtocol for UnreachableLending {
        fn name(&self) -> &str {
            "unreachable"
        }
        async fn wallet_balance(&self, _asset: &str) -> Result<Decimal> {
            self.down()
        }
        async fn oracle_price(&self, _asset: &str) -> Result<Decimal> {
            self.down()
        }
        async fn swap(&self, _from: &str, _to: &str, _amount: Decimal, _min: Decimal) -> Result<TxReceipt> {
            self.down()
        }
        async fn supply(
            &self,
            _asset: &str,
            _amount: Decimal,
            _on_behalf_of: Option<&str>,
            _is_native: bool,
        ) -> Result<TxReceipt> {
            self.down()
        }
        async fn borrow_asset(&self, _asset: &str, _amount: Decimal) -> Result<TxReceipt> {
            self.down()
        }
        async fn transfer(&self, _asset: &str, _to: &str, _amount: Decimal) -> Result<TxReceipt> {
            self.down()
        }
        async fn get_reserve_data(&self, _asset: &str) -> Result<ReserveData> {
            self.down()
        }
        async fn get_user_account_data(&self) -> Result<UserAccountData> {
            self.down()
        }
        async fn get_user_reserves(&self) -> Result<Vec<UserReservePosition>> {
            self.down()
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default_config();
        config.stream.wallet_address = "0xabc".to_string();
        config.stream.ws_url = "ws://127.0.0.1:1/ws".to_string();
        config.coordinator.refresh_interval_ms = 10;
        config
    }

    fn coordinator(
        lending: Arc<dyn LendingProtocol>,
        display: Arc<dyn DisplaySink>,
    ) -> Coordinator {
        Coordinator::from_config(&config(), lending, Arc::new(MockHedgeExchange::new()), display)
            .unwrap()
    }

    #[tokio::test]
    async fn wait_all_ready_needs_both_signals() {
        let lending = Arc::new(PaperLending::from_config(&config().lending));
        let c = coordinator(lending, Arc::new(RecordingDisplay::default()));

        c.stream_ready().set();
        let pending = tokio::time::timeout(Duration::from_millis(50), c.wait_all_ready()).await;
        assert!(pending.is_err());

        let lending_ready = c.lending_ready().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lending_ready.set();
        });
        tokio::time::timeout(Duration::from_secs(1), c.wait_all_ready())
            .await
            .expect("both signals set");
        assert!(c.stream_ready().is_set() && c.lending_ready().is_set());
    }

    #[tokio::test]
    async fn refresh_summarizes_lending_book() {
        let paper = Arc::new(PaperLending::from_config(&config().lending));
        paper.swap("USDC", "WETH", dec!(300), dec!(0.1)).await.unwrap();
        paper.supply("WETH", dec!(0.1), None, false).await.unwrap();
        paper.borrow_asset("USDC", dec!(100)).await.unwrap();

        let mut c = coordinator(paper, Arc::new(RecordingDisplay::default()));
        let dashboard = c.refresh().await.unwrap();

        assert_eq!(dashboard.reserves.len(), 2);
        assert!((dashboard.lending.total_supply_usd - 300.0).abs() < 1e-9);
        assert!((dashboard.lending.total_borrow_usd - 100.0).abs() < 1e-9);
        assert_eq!(dashboard.base_price, Fallback::fresh(3000.0));
        assert!(dashboard.positions.is_empty());
        assert!(dashboard.global_return.is_none());
        assert!(c.has_open_positions().await.unwrap());
    }

    #[test]
    fn base_price_falls_back_to_last_good_value() {
        let fresh = resolve_base_price("WETH", Ok(3000.0), None);
        assert!(!fresh.degraded);

        let stale = resolve_base_price(
            "WETH",
            Err(CarryError::Connection("rpc".into())),
            Some(3000.0),
        );
        assert!(stale.degraded);
        assert_eq!(stale.value, 3000.0);

        let never_seen = resolve_base_price("WETH", Ok(f64::NAN), None);
        assert!(never_seen.degraded);
        assert_eq!(never_seen.value, 0.0);
    }

    #[tokio::test]
    async fn run_survives_failed_refreshes_until_shutdown() {
        let lending = Arc::new(UnreachableLending::default());
        let display = Arc::new(RecordingDisplay::default());
        let c = coordinator(lending.clone(), display.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(c.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits on shutdown")
            .unwrap();

        assert!(lending.calls.load(Ordering::SeqCst) >= 2);
        assert!(display.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_cycles_the_live_stream() {
        use futures_util::StreamExt;
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.unwrap();
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let mut config = config();
        config.stream.ws_url = format!("ws://{}/ws", addr);
        config.stream.reconnect_delay_ms = 20;
        config.coordinator.refresh_interval_ms = 200;
        let lending = Arc::new(UnreachableLending::default());
        let display = Arc::new(RecordingDisplay::default());
        let c = Coordinator::from_config(
            &config,
            lending.clone(),
            Arc::new(MockHedgeExchange::new()),
            display.clone(),
        )
        .unwrap();

        let stream = c.stream().clone();
        stream.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), stream.wait_connected())
            .await
            .expect("connected in time")
            .unwrap();
        let mut states = stream.state_changes();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(c.run(shutdown_rx));

        let mut observed = Vec::new();
        for _ in 0..3 {
            let state = tokio::time::timeout(Duration::from_secs(5), states.recv())
                .await
                .expect("state change in time")
                .unwrap();
            observed.push(state);
        }
        assert_eq!(
            observed,
            vec![
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        assert!(accepted.load(Ordering::SeqCst) >= 2);
        assert!(lending.calls.load(Ordering::SeqCst) >= 1);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits on shutdown")
            .unwrap();
        assert_eq!(stream.state(), ConnectionState::Stopped);
        assert!(display.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_renders_each_refresh() {
        let lending = Arc::new(PaperLending::from_config(&config().lending));
        let display = Arc::new(RecordingDisplay::default());
        let c = coordinator(lending, display.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(c.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let frames = display.frames.lock().unwrap();
        assert!(!frames.is_empty());
        assert!(!frames[0].lending.has_positions());
    }
}
