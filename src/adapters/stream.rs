//! Resilient push-feed client for the hedge venue.
//!
//! One task owns the socket. It re-issues the full subscription set on every
//! connection and routes each `{channel, data}` envelope to at most one handler.
//! Handlers run inline on that task, so a slow handler delays further reads.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::StreamConfig;
use crate::domain::ConnectionState;
use crate::error::{CarryError, Result};

pub const TOPIC_WEB_DATA: &str = "webData2";
pub const TOPIC_USER_FUNDINGS: &str = "userFundings";
pub const TOPIC_ACTIVE_ASSET_CTX: &str = "activeAssetCtx";

/// Control channels answered by the venue itself; never routed
const CONTROL_CHANNELS: &[&str] = &["subscriptionResponse", "pong"];

/// Callback for one topic. Errors are logged and the message is dropped.
pub type TopicHandler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// A single feed subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Full account snapshot
    WebData2 { user: String },
    /// Funding payment events
    UserFundings { user: String },
    /// Funding rate and mark price for one coin
    ActiveAssetCtx { coin: String },
}

impl Subscription {
    /// Fixed subscription set for an account and its coins
    pub fn for_account(user: &str, coins: &[String]) -> Vec<Subscription> {
        let mut subs = vec![
            Subscription::WebData2 {
                user: user.to_string(),
            },
            Subscription::UserFundings {
                user: user.to_string(),
            },
        ];
        subs.extend(coins.iter().map(|coin| Subscription::ActiveAssetCtx {
            coin: coin.clone(),
        }));
        subs
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Subscription::WebData2 { .. } => TOPIC_WEB_DATA,
            Subscription::UserFundings { .. } => TOPIC_USER_FUNDINGS,
            Subscription::ActiveAssetCtx { .. } => TOPIC_ACTIVE_ASSET_CTX,
        }
    }

    /// Wire request, e.g. `{"method":"subscribe","subscription":{"type":"webData2","user":"0x.."}}`
    pub fn to_request(&self) -> Value {
        let subscription = match self {
            Subscription::WebData2 { user } | Subscription::UserFundings { user } => {
                json!({"type": self.topic(), "user": user})
            }
            Subscription::ActiveAssetCtx { coin } => json!({"type": self.topic(), "coin": coin}),
        };
        json!({"method": "subscribe", "subscription": subscription})
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    data: Value,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    ReconnectRequested,
    Stopped,
}

struct Inner {
    config: StreamConfig,
    subscriptions: Vec<Subscription>,
    coins: HashSet<String>,
    handlers: Mutex<HashMap<String, TopicHandler>>,
    state_tx: watch::Sender<ConnectionState>,
    transitions_tx: broadcast::Sender<ConnectionState>,
    running: AtomicBool,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    /// Id of the most recent session; 0 before the first connect
    session_seq: AtomicU64,
    /// Session id a reconnect was requested for
    reconnect_tx: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Push-feed client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> Self {
        let subscriptions = Subscription::for_account(&config.wallet_address, &config.coins);
        let coins = config.coins.iter().cloned().collect();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions_tx, _) = broadcast::channel(64);
        let (stop_tx, _) = watch::channel(false);
        let (reconnect_tx, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                config,
                subscriptions,
                coins,
                handlers: Mutex::new(HashMap::new()),
                state_tx,
                transitions_tx,
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stop_tx,
                session_seq: AtomicU64::new(0),
                reconnect_tx,
                task: Mutex::new(None),
            }),
        }
    }

    /// Subscriptions sent on every (re)connect
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.inner.subscriptions
    }

    /// Register the handler for `topic`. Only allowed before `start()`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(CarryError::InvalidState(format!(
                "cannot register handler for {} after start",
                topic
            )));
        }

        let mut handlers = self
            .inner
            .handlers
            .lock()
            .map_err(|_| CarryError::Internal("handler registry poisoned".to_string()))?;
        if handlers.contains_key(&topic) {
            return Err(CarryError::Validation(format!(
                "handler already registered for {}",
                topic
            )));
        }
        handlers.insert(topic, Arc::new(handler));
        Ok(())
    }

    /// Spawn the connection loop on the current runtime.
    pub fn start(&self) -> Result<()> {
        if self.inner.state_tx.borrow().is_terminal() {
            return Err(CarryError::InvalidState("stream client is stopped".to_string()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CarryError::InvalidState("stream client already started".to_string()));
        }

        let handlers = self
            .inner
            .handlers
            .lock()
            .map_err(|_| CarryError::Internal("handler registry poisoned".to_string()))?
            .clone();

        self.inner.running.store(true, Ordering::SeqCst);
        let stop_rx = self.inner.stop_tx.subscribe();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(handlers, stop_rx).await });

        if let Ok(mut task) = self.inner.task.lock() {
            *task = Some(handle);
        }
        info!(
            url = %self.inner.config.ws_url,
            subscriptions = self.inner.subscriptions.len(),
            "Stream client started"
        );
        Ok(())
    }

    /// Suspend until the client is Connected. Fails with `Cancelled` once stopped.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| s.is_connected() || s.is_terminal())
            .await
            .map_err(|_| CarryError::Cancelled)?;

        if state.is_terminal() {
            Err(CarryError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drop the live session; the loop reconnects after the usual delay.
    ///
    /// The request names the session that is live right now, so it cannot end a
    /// later session if this one is already closing.
    pub fn reconnect(&self) {
        if self.state().is_connected() {
            let session = self.inner.session_seq.load(Ordering::SeqCst);
            info!(session, "Stream reconnect requested");
            self.inner.reconnect_tx.send_replace(session);
        } else {
            debug!(state = %self.state(), "Reconnect ignored, no live session");
        }
    }

    /// Close the socket and end the loop. Terminal.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.transition(ConnectionState::Stopped);
        self.inner.stop_tx.send_replace(true);

        let handle = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Stream task ended abnormally");
            }
        }
        info!("Stream client stopped");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Every state transition from now on
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions_tx.subscribe()
    }
}

impl Inner {
    fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        self.state_tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                debug!(%from, to = %next, "Stream state changed");
                let _ = self.transitions_tx.send(next);
                true
            }
            None => false,
        }
    }

    async fn run(
        self: Arc<Self>,
        handlers: HashMap<String, TopicHandler>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let delay = self.config.reconnect_delay();

        while self.running.load(Ordering::SeqCst) {
            if !self.transition(ConnectionState::Connecting) {
                break;
            }

            match self.session(&handlers, &mut stop_rx).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Closed) => info!("Stream connection closed"),
                Ok(SessionEnd::ReconnectRequested) => info!("Stream session dropped on request"),
                Err(e) => error!(error = %e, "Stream connection error"),
            }

            if !self.transition(ConnectionState::Reconnecting) {
                break;
            }
            warn!(delay_ms = delay.as_millis() as u64, "Reconnecting stream");

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        debug!("Stream loop exited");
    }

    async fn session(
        &self,
        handlers: &HashMap<String, TopicHandler>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let url = Url::parse(&self.config.ws_url)
            .map_err(|e| CarryError::Connection(format!("invalid stream url: {}", e)))?;

        debug!(%url, "Connecting stream");
        let connect = timeout(self.config.connect_timeout(), connect_async(url.as_str()));
        let ws_stream = tokio::select! {
            _ = stop_rx.changed() => return Ok(SessionEnd::Stopped),
            result = connect => match result {
                Err(_) => {
                    return Err(CarryError::Connection(format!(
                        "handshake timed out after {:?}",
                        self.config.connect_timeout()
                    )))
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((stream, _))) => stream,
            },
        };

        let mut reconnect_rx = self.reconnect_tx.subscribe();
        let session = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.transition(ConnectionState::Connected) {
            return Ok(SessionEnd::Stopped);
        }

        let (mut write, mut read) = ws_stream.split();

        for subscription in &self.subscriptions {
            write
                .send(Message::Text(subscription.to_request().to_string()))
                .await?;
        }
        info!(count = self.subscriptions.len(), "Stream subscriptions issued");

        let period = self.config.ping_interval();
        let mut ping_interval = interval_at(Instant::now() + period, period);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
                Ok(()) = reconnect_rx.changed() => {
                    let target = *reconnect_rx.borrow_and_update();
                    if target != session {
                        debug!(target, session, "Ignoring reconnect for an earlier session");
                        continue;
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::ReconnectRequested);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(handlers, &text),
                        Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Received close frame");
                            return Ok(SessionEnd::Closed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Closed),
                        _ => {}
                    }
                }
                _ = ping_interval.tick() => {
                    write.send(Message::Text(json!({"method": "ping"}).to_string())).await?;
                    trace!("Sent keep-alive ping");
                }
            }
        }
    }

    fn dispatch(&self, handlers: &HashMap<String, TopicHandler>, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!(error = %e, %preview, "Dropping malformed stream message");
                return;
            }
        };

        if CONTROL_CHANNELS.contains(&envelope.channel.as_str()) {
            trace!(channel = %envelope.channel, "Control message");
            return;
        }

        if envelope.channel == TOPIC_ACTIVE_ASSET_CTX {
            if let Some(coin) = envelope.data.get("coin").and_then(Value::as_str) {
                if !self.coins.contains(coin) {
                    trace!(%coin, "Ignoring context for unsubscribed coin");
                    return;
                }
            }
        }

        let Some(handler) = handlers.get(&envelope.channel) else {
            trace!(channel = %envelope.channel, "No handler for channel");
            return;
        };

        if let Err(e) = handler(&envelope.data) {
            warn!(channel = %envelope.channel, error = %e, "Handler rejected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> StreamConfig {
        StreamConfig {
            ws_url: "ws://127.0.0.1:1".to_string(),
            wallet_address: "0xabc".to_string(),
            coins: vec!["ETH".to_string(), "BTC".to_string()],
            reconnect_delay_ms: 10,
            ping_interval_secs: 20,
            connect_timeout_secs: 1,
        }
    }

    #[test]
    fn test_subscription_set() {
        let subs = Subscription::for_account("0xabc", &["ETH".to_string()]);
        assert_eq!(subs.len(), 3);
        assert_eq!(
            subs[0].to_request(),
            json!({"method": "subscribe", "subscription": {"type": "webData2", "user": "0xabc"}})
        );
        assert_eq!(
            subs[2].to_request(),
            json!({"method": "subscribe", "subscription": {"type": "activeAssetCtx", "coin": "ETH"}})
        );
    }

    #[test]
    fn test_dispatch_routes_and_filters() {
        let client = StreamClient::new(test_config());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handlers: HashMap<String, TopicHandler> = HashMap::new();
        let counter = Arc::clone(&hits);
        handlers.insert(
            TOPIC_ACTIVE_ASSET_CTX.to_string(),
            Arc::new(move |_data: &Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let inner = &client.inner;
        inner.dispatch(&handlers, r#"{"channel":"activeAssetCtx","data":{"coin":"ETH","ctx":{}}}"#);
        inner.dispatch(&handlers, r#"{"channel":"activeAssetCtx","data":{"coin":"DOGE","ctx":{}}}"#);
        inner.dispatch(&handlers, r#"{"channel":"subscriptionResponse","data":{}}"#);
        inner.dispatch(&handlers, r#"{"channel":"trades","data":[]}"#);
        inner.dispatch(&handlers, "not json");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_error_does_not_panic() {
        let client = StreamClient::new(test_config());
        let mut handlers: HashMap<String, TopicHandler> = HashMap::new();
        handlers.insert(
            TOPIC_WEB_DATA.to_string(),
            Arc::new(|_data: &Value| Err(CarryError::Validation("bad".into()))),
        );
        client
            .inner
            .dispatch(&handlers, r#"{"channel":"webData2","data":{}}"#);
    }

    #[tokio::test]
    async fn test_subscribe_rejected_after_start() {
        let client = StreamClient::new(test_config());
        client.subscribe(TOPIC_WEB_DATA, |_| Ok(())).unwrap();
        assert!(matches!(
            client.subscribe(TOPIC_WEB_DATA, |_| Ok(())),
            Err(CarryError::Validation(_))
        ));

        client.start().unwrap();
        assert!(matches!(
            client.subscribe(TOPIC_USER_FUNDINGS, |_| Ok(())),
            Err(CarryError::InvalidState(_))
        ));
        assert!(client.start().is_err());

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    async fn next_state(states: &mut broadcast::Receiver<ConnectionState>) -> ConnectionState {
        timeout(std::time::Duration::from_secs(5), states.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_stale_reconnect_leaves_new_session_alone() {
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        // First connection is closed by the server; later ones stay open
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut index = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                let conn = index;
                index += 1;
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.unwrap();
                    if conn == 0 {
                        let _ = ws.close(None).await;
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let mut config = test_config();
        config.ws_url = format!("ws://{}", addr);
        config.reconnect_delay_ms = 100;
        let client = StreamClient::new(config);
        let mut states = client.state_changes();
        client.start().unwrap();

        assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut states).await, ConnectionState::Connected);
        assert_eq!(next_state(&mut states).await, ConnectionState::Reconnecting);

        // Request against the first session lands after it already ended
        client.inner.reconnect_tx.send_replace(1);

        assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut states).await, ConnectionState::Connected);
        let quiet = timeout(std::time::Duration::from_millis(300), states.recv()).await;
        assert!(quiet.is_err());
        assert_eq!(client.state(), ConnectionState::Connected);

        // A request for the live session still goes through
        client.reconnect();
        assert_eq!(next_state(&mut states).await, ConnectionState::Reconnecting);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_wait_connected_cancelled_by_stop() {
        let client = StreamClient::new(test_config());
        client.start().unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_connected().await })
        };
        client.stop().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CarryError::Cancelled)));
    }
}
