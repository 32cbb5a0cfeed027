//! Feed Connector - Per-Provider Streaming State Machine
//!
//! Owns one persistent stream per provider and drives it through
//! `Disconnected → Connecting → Connected → [Authenticating →] Subscribed`.
//! Unexpected closes reconnect after a fixed delay with a full handshake.
//! A permanent rejection parks the connector in `FallbackActive` and
//! notifies the supervisor exactly once; the stream is never retried.
//!
//! Provider specifics (URLs, frames, decoding) live behind
//! [`StreamProtocol`]; the wire itself behind `StreamTransport`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::domain::{ConnectionState, FeedError, Provider, SymbolMap};
use crate::ports::{FeedTelemetry, StreamSession, StreamTransport};
use crate::usecases::PriceCache;

/// A quote as decoded from the wire, before symbol mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct WireTick {
    /// Provider-native symbol (e.g. "BTCUSDT").
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Unix ms.
    pub timestamp_ms: u64,
}

/// Login verdict carried by a provider status message.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Accepted,
    /// Permanent: bad key, unsupported plan, forbidden.
    Rejected(String),
}

/// Everything one inbound frame told us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub ticks: Vec<WireTick>,
    pub auth: Option<AuthOutcome>,
    /// Elements of a batched frame that failed to decode.
    pub malformed: u64,
}

impl Decoded {
    pub fn ticks(ticks: Vec<WireTick>) -> Self {
        Self {
            ticks,
            ..Self::default()
        }
    }

    pub fn auth(outcome: AuthOutcome) -> Self {
        Self {
            auth: Some(outcome),
            ..Self::default()
        }
    }

    /// Acks, status chatter, heartbeats echoed back.
    pub fn nothing() -> Self {
        Self::default()
    }
}

/// Keep-alive frame sent while subscribed.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub interval: Duration,
    pub message: String,
}

/// Provider wire dialect spoken over a stream.
pub trait StreamProtocol: Send + Sync + 'static {
    fn provider(&self) -> Provider;

    /// Connect URL, which may embed the subscribed symbols or the key.
    fn url(&self, symbols: &SymbolMap) -> String;

    /// Login frame. `None` for providers without a login step.
    fn auth_message(&self) -> Option<String> {
        None
    }

    /// Frames sent once the stream is ready for subscriptions.
    fn subscribe_messages(&self, symbols: &SymbolMap) -> Vec<String>;

    fn heartbeat(&self) -> Option<Heartbeat> {
        None
    }

    /// Decode one inbound text frame. `Err` marks the frame malformed.
    fn decode(&self, text: &str) -> Result<Decoded, FeedError>;
}

/// Connector timing.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Fixed wait before reconnecting after an unexpected close.
    pub reconnect_delay: Duration,
    /// Max wait for the login verdict before the session is dropped.
    pub auth_timeout: Duration,
    /// How long `stop()` waits for the run loop before aborting it.
    pub stop_grace: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(1),
        }
    }
}

/// Point-in-time counters for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStats {
    pub ticks: u64,
    pub parse_failures: u64,
    pub unmapped_symbols: u64,
    pub reconnects: u64,
}

/// Why a session ended.
enum SessionEnd {
    Stopped,
    Dropped(FeedError),
    Rejected(String),
}

/// Streaming connection manager for one provider.
pub struct FeedConnector {
    protocol: Arc<dyn StreamProtocol>,
    transport: Arc<dyn StreamTransport>,
    /// Cache this connector writes into.
    cache: Arc<PriceCache>,
    /// Subscribed instruments.
    symbols: SymbolMap,
    config: ConnectorConfig,
    /// Current state, observable without locking the connector.
    state_tx: watch::Sender<ConnectionState>,
    /// `true` asks the run loop to exit.
    stop_tx: watch::Sender<bool>,
    /// Supervisor channel for fallback requests.
    fallback_tx: Option<mpsc::UnboundedSender<Provider>>,
    fallback_notified: AtomicBool,
    run_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    ticks: AtomicU64,
    parse_failures: AtomicU64,
    unmapped_symbols: AtomicU64,
    reconnects: AtomicU64,
    telemetry: Option<Arc<dyn FeedTelemetry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves once the stop flag is raised.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

impl FeedConnector {
    pub fn new(
        protocol: Arc<dyn StreamProtocol>,
        transport: Arc<dyn StreamTransport>,
        cache: Arc<PriceCache>,
        symbols: SymbolMap,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, _) = watch::channel(false);

        Self {
            protocol,
            transport,
            cache,
            symbols,
            config: ConnectorConfig::default(),
            state_tx,
            stop_tx,
            fallback_tx: None,
            fallback_notified: AtomicBool::new(false),
            run_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            ticks: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            unmapped_symbols: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            telemetry: None,
        }
    }

    pub fn with_config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Channel notified (once) when the stream is permanently rejected.
    pub fn with_fallback_notifier(mut self, tx: mpsc::UnboundedSender<Provider>) -> Self {
        self.fallback_tx = Some(tx);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn FeedTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn provider(&self) -> Provider {
        self.protocol.provider()
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that follows every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Spawn the run loop. No-op while running or once in fallback.
    pub fn start(self: &Arc<Self>) {
        if self.state() == ConnectionState::FallbackActive {
            return;
        }
        let mut run_task = lock(&self.run_task);
        if run_task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        self.stop_tx.send_replace(false);
        let this = Arc::clone(self);
        *run_task = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Stop the stream and every task this connector owns. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.stop_heartbeat();

        let handle = lock(&self.run_task).take();
        if let Some(mut handle) = handle {
            if timeout(self.config.stop_grace, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }

        // The run loop may have armed a heartbeat while we waited.
        self.stop_heartbeat();
        if self.state() != ConnectionState::FallbackActive {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Skip the stream entirely and hand the provider to REST polling.
    pub fn force_fallback(&self, reason: &str) {
        self.enter_fallback(reason);
    }

    /// Live tasks owned by this connector (run loop + heartbeat).
    pub fn outstanding_tasks(&self) -> usize {
        let live = |slot: &Mutex<Option<JoinHandle<()>>>| {
            lock(slot).as_ref().is_some_and(|h| !h.is_finished()) as usize
        };
        live(&self.run_task) + live(&self.heartbeat_task)
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            unmapped_symbols: self.unmapped_symbols.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Connect / stream / reconnect until stopped or rejected.
    #[instrument(skip_all, fields(provider = %self.protocol.provider()))]
    async fn run(self: Arc<Self>) {
        let provider = self.protocol.provider();
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let end = self.session(&mut stop_rx).await;
            self.stop_heartbeat();

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Rejected(reason) => {
                    self.enter_fallback(&reason);
                    return;
                }
                SessionEnd::Dropped(e) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.stream_dropped(provider);
                    }
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        provider = %provider,
                        error = %e,
                        delay_secs = self.config.reconnect_delay.as_secs(),
                        "Stream disconnected, reconnecting"
                    );

                    tokio::select! {
                        _ = stopped(&mut stop_rx) => break,
                        _ = sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }

        info!(provider = %provider, "Stream connector stopped");
        self.set_state(ConnectionState::Disconnected);
    }

    /// One connection attempt, from connect to close.
    async fn session(&self, stop_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        let provider = self.protocol.provider();
        let url = self.protocol.url(&self.symbols);

        let connected = tokio::select! {
            _ = stopped(stop_rx) => return SessionEnd::Stopped,
            res = self.transport.connect(&url) => res,
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(FeedError::AuthRejected(reason)) => return SessionEnd::Rejected(reason),
            Err(e) => return SessionEnd::Dropped(e),
        };

        self.set_state(ConnectionState::Connected);
        info!(provider = %provider, "Stream connected");

        let end = self.drive(session.as_mut(), stop_rx).await;
        session.close().await;
        end
    }

    /// Handshake, then pump inbound frames until the session ends.
    async fn drive(&self, session: &mut dyn StreamSession, stop_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(8);
        let mut auth_deadline = None;

        if let Some(login) = self.protocol.auth_message() {
            if let Err(e) = session.send_text(login).await {
                return SessionEnd::Dropped(e);
            }
            self.set_state(ConnectionState::Authenticating);
            auth_deadline = Some(Instant::now() + self.config.auth_timeout);
        } else if let Err(e) = self.subscribe(session, &out_tx).await {
            return SessionEnd::Dropped(e);
        }

        loop {
            let deadline = auth_deadline;
            let auth_timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = stopped(stop_rx) => return SessionEnd::Stopped,
                _ = auth_timer => {
                    return SessionEnd::Dropped(FeedError::Connection("login verdict timed out".into()));
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = session.send_text(frame).await {
                        return SessionEnd::Dropped(e);
                    }
                }
                msg = session.next_text() => {
                    let text = match msg {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => return SessionEnd::Dropped(e),
                        None => return SessionEnd::Dropped(FeedError::Connection("stream closed by peer".into())),
                    };

                    let decoded = match self.protocol.decode(&text) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            self.record_parse_failures(1, &e);
                            continue;
                        }
                    };
                    if decoded.malformed > 0 {
                        self.record_parse_failures(decoded.malformed, &"undecodable batch elements");
                    }

                    match decoded.auth {
                        Some(AuthOutcome::Rejected(reason)) => return SessionEnd::Rejected(reason),
                        Some(AuthOutcome::Accepted) if auth_deadline.is_some() => {
                            auth_deadline = None;
                            info!(provider = %self.protocol.provider(), "Stream authenticated");
                            if let Err(e) = self.subscribe(session, &out_tx).await {
                                return SessionEnd::Dropped(e);
                            }
                        }
                        _ => {}
                    }

                    self.apply_ticks(decoded.ticks).await;
                }
            }
        }
    }

    /// Send subscription frames, enter `Subscribed`, arm the heartbeat.
    async fn subscribe(&self, session: &mut dyn StreamSession, out_tx: &mpsc::Sender<String>) -> Result<(), FeedError> {
        for frame in self.protocol.subscribe_messages(&self.symbols) {
            session.send_text(frame).await?;
        }
        self.set_state(ConnectionState::Subscribed);
        info!(
            provider = %self.protocol.provider(),
            symbols = self.symbols.len(),
            "Stream subscribed"
        );

        if let Some(heartbeat) = self.protocol.heartbeat() {
            self.start_heartbeat(heartbeat, out_tx.clone());
        }
        Ok(())
    }

    /// Periodic keep-alive routed through the session loop, which owns
    /// the write half.
    fn start_heartbeat(&self, heartbeat: Heartbeat, out_tx: mpsc::Sender<String>) {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if out_tx.send(heartbeat.message.clone()).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.heartbeat_task).replace(handle) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = lock(&self.heartbeat_task).take() {
            handle.abort();
        }
    }

    async fn apply_ticks(&self, ticks: Vec<WireTick>) {
        let provider = self.protocol.provider();

        for tick in ticks {
            let Some(symbol) = self.symbols.to_canonical(&tick.symbol).cloned() else {
                self.unmapped_symbols.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.symbol_unmapped(provider);
                }
                debug!(provider = %provider, symbol = %tick.symbol, "Dropped tick for unmapped symbol");
                continue;
            };

            if self.cache.upsert(symbol, tick.bid, tick.ask, tick.timestamp_ms).await {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.quotes_applied(provider, "stream", 1);
                }
            }
        }
    }

    fn record_parse_failures(&self, count: u64, error: &dyn std::fmt::Display) {
        let provider = self.protocol.provider();
        self.parse_failures.fetch_add(count, Ordering::Relaxed);
        if let Some(telemetry) = &self.telemetry {
            telemetry.messages_malformed(provider, count);
        }
        debug!(provider = %provider, count, error = %error, "Dropped malformed stream message");
    }

    fn enter_fallback(&self, reason: &str) {
        let provider = self.protocol.provider();
        self.set_state(ConnectionState::FallbackActive);

        if self.fallback_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(provider = %provider, reason, "Stream permanently rejected, switching to REST fallback");
        if let Some(tx) = &self.fallback_tx {
            if tx.send(provider).is_err() {
                warn!(provider = %provider, "Fallback listener gone, provider will stay dark");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(provider = %self.protocol.provider(), from = %previous, to = %state, "Connector state change");
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.feed_state(self.protocol.provider(), state);
        }
    }
}
