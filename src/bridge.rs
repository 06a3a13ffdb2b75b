//! Bridge transport: the duplex channel to the hub
//!
//! Maintains one WebSocket connection through a simple state machine
//! (Disconnected -> Connecting -> Connected -> Registered, Failed on the
//! way down), registers the device, drains the durable queue in acked
//! batches, and dispatches inbound commands to the kernel.
//!
//! Reconnection backs off exponentially from 1s to a 30s cap with
//! jitter. A registration rejection parks the bridge in Failed until it
//! is explicitly reconfigured; retrying a bad token gets nowhere.
//! Disconnecting aborts every suspended breakpoint.

use crate::breakpoint::BreakpointEngine;
use crate::error::{ProbeError, Result};
use crate::kernel::PluginKernel;
use crate::protocol::{
    AdvertisedPlugin, BridgeFrame, ControlSender, EventsBatch, RegisterDevice,
};
use crate::queue::{EventEmitter, EventQueue};
use crate::types::{DeviceInfo, EventBody, PluginCommandResponse};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Failed,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Disconnected => "disconnected",
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
            BridgeState::Registered => "registered",
            BridgeState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bridge connection parameters.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub token: String,
    /// Events per batch frame
    pub batch_size: usize,
    /// Flush cadence while registered
    pub flush_interval: Duration,
    /// Deadline for a plugin to answer a hub command
    pub command_deadline: Duration,
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: crate::settings::DEFAULT_HUB_HOST.to_string(),
            port: crate::settings::DEFAULT_HUB_PORT,
            path: "/debug-bridge".to_string(),
            token: String::new(),
            batch_size: 20,
            flush_interval: Duration::from_millis(200),
            command_deadline: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Exponential backoff, 1s doubling to 30s, with up to 25% jitter.
struct Backoff {
    current: Duration,
}

impl Backoff {
    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    fn new() -> Self {
        Self { current: Self::BASE }
    }

    fn reset(&mut self) {
        self.current = Self::BASE;
    }

    /// Next delay, advancing the schedule.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(Self::CAP);
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 4));
        base + Duration::from_millis(jitter_ms)
    }
}

/// The bridge. Constructed once per agent; `run` is spawned onto the
/// runtime and owns the socket for the agent's lifetime.
pub struct Bridge {
    config: RwLock<BridgeConfig>,
    state_tx: watch::Sender<BridgeState>,
    queue: Arc<EventQueue>,
    emitter: EventEmitter,
    wakeup: Arc<Notify>,
    kernel: Arc<PluginKernel>,
    breakpoints: Arc<BreakpointEngine>,
    control_tx: mpsc::UnboundedSender<BridgeFrame>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<BridgeFrame>>>,
    /// Fresh per process start; lets the hub tell reconnects from restarts
    app_session_id: String,
    shutdown_tx: watch::Sender<bool>,
    reconnect_notify: Notify,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        queue: Arc<EventQueue>,
        wakeup: Arc<Notify>,
        kernel: Arc<PluginKernel>,
        breakpoints: Arc<BreakpointEngine>,
        control_tx: mpsc::UnboundedSender<BridgeFrame>,
        control_rx: mpsc::UnboundedReceiver<BridgeFrame>,
    ) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let emitter = EventEmitter::new(Arc::clone(&queue), Arc::clone(&wakeup));
        Self {
            config: RwLock::new(config),
            state_tx,
            queue,
            emitter,
            wakeup,
            kernel,
            breakpoints,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            app_session_id: uuid::Uuid::new_v4().to_string(),
            shutdown_tx,
            reconnect_notify: Notify::new(),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    /// Watch handle for state transitions (used by hosts and tests).
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    pub fn app_session_id(&self) -> &str {
        &self.app_session_id
    }

    /// Control sender for frames originated outside the bridge.
    pub fn control_sender(&self) -> ControlSender {
        ControlSender::new(self.control_tx.clone())
    }

    fn set_state(&self, state: BridgeState) {
        if self.state() != state {
            debug!(state = %state, "Bridge state changed");
            self.state_tx.send_replace(state);
        }
    }

    /// Set the hub coordinates without touching the connection. Used
    /// before the run loop starts.
    pub fn configure(&self, host: String, port: u16, token: Option<String>) {
        let mut config = self.config.write().expect("config lock");
        config.host = host;
        config.port = port;
        if let Some(token) = token {
            config.token = token;
        }
    }

    /// Replace the hub coordinates and force a reconnect.
    pub fn update_config(&self, host: String, port: u16, token: Option<String>) {
        self.configure(host, port, token);
        self.reconnect();
    }

    /// Drop the current connection (or leave Failed parking) and dial again.
    pub fn reconnect(&self) {
        self.reconnect_notify.notify_one();
    }

    /// Shut the bridge down; `run` returns after the socket closes.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn register_frame(&self, device: &DeviceInfo) -> BridgeFrame {
        let plugins = self
            .kernel
            .get_plugin_infos()
            .into_iter()
            .map(|info| AdvertisedPlugin {
                id: info.id,
                display_name: info.display_name,
                version: info.version,
            })
            .collect();
        let config = self.config.read().expect("config lock");
        BridgeFrame::RegisterDevice(RegisterDevice {
            device: device.clone(),
            token: config.token.clone(),
            app_session_id: self.app_session_id.clone(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            plugins,
        })
    }

    /// Run the connection loop until `stop` is called. Spawn this.
    pub async fn run(self: Arc<Self>, device: DeviceInfo) {
        let mut control_rx = self
            .control_rx
            .lock()
            .expect("control lock")
            .take()
            .expect("bridge run called twice");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(BridgeState::Connecting);
            let url = self.config.read().expect("config lock").url();
            let connect_timeout = self.config.read().expect("config lock").connect_timeout;

            let ws = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    debug!(url = %url, error = %e, "Connect failed");
                    self.set_state(BridgeState::Failed);
                    if self.wait_backoff(&mut backoff, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    debug!(url = %url, "Connect timed out");
                    self.set_state(BridgeState::Failed);
                    if self.wait_backoff(&mut backoff, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(BridgeState::Connected);
            let (mut sink, mut stream) = ws.split();

            match self.handshake(&mut sink, &mut stream, &device).await {
                Ok(()) => {
                    info!(url = %url, "Registered with hub");
                    self.set_state(BridgeState::Registered);
                    backoff.reset();
                    self.emitter
                        .emit(EventBody::Stats(self.queue.stats(BridgeState::Registered.as_str())));
                }
                Err(ProbeError::RegisterRejected(reason)) => {
                    warn!(reason = %reason, "Hub rejected registration, waiting for reconfiguration");
                    self.set_state(BridgeState::Failed);
                    if self.park_until_reconfigured(&mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Registration handshake failed");
                    self.set_state(BridgeState::Failed);
                    if self.wait_backoff(&mut backoff, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            }

            let stopped = self
                .registered_loop(&mut sink, &mut stream, &mut control_rx, &mut shutdown_rx)
                .await;

            // Whatever un-acked batches were in flight stay in the queue
            // and go out again after the next registration.
            self.set_state(BridgeState::Disconnected);
            self.breakpoints.abort_all();
            if stopped {
                break;
            }
            if self.wait_backoff(&mut backoff, &mut shutdown_rx).await {
                break;
            }
        }
        self.set_state(BridgeState::Disconnected);
        self.breakpoints.abort_all();
        info!("Bridge stopped");
    }

    /// Send `register_device` and wait for the hub's verdict.
    async fn handshake(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        device: &DeviceInfo,
    ) -> Result<()> {
        let frame = self.register_frame(device);
        let text = serde_json::to_string(&frame)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| ProbeError::bridge(format!("register send failed: {e}")))?;

        let deadline = self.config.read().expect("config lock").connect_timeout;
        let verdict = tokio::time::timeout(deadline, async {
            while let Some(msg) = stream.next().await {
                let msg = msg.map_err(|e| ProbeError::bridge(format!("socket error: {e}")))?;
                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<BridgeFrame>(&text) {
                    Ok(BridgeFrame::RegisterAck(_)) => return Ok(()),
                    Ok(BridgeFrame::RegisterReject(payload)) => {
                        return Err(ProbeError::RegisterRejected(
                            payload.reason.unwrap_or_else(|| "no reason given".to_string()),
                        ))
                    }
                    Ok(other) => {
                        debug!(frame = ?other, "Ignoring frame before registration");
                    }
                    Err(e) => {
                        warn!(error = %e, "Unparseable frame during handshake");
                    }
                }
            }
            Err(ProbeError::bridge("socket closed during handshake"))
        })
        .await
        .map_err(|_| ProbeError::bridge("registration timed out"))?;
        verdict
    }

    /// The registered steady state. Returns true when `stop` was requested.
    async fn registered_loop(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        control_rx: &mut mpsc::UnboundedReceiver<BridgeFrame>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let (batch_size, flush_interval) = {
            let config = self.config.read().expect("config lock");
            (config.batch_size, config.flush_interval)
        };
        let mut flush_timer = tokio::time::interval(flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // batch id -> queue row ids awaiting the ack
        let mut in_flight: HashMap<String, Vec<i64>> = HashMap::new();
        let mut watermark: i64 = 0;

        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    if self.flush(sink, batch_size, &mut in_flight, &mut watermark).await.is_err() {
                        return false;
                    }
                }
                _ = self.wakeup.notified() => {
                    // Emitters poke this on every enqueue; only flush early
                    // once a full batch has accumulated
                    let depth = self.queue.depth().unwrap_or(0);
                    if depth >= batch_size as u64
                        && self.flush(sink, batch_size, &mut in_flight, &mut watermark).await.is_err()
                    {
                        return false;
                    }
                }
                Some(frame) = control_rx.recv() => {
                    match serde_json::to_string(&frame) {
                        Ok(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                return false;
                            }
                        }
                        Err(e) => {
                            // Dropping a frame that cannot serialize is all
                            // we can do; counted with the other drops
                            warn!(error = %e, "Dropping unserializable control frame");
                            self.queue.metrics().dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text, &mut in_flight),
                        Some(Ok(Message::Close(_))) | None => return false,
                        Some(Ok(_)) => {} // ping/pong handled by the library
                        Some(Err(e)) => {
                            debug!(error = %e, "Socket error");
                            return false;
                        }
                    }
                }
                _ = self.reconnect_notify.notified() => {
                    info!("Reconnect requested, dropping connection");
                    let _ = sink.send(Message::Close(None)).await;
                    return false;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() {
                        let _ = sink.send(Message::Close(None)).await;
                        return true;
                    }
                }
            }
        }
    }

    /// Send one batch of not-yet-in-flight events, if any.
    async fn flush(
        &self,
        sink: &mut WsSink,
        batch_size: usize,
        in_flight: &mut HashMap<String, Vec<i64>>,
        watermark: &mut i64,
    ) -> Result<()> {
        let batch = match self.queue.peek_batch_after(*watermark, batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Queue read failed during flush");
                return Ok(());
            }
        };
        if batch.is_empty() {
            return Ok(());
        }

        let row_ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();
        let max_id = *row_ids.last().expect("non-empty batch");
        let events = batch.into_iter().map(|(_, event)| event).collect();
        let batch_id = uuid::Uuid::new_v4().to_string();
        let frame = BridgeFrame::EventsBatch(EventsBatch {
            batch_id: batch_id.clone(),
            events,
        });

        let text = serde_json::to_string(&frame)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| ProbeError::bridge(format!("batch send failed: {e}")))?;
        debug!(batch_id = %batch_id, rows = row_ids.len(), "Sent event batch");
        in_flight.insert(batch_id, row_ids);
        *watermark = max_id;
        Ok(())
    }

    fn handle_inbound(&self, text: &str, in_flight: &mut HashMap<String, Vec<i64>>) {
        let frame = match serde_json::from_str::<BridgeFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Unparseable inbound frame");
                return;
            }
        };
        match frame {
            BridgeFrame::EventsAck(ack) => {
                if let Some(row_ids) = in_flight.remove(&ack.batch_id) {
                    if let Err(e) = self.queue.ack(&row_ids) {
                        warn!(error = %e, "Failed to delete acked batch");
                    }
                } else {
                    debug!(batch_id = %ack.batch_id, "Ack for unknown batch");
                }
            }
            BridgeFrame::PluginCommand(cmd) => {
                let kernel = Arc::clone(&self.kernel);
                let control = self.control_tx.clone();
                let deadline = self.config.read().expect("config lock").command_deadline;
                tokio::spawn(async move {
                    let response =
                        match tokio::time::timeout(deadline, kernel.route_command(cmd.clone())).await {
                            Ok(response) => response,
                            Err(_) => PluginCommandResponse::fail(
                                &cmd,
                                "Timeout: command exceeded its 30s deadline",
                            ),
                        };
                    let _ = control.send(BridgeFrame::PluginCommandResponse(response));
                });
            }
            BridgeFrame::ResumeBreakpoint(payload) => {
                self.breakpoints.resolve(payload);
            }
            other => {
                debug!(frame = ?other, "Ignoring inbound frame");
            }
        }
    }

    /// Sleep through the backoff delay. Returns true on shutdown.
    async fn wait_backoff(
        &self,
        backoff: &mut Backoff,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.reconnect_notify.notified() => false,
            _ = shutdown_rx.changed() => *shutdown_rx.borrow_and_update(),
        }
    }

    /// Park after a registration rejection until reconfigured or stopped.
    /// Returns true on shutdown.
    async fn park_until_reconfigured(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.reconnect_notify.notified() => false,
            _ = shutdown_rx.changed() => *shutdown_rx.borrow_and_update(),
        }
    }
}
