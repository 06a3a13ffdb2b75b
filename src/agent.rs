//! The agent object
//!
//! One `DebugProbe` per host process: it owns the rule engines, the
//! event bus, the inspector, the plugin kernel, and the bridge, and
//! passes explicit handles to everything through the plugin context.
//! There is no process-wide state; tests instantiate an isolated agent
//! per case.

use crate::breakpoint::BreakpointEngine;
use crate::bridge::{Bridge, BridgeConfig, BridgeState};
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::inspector::{DatabaseDescriptor, SqliteInspector};
use crate::kernel::{ContextSeed, PluginInfo, PluginKernel};
use crate::key_provider::KeyProvider;
use crate::plugins::{
    BreakpointPlugin, DatabasePlugin, LoggerPlugin, NetworkPlugin, TimingPlugin, WebSocketPlugin,
};
use crate::queue::{EventEmitter, EventQueue};
use crate::settings::{keys, parse_hub_url, Settings, DEFAULT_HUB_HOST, DEFAULT_HUB_PORT};
use crate::types::{DeviceInfo, StatsSnapshot};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// Snapshot of the agent's health, for the host's debug UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    pub bridge_state: String,
    pub queue: StatsSnapshot,
    pub plugins: Vec<PluginInfo>,
}

/// The in-process debugging agent.
pub struct DebugProbe {
    device: DeviceInfo,
    settings: Settings,
    bus: Arc<EventBus>,
    mock: Arc<crate::rules::MockEngine>,
    chaos: Arc<crate::rules::ChaosEngine>,
    breakpoints: Arc<BreakpointEngine>,
    inspector: Arc<SqliteInspector>,
    queue: Arc<EventQueue>,
    emitter: EventEmitter,
    kernel: Arc<PluginKernel>,
    bridge: Arc<Bridge>,
    bridge_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DebugProbe {
    /// Build an agent with an in-memory event queue.
    pub fn new(device: DeviceInfo, settings: Settings) -> Result<Self> {
        Self::build(device, settings, EventQueue::in_memory()?)
    }

    /// Build an agent whose event queue persists at `queue_path`
    /// (at-least-once delivery across restarts).
    pub fn with_queue_path(device: DeviceInfo, settings: Settings, queue_path: &Path) -> Result<Self> {
        Self::build(device, settings, EventQueue::open(queue_path)?)
    }

    fn build(device: DeviceInfo, settings: Settings, queue: EventQueue) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let mock = Arc::new(crate::rules::MockEngine::new());
        let chaos = Arc::new(crate::rules::ChaosEngine::new());
        let breakpoints = Arc::new(BreakpointEngine::new());
        let inspector = Arc::new(SqliteInspector::new());
        let queue = Arc::new(queue);
        let wakeup = Arc::new(Notify::new());
        let emitter = EventEmitter::new(Arc::clone(&queue), Arc::clone(&wakeup));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let control = crate::protocol::ControlSender::new(control_tx.clone());

        let kernel = Arc::new(PluginKernel::new(ContextSeed {
            settings: settings.store(),
            emitter: emitter.clone(),
            control,
            bus: Arc::clone(&bus),
            mock: Arc::clone(&mock),
            chaos: Arc::clone(&chaos),
            breakpoints: Arc::clone(&breakpoints),
            inspector: Arc::clone(&inspector),
        }));

        // The fixed built-in plugin set
        kernel.register(Arc::new(NetworkPlugin::new()))?;
        kernel.register(Arc::new(LoggerPlugin::new()))?;
        kernel.register(Arc::new(WebSocketPlugin::new()))?;
        kernel.register(Arc::new(BreakpointPlugin::new()))?;
        kernel.register(Arc::new(DatabasePlugin::new()))?;
        kernel.register(Arc::new(TimingPlugin::new()))?;

        let bridge = Arc::new(Bridge::new(
            BridgeConfig::default(),
            Arc::clone(&queue),
            wakeup,
            Arc::clone(&kernel),
            Arc::clone(&breakpoints),
            control_tx,
            control_rx,
        ));

        Ok(Self {
            device,
            settings,
            bus,
            mock,
            chaos,
            breakpoints,
            inspector,
            queue,
            emitter,
            kernel,
            bridge,
            bridge_task: Mutex::new(None),
        })
    }

    /// Start the kernel and open the bridge. Honors the app-level
    /// enabled preference: a disabled probe starts nothing.
    pub async fn start(&self) -> Result<()> {
        eprintln!("DIAG: start() enter");
        if !self.settings.resolve_bool(keys::IS_ENABLED, true).await {
            info!("DebugProbe is disabled by preference, not starting");
            return Ok(());
        }
        eprintln!("DIAG: enabled check done");

        let host = self.settings.resolve_string(keys::HUB_HOST, DEFAULT_HUB_HOST).await;
        let port = self.settings.resolve_u16(keys::HUB_PORT, DEFAULT_HUB_PORT).await;
        let token = self.settings.resolve_string(keys::TOKEN, "").await;
        self.bridge.configure(host, port, Some(token));
        eprintln!("DIAG: bridge configured");

        self.kernel.start_all(self.device.clone()).await?;
        eprintln!("DIAG: kernel.start_all done");

        let mut task = self.bridge_task.lock().expect("task lock");
        if task.is_none() {
            let bridge = Arc::clone(&self.bridge);
            let device = self.device.clone();
            *task = Some(tokio::spawn(bridge.run(device)));
            eprintln!("DIAG: bridge task spawned");
        }
        Ok(())
    }

    /// Close the bridge and tear the kernel down (reverse start order).
    pub async fn stop(&self) {
        self.bridge.stop();
        let task = self.bridge_task.lock().expect("task lock").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Bridge task ended abnormally");
            }
        }
        self.kernel.stop_all().await;
    }

    /// Apply a `debughub://` configuration URL (QR scan): persists the
    /// coordinates and reconnects the bridge.
    pub async fn apply_config_url(&self, url: &str) -> Result<()> {
        let endpoint = parse_hub_url(url)?;
        self.settings.set_string(keys::HUB_HOST, &endpoint.host).await?;
        self.settings.set_string(keys::HUB_PORT, &endpoint.port.to_string()).await?;
        if let Some(token) = &endpoint.token {
            self.settings.set_string(keys::TOKEN, token).await?;
        }
        self.bridge.update_config(endpoint.host, endpoint.port, endpoint.token);
        Ok(())
    }

    /// Register a host database for inspection.
    pub fn register_database(
        &self,
        descriptor: DatabaseDescriptor,
        key_provider: Option<Arc<dyn KeyProvider>>,
    ) {
        self.inspector.register(descriptor, key_provider);
    }

    pub fn status(&self) -> ProbeStatus {
        let state = self.bridge.state();
        ProbeStatus {
            bridge_state: state.as_str().to_string(),
            queue: self.queue.stats(state.as_str()),
            plugins: self.kernel.get_plugin_infos(),
        }
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.bridge.state()
    }

    // ── Handles for capture shims and hosts ─────────────────────────

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn kernel(&self) -> &Arc<PluginKernel> {
        &self.kernel
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn inspector(&self) -> &Arc<SqliteInspector> {
        &self.inspector
    }

    pub fn mock_engine(&self) -> &Arc<crate::rules::MockEngine> {
        &self.mock
    }

    pub fn chaos_engine(&self) -> &Arc<crate::rules::ChaosEngine> {
        &self.chaos
    }

    pub fn breakpoint_engine(&self) -> &Arc<BreakpointEngine> {
        &self.breakpoints
    }

    /// Direct emitter, for host-side custom events.
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }
}
