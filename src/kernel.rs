//! Plugin lifecycle kernel
//!
//! Owns every capture plugin: registration, dependency-ordered startup,
//! lifecycle verbs, and command routing. The registry map and the start
//! order live behind one mutex which is never held across a plugin verb;
//! each plugin additionally has its own transition lock so two verbs on
//! the same plugin cannot overlap.
//!
//! Start order is a depth-first topological sort over the declared
//! dependency edges with tri-color marking for cycle detection. Startup
//! fails fast on the first broken plugin (earlier plugins stay running);
//! teardown is best-effort in exact reverse start order.

use crate::breakpoint::BreakpointEngine;
use crate::error::{ProbeError, Result};
use crate::event_bus::EventBus;
use crate::inspector::SqliteInspector;
use crate::protocol::{BridgeFrame, ControlSender, PluginStateChangedPayload};
use crate::queue::EventEmitter;
use crate::rules::{ChaosEngine, MockEngine};
use crate::settings::{keys, SettingsStore};
use crate::types::{DeviceInfo, PluginCommand, PluginCommandResponse};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Lifecycle state of one plugin. Transitions are driven only by the
/// kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Uninitialized,
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    Error,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Uninitialized => "uninitialized",
            PluginState::Stopped => "stopped",
            PluginState::Starting => "starting",
            PluginState::Running => "running",
            PluginState::Paused => "paused",
            PluginState::Stopping => "stopping",
            PluginState::Error => "error",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static identity a plugin declares about itself.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub dependencies: Vec<String>,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Shared handles handed to every plugin at initialization. One context
/// per kernel run; no process-wide singletons.
pub struct PluginContext {
    pub device: DeviceInfo,
    pub settings: Arc<dyn SettingsStore>,
    /// One-way event emitter into the outbound queue
    pub emitter: EventEmitter,
    /// One-way sender for control frames (extra command responses,
    /// breakpoint hits)
    pub control: ControlSender,
    pub bus: Arc<EventBus>,
    pub mock: Arc<MockEngine>,
    pub chaos: Arc<ChaosEngine>,
    pub breakpoints: Arc<BreakpointEngine>,
    pub inspector: Arc<SqliteInspector>,
}

/// The handles the kernel assembles into a [`PluginContext`] when
/// `start_all` runs.
#[derive(Clone)]
pub struct ContextSeed {
    pub settings: Arc<dyn SettingsStore>,
    pub emitter: EventEmitter,
    pub control: ControlSender,
    pub bus: Arc<EventBus>,
    pub mock: Arc<MockEngine>,
    pub chaos: Arc<ChaosEngine>,
    pub breakpoints: Arc<BreakpointEngine>,
    pub inspector: Arc<SqliteInspector>,
}

/// A capture or intervention module managed by the kernel.
#[async_trait]
pub trait ProbePlugin: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    /// Called once per kernel start, before `start`.
    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()>;

    /// Install taps, begin capturing.
    async fn start(&self) -> Result<()>;

    /// Remove taps, stop capturing. Must be safe to call repeatedly.
    async fn stop(&self) -> Result<()>;

    /// Temporarily stop capturing without losing configuration.
    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    /// Handle a hub command addressed to this plugin.
    async fn handle_command(&self, cmd: &PluginCommand) -> PluginCommandResponse;
}

/// Snapshot row returned by `get_plugin_infos`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub state: String,
    pub dependencies: Vec<String>,
}

struct Slot {
    plugin: Arc<dyn ProbePlugin>,
    descriptor: PluginDescriptor,
    state: Mutex<PluginState>,
    /// Serializes lifecycle verbs on this plugin
    transitions: tokio::sync::Mutex<()>,
}

/// The kernel: registry + dependency-ordered state machine + command
/// router.
pub struct PluginKernel {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    start_order: Mutex<Vec<String>>,
    context: Mutex<Option<Arc<PluginContext>>>,
    started: AtomicBool,
    seed: ContextSeed,
}

impl PluginKernel {
    pub fn new(seed: ContextSeed) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            start_order: Mutex::new(Vec::new()),
            context: Mutex::new(None),
            started: AtomicBool::new(false),
            seed,
        }
    }

    /// Register a plugin. Only legal before `start_all`.
    pub fn register(&self, plugin: Arc<dyn ProbePlugin>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ProbeError::invalid_config(
                "plugins must be registered before start_all",
            ));
        }
        let descriptor = plugin.descriptor();
        let mut slots = self.slots.lock().expect("registry lock");
        if slots.contains_key(&descriptor.id) {
            return Err(ProbeError::DuplicatePluginId(descriptor.id));
        }
        debug!(plugin_id = %descriptor.id, "Registered plugin");
        slots.insert(
            descriptor.id.clone(),
            Arc::new(Slot {
                plugin,
                descriptor,
                state: Mutex::new(PluginState::Uninitialized),
                transitions: tokio::sync::Mutex::new(()),
            }),
        );
        Ok(())
    }

    fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots.lock().expect("registry lock").get(id).cloned()
    }

    fn set_state(&self, slot: &Slot, state: PluginState) {
        *slot.state.lock().expect("state lock") = state;
        self.seed.control.send(BridgeFrame::PluginStateChanged(PluginStateChangedPayload {
            plugin_id: slot.descriptor.id.clone(),
            state: state.as_str().to_string(),
        }));
    }

    /// Start every registered plugin in dependency order. Fails fast on
    /// the first failure, leaving earlier plugins running. Calling this
    /// again while running is a warning no-op.
    pub async fn start_all(&self, device: DeviceInfo) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("start_all called while already running, ignoring");
            return Ok(());
        }

        let order = {
            let slots = self.slots.lock().expect("registry lock");
            let descriptors: Vec<PluginDescriptor> =
                slots.values().map(|s| s.descriptor.clone()).collect();
            match resolve_start_order(&descriptors) {
                Ok(order) => order,
                Err(e) => {
                    self.started.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        };
        *self.start_order.lock().expect("order lock") = order.clone();

        let ctx = Arc::new(PluginContext {
            device,
            settings: Arc::clone(&self.seed.settings),
            emitter: self.seed.emitter.clone(),
            control: self.seed.control.clone(),
            bus: Arc::clone(&self.seed.bus),
            mock: Arc::clone(&self.seed.mock),
            chaos: Arc::clone(&self.seed.chaos),
            breakpoints: Arc::clone(&self.seed.breakpoints),
            inspector: Arc::clone(&self.seed.inspector),
        });
        *self.context.lock().expect("context lock") = Some(Arc::clone(&ctx));

        info!(order = ?order, "Starting plugins");
        for id in &order {
            let slot = self.slot(id).expect("ordered plugin registered");
            let _guard = slot.transitions.lock().await;
            self.set_state(&slot, PluginState::Starting);

            let result = async {
                slot.plugin.initialize(Arc::clone(&ctx)).await?;
                slot.plugin.start().await
            }
            .await;

            match result {
                Ok(()) => self.set_state(&slot, PluginState::Running),
                Err(cause) => {
                    error!(plugin_id = %id, error = %cause, "Plugin failed to start");
                    self.set_state(&slot, PluginState::Error);
                    return Err(ProbeError::start_failed(id.clone(), cause));
                }
            }
        }
        Ok(())
    }

    /// Stop every plugin in exact reverse start order, swallowing
    /// per-plugin errors, then clear the context.
    pub async fn stop_all(&self) {
        let order = self.start_order.lock().expect("order lock").clone();
        for id in order.iter().rev() {
            let Some(slot) = self.slot(id) else { continue };
            let _guard = slot.transitions.lock().await;
            let current = *slot.state.lock().expect("state lock");
            if !matches!(current, PluginState::Running | PluginState::Paused | PluginState::Error) {
                continue;
            }
            self.set_state(&slot, PluginState::Stopping);
            if let Err(e) = slot.plugin.stop().await {
                warn!(plugin_id = %id, error = %e, "Plugin stop failed, continuing teardown");
            }
            self.set_state(&slot, PluginState::Stopped);
        }
        *self.context.lock().expect("context lock") = None;
        self.started.store(false, Ordering::SeqCst);
        info!("All plugins stopped");
    }

    /// Pause every running plugin, forward order.
    pub async fn pause_all(&self) {
        let order = self.start_order.lock().expect("order lock").clone();
        for id in &order {
            let Some(slot) = self.slot(id) else { continue };
            let _guard = slot.transitions.lock().await;
            if *slot.state.lock().expect("state lock") != PluginState::Running {
                continue;
            }
            match slot.plugin.pause().await {
                Ok(()) => self.set_state(&slot, PluginState::Paused),
                Err(e) => {
                    warn!(plugin_id = %id, error = %e, "Plugin pause failed");
                    self.set_state(&slot, PluginState::Error);
                }
            }
        }
    }

    /// Resume every paused plugin, forward order.
    pub async fn resume_all(&self) {
        let order = self.start_order.lock().expect("order lock").clone();
        for id in &order {
            let Some(slot) = self.slot(id) else { continue };
            let _guard = slot.transitions.lock().await;
            if *slot.state.lock().expect("state lock") != PluginState::Paused {
                continue;
            }
            match slot.plugin.resume().await {
                Ok(()) => self.set_state(&slot, PluginState::Running),
                Err(e) => {
                    warn!(plugin_id = %id, error = %e, "Plugin resume failed");
                    self.set_state(&slot, PluginState::Error);
                }
            }
        }
    }

    /// Request-level enable/disable for one plugin. Disabling pauses a
    /// running plugin (never stops it, so its configuration survives);
    /// enabling resumes a paused one or starts a stopped one. The
    /// per-plugin preference key is updated; the app-wide enabled key is
    /// not touched.
    pub async fn set_plugin_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let slot = self
            .slot(id)
            .ok_or_else(|| ProbeError::PluginNotFound(id.to_string()))?;
        let _guard = slot.transitions.lock().await;
        let current = *slot.state.lock().expect("state lock");

        if enabled {
            match current {
                PluginState::Paused => {
                    slot.plugin.resume().await.map_err(|e| {
                        self.set_state(&slot, PluginState::Error);
                        ProbeError::start_failed(id, e)
                    })?;
                    self.set_state(&slot, PluginState::Running);
                }
                PluginState::Stopped | PluginState::Uninitialized => {
                    let ctx = self.context.lock().expect("context lock").clone();
                    let Some(ctx) = ctx else {
                        return Err(ProbeError::invalid_config("kernel is not started"));
                    };
                    if current == PluginState::Uninitialized {
                        slot.plugin.initialize(ctx).await.map_err(|e| {
                            self.set_state(&slot, PluginState::Error);
                            ProbeError::start_failed(id, e)
                        })?;
                    }
                    slot.plugin.start().await.map_err(|e| {
                        self.set_state(&slot, PluginState::Error);
                        ProbeError::start_failed(id, e)
                    })?;
                    self.set_state(&slot, PluginState::Running);
                }
                _ => debug!(plugin_id = %id, state = %current, "enable is a no-op"),
            }
        } else if current == PluginState::Running {
            slot.plugin.pause().await.map_err(|e| {
                self.set_state(&slot, PluginState::Error);
                ProbeError::start_failed(id, e)
            })?;
            self.set_state(&slot, PluginState::Paused);
        }

        // Persist the per-plugin flag; best-effort
        let value = if enabled { "true" } else { "false" };
        if let Err(e) = self
            .seed
            .settings
            .set(&keys::plugin_enabled(id), value.as_bytes())
            .await
        {
            warn!(plugin_id = %id, error = %e, "Failed to persist plugin enabled flag");
        }
        Ok(())
    }

    /// Route a hub command to its plugin. Unknown plugin ids produce a
    /// failure response rather than an error.
    pub async fn route_command(&self, cmd: PluginCommand) -> PluginCommandResponse {
        match self.slot(&cmd.plugin_id) {
            Some(slot) => slot.plugin.handle_command(&cmd).await,
            None => PluginCommandResponse::fail(
                &cmd,
                format!("PluginNotFound: no plugin with id '{}'", cmd.plugin_id),
            ),
        }
    }

    /// Snapshot of every plugin's identity and state.
    pub fn get_plugin_infos(&self) -> Vec<PluginInfo> {
        let slots = self.slots.lock().expect("registry lock");
        let mut infos: Vec<PluginInfo> = slots
            .values()
            .map(|slot| PluginInfo {
                id: slot.descriptor.id.clone(),
                display_name: slot.descriptor.display_name.clone(),
                version: slot.descriptor.version.clone(),
                state: slot.state.lock().expect("state lock").as_str().to_string(),
                dependencies: slot.descriptor.dependencies.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// State of one plugin, if registered.
    pub fn plugin_state(&self, id: &str) -> Option<PluginState> {
        self.slot(id).map(|s| *s.state.lock().expect("state lock"))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

// ── Dependency resolution ───────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Depth-first topological sort with tri-color cycle detection.
/// Dependencies land before their dependents; roots are visited in id
/// order so the result is deterministic.
pub fn resolve_start_order(descriptors: &[PluginDescriptor]) -> Result<Vec<String>> {
    let deps: HashMap<&str, &[String]> = descriptors
        .iter()
        .map(|d| (d.id.as_str(), d.dependencies.as_slice()))
        .collect();

    let mut colors: HashMap<&str, Color> = descriptors
        .iter()
        .map(|d| (d.id.as_str(), Color::White))
        .collect();
    let mut order = Vec::with_capacity(descriptors.len());

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        colors: &mut HashMap<&'a str, Color>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        colors.insert(id, Color::Grey);
        for dep in deps[id] {
            match colors.get(dep.as_str()) {
                None => {
                    return Err(ProbeError::MissingDependency {
                        plugin: id.to_string(),
                        dependency: dep.clone(),
                    })
                }
                Some(Color::Grey) => return Err(ProbeError::CircularDependency(dep.clone())),
                Some(Color::Black) => {}
                Some(Color::White) => {
                    // Borrow dance: the dep str must outlive this frame
                    let dep_key = *deps.get_key_value(dep.as_str()).expect("checked above").0;
                    visit(dep_key, deps, colors, order)?;
                }
            }
        }
        colors.insert(id, Color::Black);
        order.push(id.to_string());
        Ok(())
    }

    let mut roots: Vec<&str> = deps.keys().copied().collect();
    roots.sort_unstable();
    for id in roots {
        if colors[id] == Color::White {
            visit(id, &deps, &mut colors, &mut order)?;
        }
    }
    Ok(order)
}
