//! Settings storage abstraction
//!
//! The probe never owns a preferences mechanism of its own: the host
//! supplies a [`SettingsStore`] backed by whatever its platform offers
//! (NSUserDefaults, SharedPreferences, a config file). An in-memory
//! implementation ships for tests and for hosts that do not care about
//! persistence.
//!
//! Resolution order for every setting: runtime store > host bundle
//! metadata > built-in default.

use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Preference keys used by the probe. The host may read `IS_ENABLED`
/// itself to decide whether to construct the agent at all.
pub mod keys {
    pub const HUB_HOST: &str = "DebugProbe.hubHost";
    pub const HUB_PORT: &str = "DebugProbe.hubPort";
    pub const TOKEN: &str = "DebugProbe.token";
    pub const IS_ENABLED: &str = "DebugProbe.isEnabled";
    pub const VERBOSE_LOGGING: &str = "DebugProbe.verboseLogging";

    /// Per-plugin enabled flag
    pub fn plugin_enabled(plugin_id: &str) -> String {
        format!("DebugProbe.plugin.{plugin_id}.isEnabled")
    }
}

/// Default hub host when nothing is configured.
pub const DEFAULT_HUB_HOST: &str = "127.0.0.1";
/// Default hub port. Historically 8081; the current hub listens on 9527.
pub const DEFAULT_HUB_PORT: u16 = 9527;

/// Trait for the host-provided preference store.
///
/// Values are opaque bytes; the probe encodes strings as UTF-8, booleans
/// as "true"/"false", and integers as decimal strings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Store a value under a key
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve a value; None if the key doesn't exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a key (idempotent)
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory settings store for tests and persistence-free hosts.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .expect("settings lock")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().expect("settings lock").get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().expect("settings lock").remove(key);
        Ok(())
    }
}

/// Layered settings view: runtime store, then bundle metadata, then
/// built-in defaults.
pub struct Settings {
    store: std::sync::Arc<dyn SettingsStore>,
    /// Static values baked into the host bundle (Info.plist entries,
    /// manifest metadata). Consulted when the runtime store has no value.
    bundle: HashMap<String, String>,
}

impl Settings {
    pub fn new(store: std::sync::Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            bundle: HashMap::new(),
        }
    }

    pub fn with_bundle(mut self, bundle: HashMap<String, String>) -> Self {
        self.bundle = bundle;
        self
    }

    pub fn store(&self) -> std::sync::Arc<dyn SettingsStore> {
        std::sync::Arc::clone(&self.store)
    }

    /// Resolve a string setting through the three layers.
    pub async fn resolve_string(&self, key: &str, default: &str) -> String {
        if let Ok(Some(bytes)) = self.store.get(key).await {
            if let Ok(s) = String::from_utf8(bytes) {
                return s;
            }
        }
        if let Some(s) = self.bundle.get(key) {
            return s.clone();
        }
        default.to_string()
    }

    pub async fn resolve_u16(&self, key: &str, default: u16) -> u16 {
        let raw = self.resolve_string(key, &default.to_string()).await;
        raw.trim().parse().unwrap_or(default)
    }

    pub async fn resolve_bool(&self, key: &str, default: bool) -> bool {
        let raw = self.resolve_string(key, if default { "true" } else { "false" }).await;
        matches!(raw.trim(), "true" | "1" | "yes")
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(key, value.as_bytes()).await
    }
}

/// Hub coordinates parsed from a `debughub://` configuration URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEndpoint {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

/// Parse a `debughub://<host>[:<port>]?token=<tok>` URL, typically
/// scanned from a QR code shown by the hub.
pub fn parse_hub_url(url: &str) -> Result<HubEndpoint> {
    const SCHEME: &str = "debughub://";
    let rest = url
        .strip_prefix(SCHEME)
        .ok_or_else(|| ProbeError::invalid_config(format!("not a debughub:// URL: {url}")))?;

    let (authority, query) = match rest.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (rest, None),
    };
    if authority.is_empty() {
        return Err(ProbeError::invalid_config("debughub URL has no host"));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| ProbeError::invalid_config(format!("invalid port in debughub URL: {p}")))?;
            (h.to_string(), port)
        }
        None => (authority.to_string(), DEFAULT_HUB_PORT),
    };
    if host.is_empty() {
        return Err(ProbeError::invalid_config("debughub URL has no host"));
    }

    let token = query.and_then(|q| {
        q.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    });

    Ok(HubEndpoint { host, port, token })
}
