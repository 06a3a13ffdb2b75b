//! Bridge wire protocol
//!
//! JSON frames over the WebSocket, each of the form `{type, payload}`.
//! The tagged enum below serializes to exactly that shape. Timestamps
//! inside payloads are RFC 3339; binary data is base64.

use crate::breakpoint::{BreakpointResumePayload, BreakpointSnapshot};
use crate::types::{DebugEvent, DeviceInfo, PluginCommand, PluginCommandResponse};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Advertised plugin entry inside the registration payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisedPlugin {
    pub id: String,
    pub display_name: String,
    pub version: String,
}

/// Registration handshake sent immediately after socket open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    #[serde(flatten)]
    pub device: DeviceInfo,
    pub token: String,
    /// Fresh UUID per process start; lets the hub tell a reconnect from
    /// an app restart
    pub app_session_id: String,
    pub sdk_version: String,
    pub plugins: Vec<AdvertisedPlugin>,
}

/// One batch of events; deleted from the queue when the hub acks
/// `batch_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventsBatch {
    pub batch_id: String,
    pub events: Vec<DebugEvent>,
}

/// Every frame that crosses the bridge, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeFrame {
    RegisterDevice(RegisterDevice),
    RegisterAck(RegisterAckPayload),
    RegisterReject(RegisterRejectPayload),
    EventsBatch(EventsBatch),
    EventsAck(EventsAckPayload),
    PluginCommand(PluginCommand),
    PluginCommandResponse(PluginCommandResponse),
    BreakpointHit(BreakpointSnapshot),
    ResumeBreakpoint(BreakpointResumePayload),
    PluginStateChanged(PluginStateChangedPayload),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRejectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventsAckPayload {
    pub batch_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginStateChangedPayload {
    pub plugin_id: String,
    pub state: String,
}

/// One-way sender for control frames (breakpoint hits, state changes,
/// command responses). Frames sent while the bridge is down are dropped;
/// only queued events survive a disconnect.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<BridgeFrame>,
}

impl ControlSender {
    pub fn new(tx: mpsc::UnboundedSender<BridgeFrame>) -> Self {
        Self { tx }
    }

    /// A sender whose frames go nowhere; for tests and detached kernels.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn send(&self, frame: BridgeFrame) {
        // A closed channel just means the bridge is gone
        let _ = self.tx.send(frame);
    }
}
