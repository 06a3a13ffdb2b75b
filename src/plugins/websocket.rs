//! WebSocket plugin: session and frame capture
//!
//! Keeps the session-to-URL map so every frame event carries the URL
//! captured at session creation. Frames are additionally run past the
//! mock engine's ws-outgoing / ws-incoming rules; a matching rule with a
//! payload replaces the frame and marks it mocked.

use crate::error::{ProbeError, Result};
use crate::event_bus::{FrameOutcome, WsTap};
use crate::kernel::{PluginContext, PluginDescriptor, ProbePlugin};
use crate::queue::EventEmitter;
use crate::rules::MockEngine;
use crate::types::{
    EventBody, PluginCommand, PluginCommandResponse, WsActivity, WsDirection, WsOpcode, WsSession,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const PLUGIN_ID: &str = "websocket";

struct WsCapture {
    emitter: EventEmitter,
    mock: Arc<MockEngine>,
    /// session id -> url, filled on creation, cleared on close
    sessions: Mutex<HashMap<String, String>>,
}

impl WsTap for WsCapture {
    fn session_created(&self, session: WsSession) {
        self.sessions
            .lock()
            .expect("session lock")
            .insert(session.session_id.clone(), session.url.clone());
        self.emitter.emit(EventBody::WebSocket(WsActivity::SessionCreated { session }));
    }

    fn session_closed(&self, session: WsSession) {
        self.sessions
            .lock()
            .expect("session lock")
            .remove(&session.session_id);
        self.emitter.emit(EventBody::WebSocket(WsActivity::SessionClosed { session }));
    }

    fn frame(
        &self,
        session_id: &str,
        direction: WsDirection,
        opcode: WsOpcode,
        payload: Vec<u8>,
    ) -> FrameOutcome {
        let url = self
            .sessions
            .lock()
            .expect("session lock")
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| {
                warn!(session_id, "Frame on unknown session");
                String::new()
            });

        // is_mocked only when a rule actually fabricated the payload
        let (payload, is_mocked, mock_rule_id) = match self.mock.match_frame(&url, direction) {
            Some(mocked) => (mocked.payload, true, Some(mocked.rule_id)),
            None => (payload, false, None),
        };

        self.emitter.emit(EventBody::WebSocket(WsActivity::Frame {
            session_id: session_id.to_string(),
            url,
            direction,
            opcode,
            payload: payload.clone(),
            is_mocked,
            mock_rule_id: mock_rule_id.clone(),
        }));

        FrameOutcome {
            payload,
            is_mocked,
            mock_rule_id,
        }
    }
}

#[derive(Default)]
pub struct WebSocketPlugin {
    ctx: Mutex<Option<Arc<PluginContext>>>,
    capture: Mutex<Option<Arc<WsCapture>>>,
}

impl WebSocketPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<Arc<PluginContext>> {
        self.ctx
            .lock()
            .expect("ctx lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("websocket plugin is not initialized"))
    }

    fn capture(&self) -> Result<Arc<WsCapture>> {
        self.capture
            .lock()
            .expect("capture lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("websocket plugin is not initialized"))
    }

    fn install(&self) -> Result<()> {
        self.ctx()?.bus.install_ws(self.capture()?);
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.ctx()?.bus.clear_ws();
        Ok(())
    }
}

#[async_trait]
impl ProbePlugin for WebSocketPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_ID, "WebSocket")
            .with_dependencies(vec![super::network::PLUGIN_ID.to_string()])
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()> {
        *self.capture.lock().expect("capture lock") = Some(Arc::new(WsCapture {
            emitter: ctx.emitter.clone(),
            mock: Arc::clone(&ctx.mock),
            sessions: Mutex::new(HashMap::new()),
        }));
        *self.ctx.lock().expect("ctx lock") = Some(ctx);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.install()
    }

    async fn stop(&self) -> Result<()> {
        self.uninstall()
    }

    async fn pause(&self) -> Result<()> {
        self.uninstall()
    }

    async fn resume(&self) -> Result<()> {
        self.install()
    }

    async fn handle_command(&self, cmd: &PluginCommand) -> PluginCommandResponse {
        match cmd.command_type.as_str() {
            "enable" => match self.install() {
                Ok(()) => PluginCommandResponse::ok(cmd, None),
                Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
            },
            "disable" => match self.uninstall() {
                Ok(()) => PluginCommandResponse::ok(cmd, None),
                Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
            },
            "get_status" => match (self.ctx(), self.capture()) {
                (Ok(ctx), Ok(capture)) => {
                    let open = capture.sessions.lock().expect("session lock").len();
                    PluginCommandResponse::ok(
                        cmd,
                        Some(json!({
                            "installed": ctx.bus.ws().is_some(),
                            "openSessions": open,
                        })),
                    )
                }
                _ => PluginCommandResponse::fail(cmd, "plugin is not initialized"),
            },
            other => PluginCommandResponse::fail(cmd, format!("unknown command '{other}'")),
        }
    }
}
