//! Breakpoint plugin: rule management and hub-side resolution
//!
//! The engine itself is consulted by the intervene pipeline (owned by the
//! network plugin); this plugin is the command surface for its rules and
//! for `resume_breakpoint`. Disabling the plugin aborts every suspended
//! request so nothing stays frozen with nobody watching.

use super::parse_payload;
use crate::breakpoint::{BreakpointResumePayload, BreakpointRule};
use crate::error::{ProbeError, Result};
use crate::kernel::{PluginContext, PluginDescriptor, ProbePlugin};
use crate::types::{PluginCommand, PluginCommandResponse};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

pub const PLUGIN_ID: &str = "breakpoints";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveRulePayload {
    rule_id: String,
}

#[derive(Default)]
pub struct BreakpointPlugin {
    ctx: Mutex<Option<Arc<PluginContext>>>,
}

impl BreakpointPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<Arc<PluginContext>> {
        self.ctx
            .lock()
            .expect("ctx lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("breakpoint plugin is not initialized"))
    }
}

#[async_trait]
impl ProbePlugin for BreakpointPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_ID, "Breakpoints")
            .with_dependencies(vec![super::network::PLUGIN_ID.to_string()])
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()> {
        *self.ctx.lock().expect("ctx lock") = Some(ctx);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Nothing may stay suspended once the plugin goes away
        if let Ok(ctx) = self.ctx() {
            ctx.breakpoints.abort_all();
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if let Ok(ctx) = self.ctx() {
            ctx.breakpoints.abort_all();
        }
        Ok(())
    }

    async fn handle_command(&self, cmd: &PluginCommand) -> PluginCommandResponse {
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
        };

        match cmd.command_type.as_str() {
            "enable" => PluginCommandResponse::ok(cmd, None),
            "disable" => {
                ctx.breakpoints.abort_all();
                PluginCommandResponse::ok(cmd, None)
            }
            "get_status" => PluginCommandResponse::ok(
                cmd,
                Some(json!({
                    "rules": ctx.breakpoints.snapshot().len(),
                    "pending": ctx.breakpoints.pending(),
                })),
            ),
            "update_rules" => {
                #[derive(Deserialize)]
                struct Update {
                    rules: Vec<BreakpointRule>,
                }
                match parse_payload::<Update>(cmd) {
                    Ok(update) => {
                        ctx.breakpoints.update(update.rules);
                        PluginCommandResponse::ok(cmd, None)
                    }
                    Err(e) => PluginCommandResponse::fail(cmd, e),
                }
            }
            "add_rule" => {
                #[derive(Deserialize)]
                struct Add {
                    rule: BreakpointRule,
                }
                match parse_payload::<Add>(cmd) {
                    Ok(add) => {
                        ctx.breakpoints.add(add.rule);
                        PluginCommandResponse::ok(cmd, None)
                    }
                    Err(e) => PluginCommandResponse::fail(cmd, e),
                }
            }
            "remove_rule" => match parse_payload::<RemoveRulePayload>(cmd) {
                Ok(remove) => {
                    let removed = ctx.breakpoints.remove(&remove.rule_id);
                    PluginCommandResponse::ok(cmd, Some(json!({"removed": removed})))
                }
                Err(e) => PluginCommandResponse::fail(cmd, e),
            },
            "get_rules" => match serde_json::to_value(ctx.breakpoints.snapshot()) {
                Ok(rules) => PluginCommandResponse::ok(cmd, Some(json!({"rules": rules}))),
                Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
            },
            "resume_breakpoint" => match parse_payload::<BreakpointResumePayload>(cmd) {
                Ok(payload) => {
                    ctx.breakpoints.resolve(payload);
                    PluginCommandResponse::ok(cmd, None)
                }
                Err(e) => PluginCommandResponse::fail(cmd, e),
            },
            other => PluginCommandResponse::fail(cmd, format!("unknown command '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::BreakpointEngine;
    use crate::event_bus::EventBus;
    use crate::inspector::SqliteInspector;
    use crate::protocol::ControlSender;
    use crate::queue::{EventEmitter, EventQueue};
    use crate::rules::{ChaosEngine, MockEngine, RuleTarget};
    use crate::settings::MemorySettingsStore;
    use crate::types::DeviceInfo;
    use tokio::sync::Notify;

    fn context() -> Arc<PluginContext> {
        Arc::new(PluginContext {
            device: DeviceInfo::new("dev", "Dev"),
            settings: Arc::new(MemorySettingsStore::new()),
            emitter: EventEmitter::new(
                Arc::new(EventQueue::in_memory().unwrap()),
                Arc::new(Notify::new()),
            ),
            control: ControlSender::disconnected(),
            bus: Arc::new(EventBus::new()),
            mock: Arc::new(MockEngine::new()),
            chaos: Arc::new(ChaosEngine::new()),
            breakpoints: Arc::new(BreakpointEngine::new()),
            inspector: Arc::new(SqliteInspector::new()),
        })
    }

    #[tokio::test]
    async fn rule_commands_manage_the_engine() {
        let ctx = context();
        let plugin = BreakpointPlugin::new();
        plugin.initialize(Arc::clone(&ctx)).await.unwrap();

        let cmd = PluginCommand::new(
            PLUGIN_ID,
            "update_rules",
            Some(json!({"rules": [{"id": "b1", "urlPattern": "*", "target": "http-request"}]})),
        );
        assert!(plugin.handle_command(&cmd).await.success);
        assert_eq!(ctx.breakpoints.snapshot().len(), 1);
        assert_eq!(ctx.breakpoints.snapshot()[0].target, RuleTarget::HttpRequest);

        let cmd = PluginCommand::new(PLUGIN_ID, "remove_rule", Some(json!({"ruleId": "b1"})));
        let resp = plugin.handle_command(&cmd).await;
        assert!(resp.success);
        assert_eq!(resp.payload.unwrap()["removed"], true);
        assert!(ctx.breakpoints.snapshot().is_empty());
    }

    #[tokio::test]
    async fn resume_breakpoint_command_resolves_waiter() {
        let ctx = context();
        let plugin = BreakpointPlugin::new();
        plugin.initialize(Arc::clone(&ctx)).await.unwrap();

        let rx = ctx.breakpoints.register_waiter("req-1");
        let cmd = PluginCommand::new(
            PLUGIN_ID,
            "resume_breakpoint",
            Some(json!({"requestId": "req-1", "action": "resume"})),
        );
        assert!(plugin.handle_command(&cmd).await.success);

        let payload = rx.await.unwrap();
        assert_eq!(payload.action, "resume");
    }

    #[tokio::test]
    async fn disable_aborts_pending_waiters() {
        let ctx = context();
        let plugin = BreakpointPlugin::new();
        plugin.initialize(Arc::clone(&ctx)).await.unwrap();

        let rx = ctx.breakpoints.register_waiter("req-1");
        let cmd = PluginCommand::new(PLUGIN_ID, "disable", None);
        assert!(plugin.handle_command(&cmd).await.success);
        assert!(rx.await.is_err());
    }
}
