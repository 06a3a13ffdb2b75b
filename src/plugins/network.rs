//! Network plugin: HTTP capture and the intervene pipeline
//!
//! Owns the [`InterceptPipeline`] and installs it as the bus's HTTP tap
//! while running. Mock and chaos rule sets are managed through this
//! plugin's commands; the `engine` payload field selects which set a
//! rule command addresses.

use super::parse_payload;
use crate::error::{ProbeError, Result};
use crate::kernel::{PluginContext, PluginDescriptor, ProbePlugin};
use crate::pipeline::InterceptPipeline;
use crate::rules::{ChaosRule, MockRule};
use crate::types::{
    EventBody, HttpExchange, HttpRequestRecord, PluginCommand, PluginCommandResponse,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const PLUGIN_ID: &str = "network";

/// Which rule engine a rule command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EngineKind {
    Mock,
    Chaos,
}

#[derive(Deserialize)]
struct EngineSelector {
    engine: EngineKind,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveRulePayload {
    engine: EngineKind,
    rule_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetConfigPayload {
    #[serde(default)]
    max_body_bytes: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayPayload {
    request: HttpRequestRecord,
}

#[derive(Default)]
pub struct NetworkPlugin {
    ctx: Mutex<Option<Arc<PluginContext>>>,
    pipeline: Mutex<Option<Arc<InterceptPipeline>>>,
}

impl NetworkPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<Arc<PluginContext>> {
        self.ctx
            .lock()
            .expect("ctx lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("network plugin is not initialized"))
    }

    fn pipeline(&self) -> Result<Arc<InterceptPipeline>> {
        self.pipeline
            .lock()
            .expect("pipeline lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("network plugin is not initialized"))
    }

    fn install(&self) -> Result<()> {
        let ctx = self.ctx()?;
        ctx.bus.install_http(self.pipeline()?);
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.ctx()?.bus.clear_http();
        Ok(())
    }

    async fn replay(&self, cmd: &PluginCommand) -> PluginCommandResponse {
        let payload: ReplayPayload = match parse_payload(cmd) {
            Ok(p) => p,
            Err(e) => return PluginCommandResponse::fail(cmd, e),
        };
        let (ctx, pipeline) = match (self.ctx(), self.pipeline()) {
            (Ok(c), Ok(p)) => (c, p),
            _ => return PluginCommandResponse::fail(cmd, "plugin is not initialized"),
        };

        // The replayed exchange gets a fresh identity
        let mut request = payload.request;
        request.id = uuid::Uuid::new_v4().to_string();
        request.start_time = Utc::now();
        let request_id = request.id.clone();

        use crate::event_bus::{HttpTap, RequestDirective};
        let outcome = match pipeline.process_request(request).await {
            RequestDirective::Respond(resp) => json!({
                "requestId": request_id,
                "outcome": "responded",
                "statusCode": resp.status_code,
            }),
            RequestDirective::Fail(error) => json!({
                "requestId": request_id,
                "outcome": "failed",
                "category": error.category,
            }),
            RequestDirective::Proceed(request) => {
                // No intervention matched; the probe cannot reach the
                // network itself, so the replay is recorded unanswered
                ctx.emitter.emit(EventBody::Http(HttpExchange {
                    request,
                    response: None,
                    mock_rule_id: None,
                    parent_id: None,
                }));
                json!({"requestId": request_id, "outcome": "recorded"})
            }
        };
        PluginCommandResponse::ok(cmd, Some(outcome))
    }

    fn handle_rule_command(&self, cmd: &PluginCommand, ctx: &PluginContext) -> PluginCommandResponse {
        match cmd.command_type.as_str() {
            "update_rules" => {
                #[derive(Deserialize)]
                struct Update {
                    engine: EngineKind,
                    rules: serde_json::Value,
                }
                let update: Update = match parse_payload(cmd) {
                    Ok(u) => u,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                match update.engine {
                    EngineKind::Mock => match serde_json::from_value::<Vec<MockRule>>(update.rules) {
                        Ok(rules) => {
                            debug!(count = rules.len(), "Replacing mock rules");
                            ctx.mock.update(rules);
                        }
                        Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
                    },
                    EngineKind::Chaos => match serde_json::from_value::<Vec<ChaosRule>>(update.rules) {
                        Ok(rules) => {
                            debug!(count = rules.len(), "Replacing chaos rules");
                            ctx.chaos.update(rules);
                        }
                        Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
                    },
                }
                PluginCommandResponse::ok(cmd, None)
            }
            "add_rule" => {
                #[derive(Deserialize)]
                struct Add {
                    engine: EngineKind,
                    rule: serde_json::Value,
                }
                let add: Add = match parse_payload(cmd) {
                    Ok(a) => a,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                match add.engine {
                    EngineKind::Mock => match serde_json::from_value::<MockRule>(add.rule) {
                        Ok(rule) => ctx.mock.add(rule),
                        Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
                    },
                    EngineKind::Chaos => match serde_json::from_value::<ChaosRule>(add.rule) {
                        Ok(rule) => ctx.chaos.add(rule),
                        Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
                    },
                }
                PluginCommandResponse::ok(cmd, None)
            }
            "remove_rule" => {
                let remove: RemoveRulePayload = match parse_payload(cmd) {
                    Ok(r) => r,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                let removed = match remove.engine {
                    EngineKind::Mock => ctx.mock.remove(&remove.rule_id),
                    EngineKind::Chaos => ctx.chaos.remove(&remove.rule_id),
                };
                PluginCommandResponse::ok(cmd, Some(json!({"removed": removed})))
            }
            "get_rules" => {
                let selector: EngineSelector = match parse_payload(cmd) {
                    Ok(s) => s,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                let rules = match selector.engine {
                    EngineKind::Mock => serde_json::to_value(ctx.mock.snapshot()),
                    EngineKind::Chaos => serde_json::to_value(ctx.chaos.snapshot()),
                };
                match rules {
                    Ok(rules) => PluginCommandResponse::ok(cmd, Some(json!({"rules": rules}))),
                    Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
                }
            }
            _ => unreachable!("caller matched rule commands"),
        }
    }
}

#[async_trait]
impl ProbePlugin for NetworkPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_ID, "Network")
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()> {
        let pipeline = Arc::new(InterceptPipeline::new(
            Arc::clone(&ctx.mock),
            Arc::clone(&ctx.chaos),
            Arc::clone(&ctx.breakpoints),
            ctx.emitter.clone(),
            ctx.control.clone(),
        ));
        *self.pipeline.lock().expect("pipeline lock") = Some(pipeline);
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
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
        };

        match cmd.command_type.as_str() {
            "enable" => match self.install() {
                Ok(()) => PluginCommandResponse::ok(cmd, None),
                Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
            },
            "disable" => match self.uninstall() {
                Ok(()) => PluginCommandResponse::ok(cmd, None),
                Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
            },
            "get_status" => {
                let installed = ctx.bus.http().is_some();
                let max_body = self.pipeline().map(|p| p.max_body_bytes()).unwrap_or(0);
                PluginCommandResponse::ok(
                    cmd,
                    Some(json!({
                        "installed": installed,
                        "mockRules": ctx.mock.snapshot().len(),
                        "chaosRules": ctx.chaos.snapshot().len(),
                        "maxBodyBytes": max_body,
                    })),
                )
            }
            "set_config" => {
                let config: SetConfigPayload = match parse_payload(cmd) {
                    Ok(c) => c,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                if let Some(max) = config.max_body_bytes {
                    match self.pipeline() {
                        Ok(p) => p.set_max_body_bytes(max),
                        Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
                    }
                }
                PluginCommandResponse::ok(cmd, None)
            }
            "replay" => self.replay(cmd).await,
            "update_rules" | "add_rule" | "remove_rule" | "get_rules" => {
                self.handle_rule_command(cmd, &ctx)
            }
            other => PluginCommandResponse::fail(cmd, format!("unknown command '{other}'")),
        }
    }
}
