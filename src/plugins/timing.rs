//! Page-timing plugin
//!
//! Thin lifecycle wrapper around [`PageTimingRecorder`]: builds the
//! recorder at initialization and publishes it as the bus's timing tap
//! while running.

use crate::error::{ProbeError, Result};
use crate::kernel::{PluginContext, PluginDescriptor, ProbePlugin};
use crate::timing::PageTimingRecorder;
use crate::types::{PluginCommand, PluginCommandResponse};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};

pub const PLUGIN_ID: &str = "timing";

#[derive(Default)]
pub struct TimingPlugin {
    ctx: Mutex<Option<Arc<PluginContext>>>,
    recorder: Mutex<Option<Arc<PageTimingRecorder>>>,
}

impl TimingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<Arc<PluginContext>> {
        self.ctx
            .lock()
            .expect("ctx lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("timing plugin is not initialized"))
    }

    fn recorder(&self) -> Result<Arc<PageTimingRecorder>> {
        self.recorder
            .lock()
            .expect("recorder lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("timing plugin is not initialized"))
    }

    fn install(&self) -> Result<()> {
        self.ctx()?.bus.install_timing(self.recorder()?);
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.ctx()?.bus.clear_timing();
        Ok(())
    }
}

#[async_trait]
impl ProbePlugin for TimingPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_ID, "Page Timing")
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()> {
        *self.recorder.lock().expect("recorder lock") =
            Some(Arc::new(PageTimingRecorder::new(ctx.emitter.clone())));
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
            "get_status" => match (self.ctx(), self.recorder()) {
                (Ok(ctx), Ok(recorder)) => PluginCommandResponse::ok(
                    cmd,
                    Some(json!({
                        "installed": ctx.bus.timing().is_some(),
                        "openVisits": recorder.open_visits(),
                    })),
                ),
                _ => PluginCommandResponse::fail(cmd, "plugin is not initialized"),
            },
            other => PluginCommandResponse::fail(cmd, format!("unknown command '{other}'")),
        }
    }
}
