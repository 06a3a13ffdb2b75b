//! Logger plugin: leveled log capture
//!
//! Installs a [`LogTap`] that filters records below a configurable
//! minimum level and forwards the rest to the outbound queue. A
//! thread-local re-entrancy flag suppresses recursion: a log record
//! produced while the tap itself is emitting is silently discarded.

use super::parse_payload;
use crate::error::{ProbeError, Result};
use crate::event_bus::LogTap;
use crate::kernel::{PluginContext, PluginDescriptor, ProbePlugin};
use crate::queue::EventEmitter;
use crate::types::{EventBody, LogLevel, LogRecord, PluginCommand, PluginCommandResponse};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::cell::Cell;
use std::sync::{Arc, Mutex};

pub const PLUGIN_ID: &str = "logger";

thread_local! {
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

struct LogCapture {
    emitter: EventEmitter,
    min_level: Mutex<LogLevel>,
}

impl LogTap for LogCapture {
    fn record(&self, record: LogRecord) {
        // Recursion guard: emitting may itself log (queue errors)
        let reentrant = IN_CAPTURE.with(|flag| flag.replace(true));
        if reentrant {
            return;
        }

        if record.level >= *self.min_level.lock().expect("level lock") {
            self.emitter.emit(EventBody::Log(record));
        }

        IN_CAPTURE.with(|flag| flag.set(false));
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoggerConfig {
    min_level: String,
}

#[derive(Default)]
pub struct LoggerPlugin {
    ctx: Mutex<Option<Arc<PluginContext>>>,
    capture: Mutex<Option<Arc<LogCapture>>>,
}

impl LoggerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<Arc<PluginContext>> {
        self.ctx
            .lock()
            .expect("ctx lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("logger plugin is not initialized"))
    }

    fn capture(&self) -> Result<Arc<LogCapture>> {
        self.capture
            .lock()
            .expect("capture lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("logger plugin is not initialized"))
    }

    fn install(&self) -> Result<()> {
        self.ctx()?.bus.install_log(self.capture()?);
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.ctx()?.bus.clear_log();
        Ok(())
    }
}

#[async_trait]
impl ProbePlugin for LoggerPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_ID, "Logs")
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()> {
        *self.capture.lock().expect("capture lock") = Some(Arc::new(LogCapture {
            emitter: ctx.emitter.clone(),
            min_level: Mutex::new(LogLevel::Verbose),
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
            "get_status" => {
                let (installed, level) = match (self.ctx(), self.capture()) {
                    (Ok(ctx), Ok(capture)) => (
                        ctx.bus.log().is_some(),
                        capture.min_level.lock().expect("level lock").as_str(),
                    ),
                    _ => return PluginCommandResponse::fail(cmd, "plugin is not initialized"),
                };
                PluginCommandResponse::ok(
                    cmd,
                    Some(json!({"installed": installed, "minLevel": level})),
                )
            }
            "set_config" => {
                let config: LoggerConfig = match parse_payload(cmd) {
                    Ok(c) => c,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                let Some(level) = LogLevel::parse(&config.min_level) else {
                    return PluginCommandResponse::fail(
                        cmd,
                        format!("unknown log level '{}'", config.min_level),
                    );
                };
                match self.capture() {
                    Ok(capture) => {
                        *capture.min_level.lock().expect("level lock") = level;
                        PluginCommandResponse::ok(cmd, None)
                    }
                    Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
                }
            }
            other => PluginCommandResponse::fail(cmd, format!("unknown command '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use tokio::sync::Notify;

    fn capture_with_queue() -> (Arc<LogCapture>, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::in_memory().unwrap());
        let capture = Arc::new(LogCapture {
            emitter: EventEmitter::new(Arc::clone(&queue), Arc::new(Notify::new())),
            min_level: Mutex::new(LogLevel::Verbose),
        });
        (capture, queue)
    }

    #[test]
    fn records_at_or_above_min_level_are_emitted() {
        let (capture, queue) = capture_with_queue();
        *capture.min_level.lock().unwrap() = LogLevel::Warning;

        capture.record(LogRecord::new(LogLevel::Info, "too quiet"));
        capture.record(LogRecord::new(LogLevel::Warning, "heard"));
        capture.record(LogRecord::new(LogLevel::Error, "also heard"));

        assert_eq!(queue.depth().unwrap(), 2);
    }

    #[test]
    fn reentrant_records_are_suppressed() {
        let (capture, queue) = capture_with_queue();

        // Simulate a record arriving while the tap is already capturing
        // on this thread
        IN_CAPTURE.with(|flag| flag.set(true));
        capture.record(LogRecord::new(LogLevel::Error, "recursive"));
        IN_CAPTURE.with(|flag| flag.set(false));
        assert_eq!(queue.depth().unwrap(), 0);

        // Normal captures still work afterwards
        capture.record(LogRecord::new(LogLevel::Error, "direct"));
        assert_eq!(queue.depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn set_config_changes_min_level() {
        use crate::breakpoint::BreakpointEngine;
        use crate::event_bus::EventBus;
        use crate::inspector::SqliteInspector;
        use crate::protocol::ControlSender;
        use crate::rules::{ChaosEngine, MockEngine};
        use crate::settings::MemorySettingsStore;
        use crate::types::DeviceInfo;

        let queue = Arc::new(EventQueue::in_memory().unwrap());
        let ctx = Arc::new(PluginContext {
            device: DeviceInfo::new("dev", "Dev"),
            settings: Arc::new(MemorySettingsStore::new()),
            emitter: EventEmitter::new(Arc::clone(&queue), Arc::new(Notify::new())),
            control: ControlSender::disconnected(),
            bus: Arc::new(EventBus::new()),
            mock: Arc::new(MockEngine::new()),
            chaos: Arc::new(ChaosEngine::new()),
            breakpoints: Arc::new(BreakpointEngine::new()),
            inspector: Arc::new(SqliteInspector::new()),
        });

        let plugin = LoggerPlugin::new();
        plugin.initialize(Arc::clone(&ctx)).await.unwrap();
        plugin.start().await.unwrap();

        let cmd = PluginCommand::new(PLUGIN_ID, "set_config", Some(json!({"minLevel": "error"})));
        assert!(plugin.handle_command(&cmd).await.success);

        let tap = ctx.bus.log().unwrap();
        tap.record(LogRecord::new(LogLevel::Warning, "dropped"));
        tap.record(LogRecord::new(LogLevel::Error, "kept"));
        assert_eq!(queue.depth().unwrap(), 1);

        let cmd = PluginCommand::new(PLUGIN_ID, "set_config", Some(json!({"minLevel": "nope"})));
        assert!(!plugin.handle_command(&cmd).await.success);
    }
}
