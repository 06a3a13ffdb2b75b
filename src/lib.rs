//! DebugProbe - In-Process Debugging Agent
//!
//! Links into a host application, captures runtime artifacts (HTTP and
//! WebSocket traffic, logs, SQLite contents, page timings), streams them
//! over a persistent duplex WebSocket to an external hub, and accepts
//! commands back: mock responses, chaos faults, request breakpoints, and
//! read-only SQL.

pub mod agent;
pub mod breakpoint;
pub mod bridge;
pub mod error;
pub mod event_bus;
pub mod inspector;
pub mod kernel;
pub mod key_provider;
pub mod pipeline;
pub mod plugins;
pub mod protocol;
pub mod queue;
pub mod rules;
pub mod settings;
pub mod timing;
pub mod types;

pub use agent::{DebugProbe, ProbeStatus};
pub use breakpoint::{BreakpointEngine, BreakpointResumePayload, BreakpointRule};
pub use bridge::{Bridge, BridgeConfig, BridgeState};
pub use error::{ProbeError, Result};
pub use event_bus::{EventBus, HttpTap, LogTap, RequestDirective, TimingTap, WsTap};
pub use inspector::{DatabaseDescriptor, DbError, SqliteInspector};
pub use kernel::{PluginContext, PluginDescriptor, PluginKernel, PluginState, ProbePlugin};
pub use key_provider::{KeyProvider, StaticKeyProvider};
pub use pipeline::InterceptPipeline;
pub use queue::{EventEmitter, EventQueue};
pub use rules::{ChaosEngine, ChaosFault, ChaosRule, MockEngine, MockResponse, MockRule, RuleTarget};
pub use settings::{MemorySettingsStore, Settings, SettingsStore};
pub use timing::PageTimingRecorder;
pub use types::{
    DebugEvent, DeviceInfo, EventBody, HttpExchange, HttpRequestRecord, HttpResponseRecord,
    LogLevel, LogRecord, NetworkError, PluginCommand, PluginCommandResponse,
};
