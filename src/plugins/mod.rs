//! Built-in plugins
//!
//! The fixed plugin set the agent constructs at startup:
//! - `network`: HTTP capture + the intervene pipeline, mock/chaos rules
//! - `breakpoints`: request/response freezing, resolved from the hub
//! - `websocket`: session and frame capture with frame mocking
//! - `logger`: leveled log capture
//! - `database`: the SQLite inspector command surface
//! - `timing`: page visit timing
//!
//! Every plugin answers `enable`, `disable` and `get_status`; rule-set
//! plugins additionally answer `update_rules`, `add_rule`, `remove_rule`
//! and `get_rules`.

mod breakpoints;
mod database;
mod logger;
mod network;
mod timing;
mod websocket;

pub use breakpoints::BreakpointPlugin;
pub use database::{DatabasePlugin, DbCommand, DbResponse};
pub use logger::LoggerPlugin;
pub use network::NetworkPlugin;
pub use timing::TimingPlugin;
pub use websocket::WebSocketPlugin;

use crate::types::PluginCommand;
use serde::de::DeserializeOwned;

/// Parse a command payload into a typed value, with a readable error for
/// the failure response.
pub(crate) fn parse_payload<T: DeserializeOwned>(cmd: &PluginCommand) -> Result<T, String> {
    let payload = cmd
        .payload
        .clone()
        .ok_or_else(|| format!("command '{}' requires a payload", cmd.command_type))?;
    serde_json::from_value(payload)
        .map_err(|e| format!("invalid payload for '{}': {e}", cmd.command_type))
}
