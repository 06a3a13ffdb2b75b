//! Core types for the debug probe
//!
//! Defines the data structures shared across the agent:
//! - Device identification
//! - Captured events (HTTP, log, WebSocket, page timing, stats)
//! - Plugin commands and responses
//!
//! Everything here crosses the bridge as JSON, so every type derives
//! Serialize/Deserialize with camelCase field names. Binary bodies are
//! carried as base64 strings inside JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable record describing the device/app the probe runs inside.
///
/// Built once by the host at startup and sent verbatim in the
/// `register_device` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Stable device identifier (vendor id or install id)
    pub device_id: String,
    /// Human-readable device name
    pub device_name: String,
    /// Hardware model (e.g. "iPhone15,2", "Pixel 8")
    pub model: String,
    pub os_name: String,
    pub os_version: String,
    /// Host application bundle/package identifier
    pub app_id: String,
    pub app_version: String,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            model: String::new(),
            os_name: String::new(),
            os_version: String::new(),
            app_id: String::new(),
            app_version: String::new(),
        }
    }
}

// ── HTTP events ─────────────────────────────────────────────────────

/// Failure classification shared by real transport errors and the
/// synthesized failures produced by chaos rules. Keeping one shape means
/// the hub renders both identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Timeout,
    Dns,
    Tls,
    Cancelled,
    Network,
    Http,
}

/// Structured network error attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkError {
    /// Error domain (host platform domain, or "DebugProbe.Chaos" for
    /// synthesized faults)
    pub domain: String,
    pub code: i64,
    pub category: ErrorCategory,
    pub is_network_error: bool,
    pub message: String,
}

impl NetworkError {
    pub fn new(domain: impl Into<String>, code: i64, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            category,
            is_network_error: true,
            message: message.into(),
        }
    }
}

/// One captured HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestRecord {
    /// Unique request id; also keys breakpoint waiters
    pub id: String,
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Full URL including scheme, host, path, query
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Request body as raw bytes (base64 on the wire)
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub start_time: DateTime<Utc>,
}

impl HttpRequestRecord {
    /// Create a new request record with a fresh id
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            start_time: Utc::now(),
        }
    }

    /// Add a header to the request
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the request body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Get a header value
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(key)
    }
}

/// One captured (or synthesized) HTTP response.
///
/// `status_code` is 0 when the request failed before any response was
/// received; `error` carries the failure in that case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseRecord {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NetworkError>,
}

impl HttpResponseRecord {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: Vec::new(),
            duration_ms: 0,
            error: None,
        }
    }

    /// A response record representing a transport failure
    pub fn failure(error: NetworkError, duration_ms: u64) -> Self {
        Self {
            status_code: 0,
            headers: HashMap::new(),
            body: Vec::new(),
            duration_ms,
            error: Some(error),
        }
    }
}

/// A complete HTTP exchange as shown on the hub timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpExchange {
    pub request: HttpRequestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponseRecord>,
    /// Id of the mock rule that produced the response, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_rule_id: Option<String>,
    /// For redirect chains: the id of the HTTP event this request was
    /// redirected from. The chain is reconstructed hub-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

// ── Log events ──────────────────────────────────────────────────────

/// Log severity, totally ordered from Verbose to Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    /// Parse a level name; unknown names come back as None
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "verbose" => Some(LogLevel::Verbose),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One captured log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub level: LogLevel,
    /// Producer of the record (e.g. "oslog", "stdout", "app")
    pub source: String,
    #[serde(default)]
    pub subsystem: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub thread: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub line: u32,
    pub message: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            source: "app".to_string(),
            subsystem: String::new(),
            category: String::new(),
            thread: String::new(),
            file: String::new(),
            function: String::new(),
            line: 0,
            message: message.into(),
            tags: Vec::new(),
            trace_id: None,
        }
    }
}

// ── WebSocket events ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsOpcode {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

/// A WebSocket session as seen by the capture shim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsSession {
    pub session_id: String,
    pub url: String,
    pub connect_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_time: Option<DateTime<Utc>>,
}

impl WsSession {
    pub fn new(session_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            url: url.into(),
            connect_time: Utc::now(),
            close_code: None,
            close_reason: None,
            disconnect_time: None,
        }
    }
}

/// WebSocket activity: a session lifecycle change or a single frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "wsKind", rename_all = "camelCase")]
pub enum WsActivity {
    SessionCreated {
        session: WsSession,
    },
    SessionClosed {
        session: WsSession,
    },
    #[serde(rename_all = "camelCase")]
    Frame {
        session_id: String,
        /// URL captured at session creation, carried on every frame
        url: String,
        direction: WsDirection,
        opcode: WsOpcode,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        /// True only when a mock rule fabricated/replaced the payload
        is_mocked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mock_rule_id: Option<String>,
    },
}

// ── Page timing events ──────────────────────────────────────────────

/// A user-supplied named marker inside a page visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitMarker {
    pub name: String,
    pub at: DateTime<Utc>,
}

/// Timing summary for one completed page visit.
///
/// Durations are derived from the timestamps when the visit ends; a
/// missing timestamp leaves the corresponding duration absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageTimingSummary {
    pub visit_id: String,
    pub page_id: String,
    pub page_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub start_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_layout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appear_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markers: Vec<VisitMarker>,
    pub is_cold_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_push: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appear_duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<i64>,
}

// ── Stats / performance events ──────────────────────────────────────

/// Agent-internal counters, emitted on each successful registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub events_enqueued: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub queue_depth: u64,
    pub bridge_state: String,
}

/// A single performance metric sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
}

// ── The event sum type ──────────────────────────────────────────────

/// Payload of a captured event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventBody {
    Http(HttpExchange),
    Log(LogRecord),
    WebSocket(WsActivity),
    PageTiming(PageTimingSummary),
    Stats(StatsSnapshot),
    Performance(PerformanceSample),
}

/// A captured event as it travels through the outbound queue.
///
/// Every event gets a unique id and a timestamp at emission and is
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl DebugEvent {
    pub fn new(body: EventBody) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            body,
        }
    }
}

// ── Plugin commands ─────────────────────────────────────────────────

/// A hub-originated command addressed to one plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginCommand {
    pub plugin_id: String,
    /// Correlation id; must round-trip unchanged into the response
    pub command_id: String,
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl PluginCommand {
    pub fn new(
        plugin_id: impl Into<String>,
        command_type: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type: command_type.into(),
            payload,
        }
    }
}

/// Response to a `PluginCommand`, correlated by `command_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginCommandResponse {
    pub plugin_id: String,
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PluginCommandResponse {
    /// Successful response carrying an optional payload
    pub fn ok(cmd: &PluginCommand, payload: Option<serde_json::Value>) -> Self {
        Self {
            plugin_id: cmd.plugin_id.clone(),
            command_id: cmd.command_id.clone(),
            success: true,
            payload,
            error_message: None,
        }
    }

    /// Failure response with a message
    pub fn fail(cmd: &PluginCommand, message: impl Into<String>) -> Self {
        Self {
            plugin_id: cmd.plugin_id.clone(),
            command_id: cmd.command_id.clone(),
            success: false,
            payload: None,
            error_message: Some(message.into()),
        }
    }
}

// Serde helper: binary payloads travel as base64 strings inside JSON
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_record_creation() {
        let req = HttpRequestRecord::new("GET", "https://api.example.com/users")
            .with_header("Authorization", "Bearer token")
            .with_body(b"test body".to_vec());

        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "https://api.example.com/users");
        assert_eq!(req.get_header("Authorization"), Some(&"Bearer token".to_string()));
        assert_eq!(req.body, b"test body");
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_request_body_is_base64_on_the_wire() {
        let req = HttpRequestRecord::new("POST", "https://api.example.com/data")
            .with_body(vec![0xFF, 0x00, 0x7F]);

        let json = serde_json::to_value(&req).unwrap();
        // Raw bytes must not leak into JSON; base64 of [0xFF, 0x00, 0x7F] is "/wB/"
        assert_eq!(json["body"], "/wB/");

        let back: HttpRequestRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, vec![0xFF, 0x00, 0x7F]);
    }

    #[test]
    fn test_device_info_round_trip_is_stable() {
        let device = DeviceInfo {
            device_id: "dev-1".to_string(),
            device_name: "Test Phone".to_string(),
            model: "Pixel 8".to_string(),
            os_name: "Android".to_string(),
            os_version: "14".to_string(),
            app_id: "com.example.app".to_string(),
            app_version: "1.2.3".to_string(),
        };

        let json = serde_json::to_string(&device).unwrap();
        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(device, back);

        // Encoding the decoded value again must be byte-for-byte stable
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Verbose < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("verbose"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::parse("nope"), None);
    }

    #[test]
    fn test_event_kind_tag_on_the_wire() {
        let event = DebugEvent::new(EventBody::Log(LogRecord::new(LogLevel::Info, "hello")));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "log");
        assert_eq!(json["level"], "info");
        assert_eq!(json["message"], "hello");
        assert!(json["eventId"].is_string());
    }

    #[test]
    fn test_ws_frame_serialization() {
        let activity = WsActivity::Frame {
            session_id: "s1".to_string(),
            url: "wss://example.com/socket".to_string(),
            direction: WsDirection::Send,
            opcode: WsOpcode::Text,
            payload: b"ping".to_vec(),
            is_mocked: false,
            mock_rule_id: None,
        };
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["wsKind"], "frame");
        assert_eq!(json["direction"], "send");
        assert_eq!(json["opcode"], "text");

        let back: WsActivity = serde_json::from_value(json).unwrap();
        assert_eq!(activity, back);
    }

    #[test]
    fn test_command_response_preserves_command_id() {
        let cmd = PluginCommand::new("network", "get_status", None);
        let resp = PluginCommandResponse::ok(&cmd, Some(serde_json::json!({"state": "running"})));
        assert_eq!(resp.command_id, cmd.command_id);
        assert!(resp.success);

        let resp = PluginCommandResponse::fail(&cmd, "boom");
        assert_eq!(resp.command_id, cmd.command_id);
        assert!(!resp.success);
        assert_eq!(resp.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_error_category_wire_names() {
        let err = NetworkError::new("DebugProbe.Chaos", -1001, ErrorCategory::Timeout, "timed out");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "timeout");
        assert_eq!(json["isNetworkError"], true);
    }
}
