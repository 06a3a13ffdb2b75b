//! EventBus: the slot registry between capture shims and plugins
//!
//! Host-platform capture shims (URL protocol hooks, log bridges, app
//! lifecycle observers) are external to this crate. They hand artifacts
//! to whichever plugin is currently active through the typed slots below.
//! Plugins install their tap on `start` and remove it on `stop`; a shim
//! firing while no tap is installed simply observes nothing.
//!
//! Slots hold `Arc<dyn Tap>` trait objects behind an `RwLock`, so
//! concurrent installers are serialized while the hot capture path takes
//! only a read lock.

use crate::types::{
    HttpRequestRecord, HttpResponseRecord, LogRecord, NetworkError, WsDirection, WsOpcode,
    WsSession,
};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// What the capture shim should do with an outbound request after the
/// intervene pipeline has run.
#[derive(Debug)]
pub enum RequestDirective {
    /// Send this (possibly modified) request over the network
    Proceed(HttpRequestRecord),
    /// Skip the network; this response was synthesized and the event has
    /// already been emitted
    Respond(HttpResponseRecord),
    /// Fail the request with this error; the event has already been emitted
    Fail(NetworkError),
}

/// HTTP capture tap: the intervene pipeline, installed by the network
/// plugin.
#[async_trait]
pub trait HttpTap: Send + Sync {
    /// Run the request-side stages. May suspend on a breakpoint.
    async fn process_request(&self, request: HttpRequestRecord) -> RequestDirective;

    /// Cheap pre-check: does any response-stage breakpoint rule match?
    /// When false the shim may skip buffering the full response body.
    fn has_response_breakpoint(&self, request: &HttpRequestRecord) -> bool;

    /// Run the response-side stages and emit the HTTP event. May suspend
    /// on a response breakpoint. `parent_id` links redirect children to
    /// the event they were redirected from.
    async fn process_response(
        &self,
        request: HttpRequestRecord,
        response: HttpResponseRecord,
        parent_id: Option<String>,
    );

    /// Record a transport failure observed by the shim and emit the event.
    fn report_failure(&self, request: HttpRequestRecord, error: NetworkError);
}

/// Log capture tap.
pub trait LogTap: Send + Sync {
    fn record(&self, record: LogRecord);
}

/// Result of passing a WebSocket frame through the tap: the payload to
/// actually deliver, plus mock bookkeeping for the emitted event.
#[derive(Debug)]
pub struct FrameOutcome {
    pub payload: Vec<u8>,
    pub is_mocked: bool,
    pub mock_rule_id: Option<String>,
}

/// WebSocket capture tap.
pub trait WsTap: Send + Sync {
    fn session_created(&self, session: WsSession);
    fn session_closed(&self, session: WsSession);

    /// Observe one frame; the shim must deliver the returned payload
    /// (which a mock rule may have replaced).
    fn frame(
        &self,
        session_id: &str,
        direction: WsDirection,
        opcode: WsOpcode,
        payload: Vec<u8>,
    ) -> FrameOutcome;
}

/// Page-timing capture tap.
pub trait TimingTap: Send + Sync {
    fn page_start(
        &self,
        visit_id: &str,
        page_id: &str,
        page_name: &str,
        route: Option<String>,
        is_cold_start: bool,
        is_push: Option<bool>,
        parent_page_id: Option<String>,
    );
    fn page_first_layout(&self, visit_id: &str);
    fn page_appear(&self, visit_id: &str);
    fn marker(&self, visit_id: &str, name: &str);
    fn page_end(&self, visit_id: &str);
}

macro_rules! slot_accessors {
    ($field:ident, $install:ident, $clear:ident, $get:ident, $trait:ident) => {
        pub fn $install(&self, tap: Arc<dyn $trait>) {
            *self.$field.write().expect("bus lock") = Some(tap);
        }

        pub fn $clear(&self) {
            *self.$field.write().expect("bus lock") = None;
        }

        pub fn $get(&self) -> Option<Arc<dyn $trait>> {
            self.$field.read().expect("bus lock").clone()
        }
    };
}

/// The slot registry. One instance per agent; no global state.
#[derive(Default)]
pub struct EventBus {
    http: RwLock<Option<Arc<dyn HttpTap>>>,
    log: RwLock<Option<Arc<dyn LogTap>>>,
    ws: RwLock<Option<Arc<dyn WsTap>>>,
    timing: RwLock<Option<Arc<dyn TimingTap>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    slot_accessors!(http, install_http, clear_http, http, HttpTap);
    slot_accessors!(log, install_log, clear_log, log, LogTap);
    slot_accessors!(ws, install_ws, clear_ws, ws, WsTap);
    slot_accessors!(timing, install_timing, clear_timing, timing, TimingTap);
}
