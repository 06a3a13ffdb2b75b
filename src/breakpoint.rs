//! Breakpoint engine: freeze requests mid-flight until the hub resolves them
//!
//! Matching is the same priority-ordered walk as the other rule engines,
//! and is deliberately cheap (pattern test only). Only when a rule matches
//! does the pipeline allocate a one-shot waiter keyed by the request id,
//! emit a `breakpoint_hit` frame, and suspend. The hub answers with
//! `resume_breakpoint`; the engine completes the waiter with the chosen
//! action. No lock is ever held across the wait, and dropping a waiter's
//! sender (engine shutdown, bridge disconnect) resolves the suspended
//! caller as Abort.

use crate::rules::{url_pattern_matches, RuleLike, RuleSet, RuleTarget};
use crate::types::{HttpRequestRecord, HttpResponseRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One breakpoint rule. HTTP only; `target` selects the request or the
/// response stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRule {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub target: RuleTarget,
}

fn default_enabled() -> bool {
    true
}

impl RuleLike for BreakpointRule {
    fn id(&self) -> &str {
        &self.id
    }
    fn priority(&self) -> i32 {
        self.priority
    }
}

/// What the hub asked the suspended request to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointAction {
    Resume,
    Abort,
    Modify,
}

impl BreakpointAction {
    /// Parse a hub-supplied action name. "continue" is accepted as an
    /// alias for "resume"; unknown actions default to resume.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "resume" | "continue" => BreakpointAction::Resume,
            "abort" => BreakpointAction::Abort,
            "modify" => BreakpointAction::Modify,
            other => {
                warn!(action = other, "Unknown breakpoint action, defaulting to resume");
                BreakpointAction::Resume
            }
        }
    }
}

/// Snapshot sent to the hub when a breakpoint fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointSnapshot {
    pub request_id: String,
    pub rule_id: String,
    pub stage: RuleTarget,
    pub request: HttpRequestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponseRecord>,
}

/// The hub's answer to a breakpoint hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResumePayload {
    pub request_id: String,
    /// One of continue | resume | abort | modify
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_request: Option<HttpRequestRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_response: Option<HttpResponseRecord>,
}

/// Breakpoint rules plus the map of outstanding waiters.
pub struct BreakpointEngine {
    rules: RuleSet<BreakpointRule>,
    waiters: Mutex<HashMap<String, oneshot::Sender<BreakpointResumePayload>>>,
}

impl Default for BreakpointEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointEngine {
    pub fn new() -> Self {
        Self {
            rules: RuleSet::new(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(&self, rules: Vec<BreakpointRule>) {
        self.rules.update(rules);
    }

    pub fn add(&self, rule: BreakpointRule) {
        self.rules.add(rule);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.rules.remove(id)
    }

    pub fn snapshot(&self) -> Vec<BreakpointRule> {
        self.rules.snapshot()
    }

    fn first_match(&self, url: &str, method: &str, stage: RuleTarget) -> Option<String> {
        for rule in self.rules.snapshot() {
            if !rule.enabled || rule.target != stage {
                continue;
            }
            if let Some(m) = &rule.method {
                if !m.eq_ignore_ascii_case(method) {
                    continue;
                }
            }
            let url_ok = rule
                .url_pattern
                .as_deref()
                .map(|p| url_pattern_matches(p, url))
                .unwrap_or(true);
            if url_ok {
                return Some(rule.id);
            }
        }
        None
    }

    /// Id of the first request-stage rule matching this request, if any.
    /// This is the hot-path check: pattern evaluation only, no allocation
    /// of waiters.
    pub fn match_request(&self, url: &str, method: &str) -> Option<String> {
        self.first_match(url, method, RuleTarget::HttpRequest)
    }

    /// Id of the first response-stage rule matching, if any.
    pub fn match_response(&self, url: &str, method: &str) -> Option<String> {
        self.first_match(url, method, RuleTarget::HttpResponse)
    }

    /// Whether any enabled response-stage rule matches this request.
    ///
    /// Capture shims call this before buffering a response body; when it
    /// is false the full-body buffering can be skipped.
    pub fn has_response_rule(&self, url: &str, method: &str) -> bool {
        self.match_response(url, method).is_some()
    }

    /// Register a waiter for a suspended request. The returned receiver
    /// completes when the hub resolves the breakpoint; if the sender is
    /// dropped first (shutdown, disconnect) the receiver's error is
    /// treated as Abort by the caller.
    pub fn register_waiter(&self, request_id: &str) -> oneshot::Receiver<BreakpointResumePayload> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("waiter lock");
        if waiters.insert(request_id.to_string(), tx).is_some() {
            warn!(request_id, "Replacing existing breakpoint waiter");
        }
        rx
    }

    /// Remove a waiter without resolving it (host cancelled the request).
    /// Dropping the sender completes the receiver as Abort.
    pub fn cancel_waiter(&self, request_id: &str) {
        self.waiters.lock().expect("waiter lock").remove(request_id);
    }

    /// Resolve a suspended request with the hub's answer. Unknown request
    /// ids are logged and ignored (the request may have been cancelled).
    pub fn resolve(&self, payload: BreakpointResumePayload) {
        let sender = self
            .waiters
            .lock()
            .expect("waiter lock")
            .remove(&payload.request_id);
        match sender {
            Some(tx) => {
                debug!(request_id = %payload.request_id, action = %payload.action, "Resolving breakpoint");
                let _ = tx.send(payload);
            }
            None => {
                warn!(request_id = %payload.request_id, "resume_breakpoint for unknown request");
            }
        }
    }

    /// Abort every outstanding waiter. Called on bridge disconnect and on
    /// shutdown; dropping the senders completes all receivers as Abort.
    pub fn abort_all(&self) {
        let mut waiters = self.waiters.lock().expect("waiter lock");
        if !waiters.is_empty() {
            warn!(count = waiters.len(), "Aborting outstanding breakpoint waiters");
        }
        waiters.clear();
    }

    /// Number of requests currently suspended.
    pub fn pending(&self) -> usize {
        self.waiters.lock().expect("waiter lock").len()
    }
}
