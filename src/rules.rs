//! Rule engines for mock and chaos interventions
//!
//! All rule engines share the same structure: an in-memory vector kept
//! sorted by priority (descending, insertion order breaking ties) under a
//! single mutex, replaced atomically by `update` or mutated one rule at a
//! time. Matching walks the sorted vector and takes the first enabled rule
//! whose URL pattern, method filter, and target agree with the request.
//!
//! URL patterns containing `*` are compiled to a regex at match time
//! (`.` escaped, `*` becomes `.*`); patterns without a wildcard match by
//! substring against the absolute URL.

use crate::types::{HttpRequestRecord, WsDirection};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// What a rule applies to. Chaos and breakpoint rules only use the HTTP
/// targets; mock rules may additionally target WebSocket frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleTarget {
    HttpRequest,
    HttpResponse,
    WsOutgoing,
    WsIncoming,
}

/// Match a rule URL pattern against an absolute URL.
///
/// With a `*` the pattern becomes a regex (dots escaped, `*` -> `.*`);
/// without one it is a plain substring test.
pub fn url_pattern_matches(pattern: &str, url: &str) -> bool {
    if pattern.contains('*') {
        let escaped = pattern.replace('.', "\\.").replace('*', ".*");
        match Regex::new(&escaped) {
            Ok(re) => re.is_match(url),
            Err(e) => {
                warn!(pattern, error = %e, "Unusable URL pattern, treating as non-match");
                false
            }
        }
    } else {
        url.contains(pattern)
    }
}

fn method_matches(filter: &Option<String>, method: &str) -> bool {
    match filter {
        Some(m) => m.eq_ignore_ascii_case(method),
        None => true,
    }
}

// ── Shared ordered storage ──────────────────────────────────────────

/// Minimal interface the shared storage needs from a rule.
pub(crate) trait RuleLike {
    fn id(&self) -> &str;
    fn priority(&self) -> i32;
}

/// Priority-ordered rule storage shared by the three engines.
///
/// Rules are kept sorted by priority descending; the insertion sequence
/// number breaks ties so that re-sorting is stable across updates.
pub(crate) struct RuleSet<R> {
    inner: Mutex<RuleSetInner<R>>,
}

struct RuleSetInner<R> {
    rules: Vec<(u64, R)>,
    next_seq: u64,
}

impl<R: RuleLike + Clone> RuleSet<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RuleSetInner {
                rules: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    fn sort(rules: &mut [(u64, R)]) {
        rules.sort_by(|(sa, a), (sb, b)| b.priority().cmp(&a.priority()).then(sa.cmp(sb)));
    }

    /// Replace the whole rule set atomically.
    pub fn update(&self, rules: Vec<R>) {
        let mut inner = self.inner.lock().expect("rule set lock");
        inner.rules.clear();
        for rule in rules {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.rules.push((seq, rule));
        }
        Self::sort(&mut inner.rules);
    }

    /// Insert or replace a single rule by id.
    pub fn add(&self, rule: R) {
        let mut inner = self.inner.lock().expect("rule set lock");
        inner.rules.retain(|(_, r)| r.id() != rule.id());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rules.push((seq, rule));
        Self::sort(&mut inner.rules);
    }

    /// Remove a rule by id; returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("rule set lock");
        let before = inner.rules.len();
        inner.rules.retain(|(_, r)| r.id() != id);
        inner.rules.len() != before
    }

    /// Snapshot of the rules in evaluation order.
    pub fn snapshot(&self) -> Vec<R> {
        self.inner
            .lock()
            .expect("rule set lock")
            .rules
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("rule set lock").rules.len()
    }
}

// ── Mock rules ──────────────────────────────────────────────────────

/// A canned response substituted for the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "crate::types::base64_bytes")]
    pub body: Vec<u8>,
}

/// Request mutations applied by a request-target mock rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MockRequestPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "option_base64")]
    pub body: Option<Vec<u8>>,
}

/// One mock rule. Depending on `target` it patches outgoing requests,
/// substitutes HTTP responses, or replaces WebSocket frame payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MockRule {
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
    /// Canned response for http-response targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<MockResponse>,
    /// Request patch for http-request targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_patch: Option<MockRequestPatch>,
    /// Replacement payload for ws-outgoing / ws-incoming targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "option_base64")]
    pub frame_payload: Option<Vec<u8>>,
}

fn default_enabled() -> bool {
    true
}

impl RuleLike for MockRule {
    fn id(&self) -> &str {
        &self.id
    }
    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Outcome of running a request through the mock engine.
pub struct MockRequestOutcome {
    pub request: HttpRequestRecord,
    /// Canned response plus the id of the rule that produced it
    pub response: Option<(MockResponse, String)>,
}

/// Replacement payload for a WebSocket frame.
pub struct MockedFrame {
    pub payload: Vec<u8>,
    pub rule_id: String,
}

/// Priority-ordered mock rules.
pub struct MockEngine {
    rules: RuleSet<MockRule>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self { rules: RuleSet::new() }
    }

    pub fn update(&self, rules: Vec<MockRule>) {
        self.rules.update(rules);
    }

    pub fn add(&self, rule: MockRule) {
        self.rules.add(rule);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.rules.remove(id)
    }

    pub fn snapshot(&self) -> Vec<MockRule> {
        self.rules.snapshot()
    }

    /// Apply mock rules to an outgoing request.
    ///
    /// Request-target rules accumulate their patches in priority order;
    /// the walk stops at the first rule that produces a response.
    pub fn apply_request(&self, request: HttpRequestRecord) -> MockRequestOutcome {
        let mut request = request;
        for rule in self.rules.snapshot() {
            if !rule.enabled {
                continue;
            }
            if !method_matches(&rule.method, &request.method) {
                continue;
            }
            let url_ok = rule
                .url_pattern
                .as_deref()
                .map(|p| url_pattern_matches(p, &request.url))
                .unwrap_or(true);
            if !url_ok {
                continue;
            }

            match rule.target {
                RuleTarget::HttpRequest => {
                    if let Some(patch) = &rule.request_patch {
                        debug!(rule_id = %rule.id, "Applying mock request patch");
                        if let Some(url) = &patch.url {
                            request.url = url.clone();
                        }
                        if let Some(headers) = &patch.headers {
                            for (k, v) in headers {
                                request.headers.insert(k.clone(), v.clone());
                            }
                        }
                        if let Some(body) = &patch.body {
                            request.body = body.clone();
                        }
                    }
                }
                RuleTarget::HttpResponse => {
                    if let Some(response) = &rule.response {
                        debug!(rule_id = %rule.id, "Mock response matched, short-circuiting");
                        return MockRequestOutcome {
                            request,
                            response: Some((response.clone(), rule.id.clone())),
                        };
                    }
                }
                RuleTarget::WsOutgoing | RuleTarget::WsIncoming => {}
            }
        }
        MockRequestOutcome { request, response: None }
    }

    /// Consult mock rules for a WebSocket frame. Returns a replacement
    /// payload only when a matching rule actually carries one.
    pub fn match_frame(&self, url: &str, direction: WsDirection) -> Option<MockedFrame> {
        let wanted = match direction {
            WsDirection::Send => RuleTarget::WsOutgoing,
            WsDirection::Receive => RuleTarget::WsIncoming,
        };
        for rule in self.rules.snapshot() {
            if !rule.enabled || rule.target != wanted {
                continue;
            }
            let url_ok = rule
                .url_pattern
                .as_deref()
                .map(|p| url_pattern_matches(p, url))
                .unwrap_or(true);
            if !url_ok {
                continue;
            }
            if let Some(payload) = &rule.frame_payload {
                return Some(MockedFrame {
                    payload: payload.clone(),
                    rule_id: rule.id.clone(),
                });
            }
        }
        None
    }
}

// ── Chaos rules ─────────────────────────────────────────────────────

/// Fault injected by a chaos rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "camelCase")]
pub enum ChaosFault {
    /// Sleep for the given duration, then proceed normally
    Delay { ms: u64 },
    /// Fail the request with a timeout error
    Timeout,
    /// Fail the request with a connection-reset error
    ConnectionReset,
    /// Synthesize an error response with the given status
    ErrorResponse { status: u16 },
    /// Drop the request on the floor (surfaced as a network error)
    Drop,
    /// Corrupt roughly 1% of the response body bytes
    CorruptBody,
}

/// One chaos rule. HTTP only; each match is additionally gated by
/// `probability`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChaosRule {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Chance in [0.0, 1.0] that a matching request is actually hit
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(flatten)]
    pub fault: ChaosFault,
}

fn default_probability() -> f64 {
    1.0
}

impl RuleLike for ChaosRule {
    fn id(&self) -> &str {
        &self.id
    }
    fn priority(&self) -> i32 {
        self.priority
    }
}

/// A chaos fault selected for a specific request.
pub struct ChaosHit {
    pub fault: ChaosFault,
    pub rule_id: String,
}

/// Priority-ordered chaos rules with probabilistic gating.
pub struct ChaosEngine {
    rules: RuleSet<ChaosRule>,
}

impl Default for ChaosEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self { rules: RuleSet::new() }
    }

    pub fn update(&self, rules: Vec<ChaosRule>) {
        self.rules.update(rules);
    }

    pub fn add(&self, rule: ChaosRule) {
        self.rules.add(rule);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.rules.remove(id)
    }

    pub fn snapshot(&self) -> Vec<ChaosRule> {
        self.rules.snapshot()
    }

    fn first_match(&self, url: &str, method: &str, response_stage: bool) -> Option<ChaosHit> {
        for rule in self.rules.snapshot() {
            if !rule.enabled {
                continue;
            }
            let is_corrupt = matches!(rule.fault, ChaosFault::CorruptBody);
            if is_corrupt != response_stage {
                continue;
            }
            if !method_matches(&rule.method, method) {
                continue;
            }
            let url_ok = rule
                .url_pattern
                .as_deref()
                .map(|p| url_pattern_matches(p, url))
                .unwrap_or(true);
            if !url_ok {
                continue;
            }
            // Probability gate: first structural match wins or loses here;
            // we do not fall through to lower-priority rules.
            if rand::thread_rng().gen::<f64>() <= rule.probability {
                return Some(ChaosHit {
                    fault: rule.fault.clone(),
                    rule_id: rule.id.clone(),
                });
            }
            return None;
        }
        None
    }

    /// Select a request-stage fault for this request, if any.
    pub fn match_request(&self, url: &str, method: &str) -> Option<ChaosHit> {
        self.first_match(url, method, false)
    }

    /// Select a response-stage (body corruption) fault, if any.
    pub fn match_response(&self, url: &str, method: &str) -> Option<ChaosHit> {
        self.first_match(url, method, true)
    }
}

// Serde helper for Option<Vec<u8>> carried as base64
mod option_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
