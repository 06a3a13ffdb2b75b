//! Capture-and-intervene pipeline for the HTTP path
//!
//! For every outbound host request the pipeline produces a canonical HTTP
//! event, applies interventions in a fixed order, and emits the result:
//!
//! ```text
//! request:  mock -> breakpoint -> chaos -> proceed | short-circuit
//! response: chaos -> breakpoint -> emit
//! ```
//!
//! Mock runs first because a matched mock response removes the need for
//! network and further intervention. Breakpoint runs next so a developer
//! can inspect the real (non-mocked) request. Chaos runs last on the
//! request side since it models transport faults.
//!
//! The request path is synchronous except when a breakpoint rule matches,
//! in which case the caller suspends on a one-shot waiter until the hub
//! resolves it. The match check itself is pattern evaluation only, so the
//! hot path allocates nothing.

use crate::breakpoint::{BreakpointAction, BreakpointEngine, BreakpointSnapshot};
use crate::event_bus::{HttpTap, RequestDirective};
use crate::protocol::{BridgeFrame, ControlSender};
use crate::queue::EventEmitter;
use crate::rules::{ChaosEngine, ChaosFault, MockEngine, RuleTarget};
use crate::types::{
    ErrorCategory, EventBody, HttpExchange, HttpRequestRecord, HttpResponseRecord, NetworkError,
};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error domain for faults synthesized by chaos rules.
const CHAOS_DOMAIN: &str = "DebugProbe.Chaos";
/// Error domain for requests aborted at a breakpoint.
const BREAKPOINT_DOMAIN: &str = "DebugProbe.Breakpoint";

/// Maximum body size carried on an emitted event (64KB). Larger bodies
/// are truncated before emission.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Truncate a body to `max` bytes, returning (truncated, was_truncated).
pub fn truncate_body(body: &[u8], max: usize) -> (&[u8], bool) {
    if body.len() > max {
        (&body[..max], true)
    } else {
        (body, false)
    }
}

/// The request/response intervention pipeline. Installed on the
/// EventBus by the network plugin; one instance per agent.
pub struct InterceptPipeline {
    mock: Arc<MockEngine>,
    chaos: Arc<ChaosEngine>,
    breakpoints: Arc<BreakpointEngine>,
    emitter: EventEmitter,
    control: ControlSender,
    max_body_bytes: AtomicUsize,
}

impl InterceptPipeline {
    pub fn new(
        mock: Arc<MockEngine>,
        chaos: Arc<ChaosEngine>,
        breakpoints: Arc<BreakpointEngine>,
        emitter: EventEmitter,
        control: ControlSender,
    ) -> Self {
        Self {
            mock,
            chaos,
            breakpoints,
            emitter,
            control,
            max_body_bytes: AtomicUsize::new(MAX_BODY_SIZE),
        }
    }

    /// Cap on body bytes carried per emitted event.
    pub fn set_max_body_bytes(&self, max: usize) {
        self.max_body_bytes.store(max.max(1), Ordering::Relaxed);
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.load(Ordering::Relaxed)
    }

    /// Emit the finished exchange, truncating bodies first.
    fn emit_exchange(
        &self,
        mut request: HttpRequestRecord,
        mut response: Option<HttpResponseRecord>,
        mock_rule_id: Option<String>,
        parent_id: Option<String>,
    ) {
        let max = self.max_body_bytes();
        let (body, truncated) = truncate_body(&request.body, max);
        if truncated {
            request.body = body.to_vec();
        }
        if let Some(resp) = response.as_mut() {
            let (body, truncated) = truncate_body(&resp.body, max);
            if truncated {
                resp.body = body.to_vec();
            }
        }
        self.emitter.emit(EventBody::Http(HttpExchange {
            request,
            response,
            mock_rule_id,
            parent_id,
        }));
    }

    fn elapsed_ms(request: &HttpRequestRecord) -> u64 {
        (Utc::now() - request.start_time).num_milliseconds().max(0) as u64
    }

    fn cancelled_error(reason: &str) -> NetworkError {
        NetworkError::new(BREAKPOINT_DOMAIN, -999, ErrorCategory::Cancelled, reason)
    }

    /// Suspend on a matched request-stage breakpoint until the hub
    /// resolves it. No engine lock is held across the await.
    async fn suspend_request(
        &self,
        rule_id: String,
        request: HttpRequestRecord,
    ) -> RequestDirective {
        let rx = self.breakpoints.register_waiter(&request.id);
        self.control.send(BridgeFrame::BreakpointHit(BreakpointSnapshot {
            request_id: request.id.clone(),
            rule_id,
            stage: RuleTarget::HttpRequest,
            request: request.clone(),
            response: None,
        }));

        let payload = match rx.await {
            Ok(payload) => payload,
            Err(_) => {
                // Sender dropped: shutdown or disconnect
                debug!(request_id = %request.id, "Breakpoint waiter dropped, aborting request");
                let error = Self::cancelled_error("request aborted at breakpoint");
                self.emit_exchange(
                    request,
                    Some(HttpResponseRecord::failure(error.clone(), 0)),
                    None,
                    None,
                );
                return RequestDirective::Fail(error);
            }
        };

        match BreakpointAction::parse(&payload.action) {
            BreakpointAction::Resume => RequestDirective::Proceed(request),
            BreakpointAction::Abort => {
                let error = Self::cancelled_error("request aborted at breakpoint");
                self.emit_exchange(
                    request,
                    Some(HttpResponseRecord::failure(error.clone(), 0)),
                    None,
                    None,
                );
                RequestDirective::Fail(error)
            }
            BreakpointAction::Modify => {
                if let Some(mut modified) = payload.modified_request {
                    // The id keys the exchange; the hub must not re-key it
                    modified.id = request.id.clone();
                    modified.start_time = request.start_time;
                    RequestDirective::Proceed(modified)
                } else if let Some(response) = payload.modified_response {
                    self.emit_exchange(request, Some(response.clone()), None, None);
                    RequestDirective::Respond(response)
                } else {
                    warn!(request_id = %request.id, "modify action without a modification, resuming");
                    RequestDirective::Proceed(request)
                }
            }
        }
    }

    /// Apply a request-stage chaos fault.
    async fn apply_chaos(&self, fault: ChaosFault, rule_id: &str, request: HttpRequestRecord) -> RequestDirective {
        match fault {
            ChaosFault::Delay { ms } => {
                debug!(rule_id, ms, "Chaos delay");
                tokio::time::sleep(Duration::from_millis(ms)).await;
                RequestDirective::Proceed(request)
            }
            ChaosFault::Timeout => {
                let error = NetworkError::new(
                    CHAOS_DOMAIN,
                    -1001,
                    ErrorCategory::Timeout,
                    format!("request timed out (chaos rule {rule_id})"),
                );
                let duration = Self::elapsed_ms(&request);
                self.emit_exchange(
                    request,
                    Some(HttpResponseRecord::failure(error.clone(), duration)),
                    None,
                    None,
                );
                RequestDirective::Fail(error)
            }
            ChaosFault::ConnectionReset => {
                let error = NetworkError::new(
                    CHAOS_DOMAIN,
                    -1005,
                    ErrorCategory::Network,
                    format!("connection reset (chaos rule {rule_id})"),
                );
                let duration = Self::elapsed_ms(&request);
                self.emit_exchange(
                    request,
                    Some(HttpResponseRecord::failure(error.clone(), duration)),
                    None,
                    None,
                );
                RequestDirective::Fail(error)
            }
            ChaosFault::Drop => {
                let error = NetworkError::new(
                    CHAOS_DOMAIN,
                    -1,
                    ErrorCategory::Network,
                    format!("request dropped (chaos rule {rule_id})"),
                );
                let duration = Self::elapsed_ms(&request);
                self.emit_exchange(
                    request,
                    Some(HttpResponseRecord::failure(error.clone(), duration)),
                    None,
                    None,
                );
                RequestDirective::Fail(error)
            }
            ChaosFault::ErrorResponse { status } => {
                debug!(rule_id, status, "Chaos error response");
                let mut response = HttpResponseRecord::new(status);
                response.duration_ms = 0;
                self.emit_exchange(request, Some(response.clone()), None, None);
                RequestDirective::Respond(response)
            }
            // Corruption is a response-stage fault; a request-stage match
            // never yields it (the engine filters by stage).
            ChaosFault::CorruptBody => RequestDirective::Proceed(request),
        }
    }

    /// Overwrite roughly 1% of the body's bytes with random values.
    fn corrupt_body(body: &mut [u8]) {
        if body.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        let victims = (body.len() / 100).max(1);
        for _ in 0..victims {
            let idx = rng.gen_range(0..body.len());
            body[idx] = rng.gen();
        }
    }
}

#[async_trait]
impl HttpTap for InterceptPipeline {
    async fn process_request(&self, request: HttpRequestRecord) -> RequestDirective {
        // Stage 1: mock
        let outcome = self.mock.apply_request(request);
        if let Some((mock, rule_id)) = outcome.response {
            let response = HttpResponseRecord {
                status_code: mock.status_code,
                headers: mock.headers,
                body: mock.body,
                duration_ms: 0,
                error: None,
            };
            self.emit_exchange(
                outcome.request,
                Some(response.clone()),
                Some(rule_id),
                None,
            );
            return RequestDirective::Respond(response);
        }
        let request = outcome.request;

        // Stage 2: breakpoint
        if let Some(rule_id) = self.breakpoints.match_request(&request.url, &request.method) {
            let directive = self.suspend_request(rule_id, request).await;
            let request = match directive {
                RequestDirective::Proceed(req) => req,
                other => return other,
            };
            // Stage 3: chaos, on the possibly-modified request
            if let Some(hit) = self.chaos.match_request(&request.url, &request.method) {
                return self.apply_chaos(hit.fault, &hit.rule_id, request).await;
            }
            return RequestDirective::Proceed(request);
        }

        // Stage 3: chaos
        if let Some(hit) = self.chaos.match_request(&request.url, &request.method) {
            return self.apply_chaos(hit.fault, &hit.rule_id, request).await;
        }

        RequestDirective::Proceed(request)
    }

    fn has_response_breakpoint(&self, request: &HttpRequestRecord) -> bool {
        self.breakpoints.has_response_rule(&request.url, &request.method)
    }

    async fn process_response(
        &self,
        request: HttpRequestRecord,
        mut response: HttpResponseRecord,
        parent_id: Option<String>,
    ) {
        // Stage 1: chaos body corruption
        if let Some(hit) = self.chaos.match_response(&request.url, &request.method) {
            debug!(rule_id = %hit.rule_id, "Corrupting response body");
            Self::corrupt_body(&mut response.body);
        }

        // Stage 2: response breakpoint
        if let Some(rule_id) = self.breakpoints.match_response(&request.url, &request.method) {
            let rx = self.breakpoints.register_waiter(&request.id);
            self.control.send(BridgeFrame::BreakpointHit(BreakpointSnapshot {
                request_id: request.id.clone(),
                rule_id,
                stage: RuleTarget::HttpResponse,
                request: request.clone(),
                response: Some(response.clone()),
            }));

            match rx.await {
                Err(_) => {
                    let error = Self::cancelled_error("response aborted at breakpoint");
                    self.emit_exchange(
                        request,
                        Some(HttpResponseRecord::failure(error, response.duration_ms)),
                        None,
                        parent_id,
                    );
                    return;
                }
                Ok(payload) => match BreakpointAction::parse(&payload.action) {
                    BreakpointAction::Abort => {
                        let error = Self::cancelled_error("response aborted at breakpoint");
                        self.emit_exchange(
                            request,
                            Some(HttpResponseRecord::failure(error, response.duration_ms)),
                            None,
                            parent_id,
                        );
                        return;
                    }
                    BreakpointAction::Modify => {
                        if let Some(modified) = payload.modified_response {
                            response.status_code = modified.status_code;
                            response.headers = modified.headers;
                            response.body = modified.body;
                        } else {
                            warn!(request_id = %request.id, "modify action without a response, delivering original");
                        }
                    }
                    BreakpointAction::Resume => {}
                },
            }
        }

        self.emit_exchange(request, Some(response), None, parent_id);
    }

    fn report_failure(&self, request: HttpRequestRecord, error: NetworkError) {
        let duration = Self::elapsed_ms(&request);
        self.emit_exchange(
            request,
            Some(HttpResponseRecord::failure(error, duration)),
            None,
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::rules::{MockResponse, MockRule};
    use crate::types::DebugEvent;
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tokio::sync::Notify;

    struct Fixture {
        pipeline: Arc<InterceptPipeline>,
        mock: Arc<MockEngine>,
        chaos: Arc<ChaosEngine>,
        breakpoints: Arc<BreakpointEngine>,
        queue: Arc<EventQueue>,
        control_rx: mpsc::UnboundedReceiver<BridgeFrame>,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockEngine::new());
        let chaos = Arc::new(ChaosEngine::new());
        let breakpoints = Arc::new(BreakpointEngine::new());
        let queue = Arc::new(EventQueue::in_memory().unwrap());
        let emitter = EventEmitter::new(Arc::clone(&queue), Arc::new(Notify::new()));
        let (tx, control_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(InterceptPipeline::new(
            Arc::clone(&mock),
            Arc::clone(&chaos),
            Arc::clone(&breakpoints),
            emitter,
            ControlSender::new(tx),
        ));
        Fixture {
            pipeline,
            mock,
            chaos,
            breakpoints,
            queue,
            control_rx,
        }
    }

    fn emitted_exchanges(queue: &EventQueue) -> Vec<HttpExchange> {
        queue
            .peek_batch(100)
            .unwrap()
            .into_iter()
            .filter_map(|(_, DebugEvent { body, .. })| match body {
                EventBody::Http(exchange) => Some(exchange),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn mock_response_short_circuits() {
        let f = fixture();
        f.mock.update(vec![MockRule {
            id: "r1".to_string(),
            enabled: true,
            priority: 10,
            url_pattern: Some("*example.com/users*".to_string()),
            method: None,
            target: RuleTarget::HttpResponse,
            response: Some(MockResponse {
                status_code: 418,
                headers: HashMap::from([("X-M".to_string(), "1".to_string())]),
                body: b"teapot".to_vec(),
            }),
            request_patch: None,
            frame_payload: None,
        }]);

        let req = HttpRequestRecord::new("GET", "https://example.com/users/42");
        let directive = f.pipeline.process_request(req).await;

        match directive {
            RequestDirective::Respond(resp) => {
                assert_eq!(resp.status_code, 418);
                assert_eq!(resp.body, b"teapot");
            }
            other => panic!("expected Respond, got {other:?}"),
        }

        let exchanges = emitted_exchanges(&f.queue);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].mock_rule_id.as_deref(), Some("r1"));
        assert_eq!(exchanges[0].response.as_ref().unwrap().duration_ms, 0);
        assert_eq!(exchanges[0].response.as_ref().unwrap().status_code, 418);
    }

    #[tokio::test]
    async fn chaos_timeout_fails_with_timeout_category() {
        let f = fixture();
        f.chaos.update(vec![crate::rules::ChaosRule {
            id: "c1".to_string(),
            enabled: true,
            priority: 1,
            url_pattern: Some("*flaky*".to_string()),
            method: None,
            probability: 1.0,
            fault: ChaosFault::Timeout,
        }]);

        let req = HttpRequestRecord::new("GET", "https://flaky.test/");
        let directive = f.pipeline.process_request(req).await;

        match directive {
            RequestDirective::Fail(error) => {
                assert_eq!(error.category, ErrorCategory::Timeout);
                assert!(error.is_network_error);
            }
            other => panic!("expected Fail, got {other:?}"),
        }

        let exchanges = emitted_exchanges(&f.queue);
        let err = exchanges[0].response.as_ref().unwrap().error.as_ref().unwrap();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.is_network_error);
    }

    #[tokio::test]
    async fn chaos_error_response_synthesizes_status() {
        let f = fixture();
        f.chaos.update(vec![crate::rules::ChaosRule {
            id: "c2".to_string(),
            enabled: true,
            priority: 1,
            url_pattern: None,
            method: None,
            probability: 1.0,
            fault: ChaosFault::ErrorResponse { status: 503 },
        }]);

        let req = HttpRequestRecord::new("GET", "https://example.com/");
        match f.pipeline.process_request(req).await {
            RequestDirective::Respond(resp) => assert_eq!(resp.status_code, 503),
            other => panic!("expected Respond, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_rules_means_proceed_untouched() {
        let f = fixture();
        let req = HttpRequestRecord::new("GET", "https://example.com/");
        let url = req.url.clone();
        match f.pipeline.process_request(req).await {
            RequestDirective::Proceed(out) => assert_eq!(out.url, url),
            other => panic!("expected Proceed, got {other:?}"),
        }
        assert!(emitted_exchanges(&f.queue).is_empty());
    }

    #[tokio::test]
    async fn breakpoint_resume_proceeds() {
        let mut f = fixture();
        f.breakpoints.update(vec![crate::breakpoint::BreakpointRule {
            id: "b1".to_string(),
            enabled: true,
            priority: 0,
            url_pattern: Some("*".to_string()),
            method: None,
            target: RuleTarget::HttpRequest,
        }]);

        let req = HttpRequestRecord::new("POST", "https://example.com/submit");
        let breakpoints = Arc::clone(&f.breakpoints);
        let pipeline = Arc::clone(&f.pipeline);

        let worker = tokio::spawn(async move { pipeline.process_request(req).await });

        // The hit frame arrives with the snapshot
        let frame = f.control_rx.recv().await.unwrap();
        let snapshot = match frame {
            BridgeFrame::BreakpointHit(s) => s,
            other => panic!("expected breakpoint_hit, got {other:?}"),
        };
        assert_eq!(snapshot.stage, RuleTarget::HttpRequest);

        breakpoints.resolve(crate::breakpoint::BreakpointResumePayload {
            request_id: snapshot.request_id,
            action: "resume".to_string(),
            modified_request: None,
            modified_response: None,
        });

        match worker.await.unwrap() {
            RequestDirective::Proceed(out) => assert_eq!(out.method, "POST"),
            other => panic!("expected Proceed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn breakpoint_modify_replaces_request_body() {
        let mut f = fixture();
        f.breakpoints.update(vec![crate::breakpoint::BreakpointRule {
            id: "b1".to_string(),
            enabled: true,
            priority: 0,
            url_pattern: Some("*".to_string()),
            method: None,
            target: RuleTarget::HttpRequest,
        }]);

        let req = HttpRequestRecord::new("POST", "https://example.com/submit")
            .with_body(b"{\"v\":1}".to_vec());
        let original_id = req.id.clone();
        let breakpoints = Arc::clone(&f.breakpoints);
        let pipeline = Arc::clone(&f.pipeline);

        let worker = tokio::spawn(async move { pipeline.process_request(req).await });

        let snapshot = match f.control_rx.recv().await.unwrap() {
            BridgeFrame::BreakpointHit(s) => s,
            other => panic!("expected breakpoint_hit, got {other:?}"),
        };

        let mut modified = snapshot.request.clone();
        modified.body = b"{\"v\":2}".to_vec();
        breakpoints.resolve(crate::breakpoint::BreakpointResumePayload {
            request_id: snapshot.request_id,
            action: "modify".to_string(),
            modified_request: Some(modified),
            modified_response: None,
        });

        match worker.await.unwrap() {
            RequestDirective::Proceed(out) => {
                assert_eq!(out.body, b"{\"v\":2}");
                assert_eq!(out.id, original_id);
            }
            other => panic!("expected Proceed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn breakpoint_abort_fails_cancelled() {
        let mut f = fixture();
        f.breakpoints.update(vec![crate::breakpoint::BreakpointRule {
            id: "b1".to_string(),
            enabled: true,
            priority: 0,
            url_pattern: Some("*".to_string()),
            method: None,
            target: RuleTarget::HttpRequest,
        }]);

        let req = HttpRequestRecord::new("GET", "https://example.com/");
        let breakpoints = Arc::clone(&f.breakpoints);
        let pipeline = Arc::clone(&f.pipeline);
        let worker = tokio::spawn(async move { pipeline.process_request(req).await });

        let snapshot = match f.control_rx.recv().await.unwrap() {
            BridgeFrame::BreakpointHit(s) => s,
            other => panic!("expected breakpoint_hit, got {other:?}"),
        };
        breakpoints.resolve(crate::breakpoint::BreakpointResumePayload {
            request_id: snapshot.request_id,
            action: "abort".to_string(),
            modified_request: None,
            modified_response: None,
        });

        match worker.await.unwrap() {
            RequestDirective::Fail(error) => assert_eq!(error.category, ErrorCategory::Cancelled),
            other => panic!("expected Fail, got {other:?}"),
        }

        let exchanges = emitted_exchanges(&f.queue);
        assert_eq!(exchanges.len(), 1);
        let err = exchanges[0].response.as_ref().unwrap().error.as_ref().unwrap();
        assert_eq!(err.category, ErrorCategory::Cancelled);
    }

    #[tokio::test]
    async fn dropped_waiter_aborts_request() {
        let f = fixture();
        f.breakpoints.update(vec![crate::breakpoint::BreakpointRule {
            id: "b1".to_string(),
            enabled: true,
            priority: 0,
            url_pattern: Some("*".to_string()),
            method: None,
            target: RuleTarget::HttpRequest,
        }]);

        let req = HttpRequestRecord::new("GET", "https://example.com/");
        let breakpoints = Arc::clone(&f.breakpoints);
        let pipeline = Arc::clone(&f.pipeline);
        let worker = tokio::spawn(async move { pipeline.process_request(req).await });

        // Give the worker time to register its waiter, then simulate a
        // bridge disconnect
        tokio::time::sleep(Duration::from_millis(20)).await;
        breakpoints.abort_all();

        match worker.await.unwrap() {
            RequestDirective::Fail(error) => assert_eq!(error.category, ErrorCategory::Cancelled),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_breakpoint_modify_replaces_response() {
        let mut f = fixture();
        f.breakpoints.update(vec![crate::breakpoint::BreakpointRule {
            id: "b1".to_string(),
            enabled: true,
            priority: 0,
            url_pattern: Some("*".to_string()),
            method: None,
            target: RuleTarget::HttpResponse,
        }]);

        let req = HttpRequestRecord::new("GET", "https://example.com/");
        assert!(f.pipeline.has_response_breakpoint(&req));

        let mut resp = HttpResponseRecord::new(200);
        resp.body = b"original".to_vec();
        resp.duration_ms = 12;

        let pipeline = Arc::clone(&f.pipeline);
        let breakpoints = Arc::clone(&f.breakpoints);
        let worker = tokio::spawn(async move {
            pipeline.process_response(req, resp, None).await;
        });

        let snapshot = match f.control_rx.recv().await.unwrap() {
            BridgeFrame::BreakpointHit(s) => s,
            other => panic!("expected breakpoint_hit, got {other:?}"),
        };
        assert_eq!(snapshot.stage, RuleTarget::HttpResponse);
        assert!(snapshot.response.is_some());

        let mut modified = HttpResponseRecord::new(204);
        modified.body = b"replaced".to_vec();
        breakpoints.resolve(crate::breakpoint::BreakpointResumePayload {
            request_id: snapshot.request_id,
            action: "modify".to_string(),
            modified_request: None,
            modified_response: Some(modified),
        });
        worker.await.unwrap();

        let exchanges = emitted_exchanges(&f.queue);
        let resp = exchanges[0].response.as_ref().unwrap();
        assert_eq!(resp.status_code, 204);
        assert_eq!(resp.body, b"replaced");
        // Duration of the real exchange is preserved
        assert_eq!(resp.duration_ms, 12);
    }

    #[tokio::test]
    async fn response_emission_carries_parent_id() {
        let f = fixture();
        let req = HttpRequestRecord::new("GET", "https://example.com/redirected");
        f.pipeline
            .process_response(req, HttpResponseRecord::new(200), Some("parent-ev".to_string()))
            .await;

        let exchanges = emitted_exchanges(&f.queue);
        assert_eq!(exchanges[0].parent_id.as_deref(), Some("parent-ev"));
    }

    #[tokio::test]
    async fn oversized_bodies_are_truncated_on_emit() {
        let f = fixture();
        f.pipeline.set_max_body_bytes(16);

        let req = HttpRequestRecord::new("POST", "https://example.com/").with_body(vec![b'A'; 100]);
        let mut resp = HttpResponseRecord::new(200);
        resp.body = vec![b'B'; 100];
        f.pipeline.process_response(req, resp, None).await;

        let exchanges = emitted_exchanges(&f.queue);
        assert_eq!(exchanges[0].request.body.len(), 16);
        assert_eq!(exchanges[0].response.as_ref().unwrap().body.len(), 16);
    }

    #[test]
    fn corrupt_body_touches_some_bytes() {
        let original = vec![0u8; 10_000];
        let mut body = original.clone();
        InterceptPipeline::corrupt_body(&mut body);
        assert_eq!(body.len(), original.len());
        // 100 victims over 10k zero bytes: overwhelmingly likely to differ
        assert_ne!(body, original);
    }

    #[test]
    fn corrupt_body_handles_empty() {
        let mut body: Vec<u8> = Vec::new();
        InterceptPipeline::corrupt_body(&mut body);
        assert!(body.is_empty());
    }
}
