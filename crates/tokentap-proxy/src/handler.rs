//! The per-flow controller.
//!
//! Implements the MITM engine's handler interface. The engine clones the
//! handler per client connection and invokes the request and response hooks
//! for a flow sequentially on that clone, so in-flight state lives in a
//! plain `Option` on the handler — never shared, never locked.
//!
//! Responsibilities per flow:
//! - answer `/health` inline and route legacy direct-to-proxy requests to
//!   their upstream host (the post-rewrite host is authoritative),
//! - resolve the provider from the host, or mark the flow passthrough,
//! - decode the request body and run declarative extraction, falling back
//!   to the builtin extractor when the quality check flags degradation,
//! - on streamed responses, install a forwarding byte tap that feeds the
//!   accumulator and finalises the event when the stream ends (or the
//!   client disconnects),
//! - assemble the event and hand it to the sink without awaiting.
//!
//! Forwarding is never impeded by extraction failure: every error path
//! degrades to passthrough.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Method, Request, Response, Uri},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use serde_json::Value;

use tokentap_core::builtin::{self, BuiltinProvider, ExtractorKind};
use tokentap_core::context::{detect_client_type, ClientType, ContextMetadata, ContextResolver};
use tokentap_core::counters::TapCounters;
use tokentap_core::device::{resolve_device, DeviceInfo};
use tokentap_core::extract::{extract_request, extract_response_json, RequestDigest, UsageDelta};
use tokentap_core::provider::{
    CaptureMode, ProviderDefinition, RegistryHandle, ResponseSsePaths, SseFormat,
};
use tokentap_core::security::SecurityGate;
use tokentap_core::stream::{StreamAccumulator, StreamRules};
use tokentap_core::{Event, EventParts};
use tokentap_storage::SinkHandle;

/// Bodies beyond this size are forwarded but not decoded.
const DECODE_LIMIT: usize = 16 * 1024 * 1024;

/// Helper to convert bytes to Body.
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Shared handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    /// Provider registry handle (snapshot taken per flow).
    pub registry: RegistryHandle,
    /// Event sink intake.
    pub sink: SinkHandle,
    /// Security gate (sampled per flow).
    pub security: SecurityGate,
    /// Context resolver with the environment tier captured.
    pub resolver: ContextResolver,
    /// Pipeline counters.
    pub counters: Arc<TapCounters>,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("registry", &self.registry)
            .field("sink", &self.sink)
            .finish()
    }
}

/// Per-flow state, created at the request hook and consumed at the response
/// hook (or by the stream finaliser).
#[derive(Debug)]
struct FlowState {
    timestamp: DateTime<Utc>,
    started_at: Instant,
    provider: Arc<ProviderDefinition>,
    provider_id: String,
    capture_mode: CaptureMode,
    extractor: ExtractorKind,
    host: String,
    path: String,
    digest: RequestDigest,
    raw_request: Option<Value>,
    context: ContextMetadata,
    device: DeviceInfo,
    client_type: ClientType,
    user_agent: String,
    capture_full: bool,
}

impl FlowState {
    /// Assembles the event for this flow.
    fn into_event(
        self,
        usage: UsageDelta,
        response_status: u16,
        streaming: bool,
        truncated: bool,
        raw_response: Option<Value>,
    ) -> Event {
        Event::assemble(EventParts {
            timestamp: self.timestamp,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            provider_id: self.provider_id,
            host: self.host,
            path: self.path.clone(),
            path_matches_api: self.provider.path_matches_api(&self.path),
            digest: self.digest,
            usage,
            context: self.context,
            device: self.device,
            client_type: self.client_type,
            user_agent: self.user_agent,
            response_status,
            streaming,
            truncated,
            capture_mode: self.capture_mode,
            capture_full: self.capture_full,
            provider_tags: self.provider.tags.clone(),
            cost_per_input_token: self.provider.cost_per_input_token,
            cost_per_output_token: self.provider.cost_per_output_token,
            raw_request: self.raw_request,
            raw_response,
        })
    }
}

/// The MITM flow controller.
pub struct FlowController {
    config: HandlerConfig,
    flow: Option<FlowState>,
}

impl Clone for FlowController {
    fn clone(&self) -> Self {
        // The engine clones one handler per connection; in-flight state
        // never crosses that boundary.
        Self {
            config: self.config.clone(),
            flow: None,
        }
    }
}

impl FlowController {
    /// Creates a controller with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self { config, flow: None }
    }

    /// Request hook body, factored for direct testing.
    pub async fn process_request(
        &mut self,
        client_ip: std::net::IpAddr,
        req: Request<Body>,
    ) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some(host) = extract_host(&req) else {
            return RequestOrResponse::Request(req);
        };
        let mut host = host.to_lowercase();

        // Health check: the proxy answers for itself.
        if is_local_host(&host) && req.uri().path() == "/health" {
            return RequestOrResponse::Response(health_response());
        }

        // Backward compat: clients pointing *_BASE_URL straight at the proxy
        // are routed by path and rewritten to the real upstream. All later
        // decisions read the post-rewrite host.
        let mut req = req;
        if is_local_host(&host) {
            let registry = self.config.registry.snapshot();
            let upstream = compat_provider_for_path(req.uri().path())
                .and_then(|id| registry.get(id))
                .and_then(|def| def.domains.first().cloned());
            match upstream {
                Some(upstream) => {
                    tracing::info!(path = req.uri().path(), %upstream, "compat request rewritten");
                    match rewrite_upstream(req, &upstream) {
                        Ok(rewritten) => {
                            req = rewritten;
                            host = upstream;
                        }
                        Err(original) => return RequestOrResponse::Request(original),
                    }
                }
                None => {
                    tracing::warn!(path = req.uri().path(), "unknown API path on proxy");
                    return RequestOrResponse::Response(unknown_path_response(req.uri().path()));
                }
            }
        }

        let registry = self.config.registry.snapshot();
        let Some(provider_id) = registry.resolve(&host).map(str::to_string) else {
            tracing::debug!(%host, "no provider for host, passthrough");
            return RequestOrResponse::Request(req);
        };
        let Some(provider) = registry.get(&provider_id) else {
            return RequestOrResponse::Request(req);
        };

        // Telemetry flows forward untouched and emit nothing.
        if is_telemetry_path(req.uri().path()) {
            tracing::debug!(%host, path = req.uri().path(), "skipping telemetry request");
            return RequestOrResponse::Request(req);
        }

        tracing::info!(
            provider = %provider_id,
            method = %req.method(),
            %host,
            path = req.uri().path(),
            "intercepting request"
        );

        let path = req.uri().path().to_string();
        let (parts, body) = req.into_parts();

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("failed to read request body: {e}");
                return RequestOrResponse::Request(Request::from_parts(parts, Body::empty()));
            }
        };

        let content_type = parts
            .headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let raw_request: Option<Value> = if content_type.contains("json")
            && !body_bytes.is_empty()
            && body_bytes.len() <= DECODE_LIMIT
        {
            match serde_json::from_slice(&body_bytes) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    tracing::debug!(provider = %provider_id, "request body not decodable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let mut extractor = ExtractorKind::Declarative;
        let mut digest = RequestDigest::default();
        if let Some(doc) = &raw_request {
            digest = extract_request(&provider, doc);
            if let Some(kind) = BuiltinProvider::for_id(&provider_id) {
                if builtin::is_degraded(&digest, &provider, doc) {
                    let legacy = builtin::extract_request(kind, doc);
                    tracing::info!(
                        provider = %provider_id,
                        declarative_messages = digest.message_count(),
                        legacy_messages = legacy.message_count(),
                        "degraded extraction, switching to builtin extractor"
                    );
                    self.config.counters.record_degraded();
                    digest = legacy;
                    extractor = ExtractorKind::Builtin(kind);
                }
            }
        }

        let user_agent = parts
            .headers
            .get(hyper::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let headers = &parts.headers;
        let context = self.config.resolver.resolve(
            |name| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            },
            &user_agent,
        );
        let client_type = detect_client_type(&user_agent);
        let device = resolve_device(&digest, &client_ip.to_string(), &user_agent);

        let capture_full = self.config.security.debug_capture() || provider.capture_full_request;

        self.flow = Some(FlowState {
            timestamp: Utc::now(),
            started_at: Instant::now(),
            capture_mode: registry.capture_mode(),
            provider_id,
            provider,
            extractor,
            host,
            path,
            digest,
            raw_request: if capture_full { raw_request } else { None },
            context,
            device,
            client_type,
            user_agent,
            capture_full,
        });

        RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(body_bytes)))
    }

    /// Response hook body, factored for direct testing.
    pub async fn process_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(flow) = self.flow.take() else {
            return res;
        };

        let status = res.status().as_u16();
        let content_type = res
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let is_stream = content_type.contains("text/event-stream")
            || content_type.contains("application/vnd.amazon.eventstream")
            || flow.digest.stream_requested;

        if is_stream {
            self.tap_stream(flow, res, status)
        } else {
            self.buffer_response(flow, res, status).await
        }
    }

    /// Buffered path: collect, decode, extract, emit.
    async fn buffer_response(
        &self,
        flow: FlowState,
        res: Response<Body>,
        status: u16,
    ) -> Response<Body> {
        let (parts, body) = res.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(provider = %flow.provider_id, "failed to read response body: {e}");
                let event = flow.into_event(UsageDelta::default(), status, false, true, None);
                self.config.sink.enqueue(event);
                return Response::from_parts(parts, Body::empty());
            }
        };

        let raw_response: Option<Value> = if body_bytes.len() <= DECODE_LIMIT {
            serde_json::from_slice(&body_bytes).ok()
        } else {
            tracing::debug!(
                provider = %flow.provider_id,
                size = body_bytes.len(),
                "response body over decode limit"
            );
            None
        };

        let usage = match (&flow.extractor, &raw_response) {
            (ExtractorKind::Builtin(kind), Some(doc)) => builtin::extract_response(*kind, doc),
            (ExtractorKind::Declarative, Some(doc)) => flow
                .provider
                .response_json
                .as_ref()
                .map(|paths| extract_response_json(&flow.provider_id, paths, doc))
                .unwrap_or_default(),
            (_, None) => {
                tracing::debug!(provider = %flow.provider_id, "no decodable response body");
                UsageDelta::default()
            }
        };

        let capture_full = flow.capture_full;
        let event = flow.into_event(
            usage,
            status,
            false,
            false,
            if capture_full { raw_response } else { None },
        );
        tracing::info!(
            provider = %event.provider_id,
            model = %event.model,
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            cache_read = event.cache_read_tokens,
            "recorded event"
        );
        self.config.sink.enqueue(event);

        Response::from_parts(parts, bytes_to_body(body_bytes))
    }

    /// Streaming path: forward bytes while the accumulator observes them;
    /// finalise (and emit) when the stream ends or the client disconnects.
    fn tap_stream(&self, flow: FlowState, res: Response<Body>, status: u16) -> Response<Body> {
        let rules = stream_rules(&flow);
        let acc = StreamAccumulator::new(rules, flow.capture_full);
        let mut finalizer = StreamFinalizer::new(
            flow,
            acc,
            self.config.sink.clone(),
            self.config.counters.clone(),
            status,
        );

        let (parts, body) = res.into_parts();
        let mut upstream = body.into_data_stream();

        let tapped = async_stream::stream! {
            let mut failed = false;
            while let Some(next) = upstream.next().await {
                match next {
                    Ok(chunk) => {
                        finalizer.observe(&chunk);
                        yield Ok::<Bytes, std::io::Error>(chunk);
                    }
                    Err(e) => {
                        tracing::warn!("upstream stream error: {e}");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                finalizer.abort();
            } else {
                finalizer.complete();
            }
        };

        Response::from_parts(parts, Body::from_stream(tapped))
    }
}

impl HttpHandler for FlowController {
    async fn handle_request(
        &mut self,
        ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        self.process_request(ctx.client_addr.ip(), req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.process_response(res).await
    }
}

/// Chooses accumulator rules for a flow.
fn stream_rules(flow: &FlowState) -> StreamRules {
    match flow.extractor {
        ExtractorKind::Builtin(kind) => StreamRules::Builtin(kind),
        ExtractorKind::Declarative => match &flow.provider.response_sse {
            Some(sse) => StreamRules::Declarative {
                provider_id: flow.provider_id.clone(),
                sse: sse.clone(),
            },
            // No SSE profile: fall back to the builtin routine when one
            // exists, otherwise accumulate nothing.
            None => BuiltinProvider::for_id(&flow.provider_id)
                .map(StreamRules::Builtin)
                .unwrap_or_else(|| StreamRules::Declarative {
                    provider_id: flow.provider_id.clone(),
                    sse: empty_sse_paths(),
                }),
        },
    }
}

fn empty_sse_paths() -> ResponseSsePaths {
    ResponseSsePaths {
        event_types: vec!["*".to_string()],
        format: SseFormat::Sse,
        done_marker: None,
        use_last_chunk: false,
        input_tokens_event: None,
        input_tokens: None,
        output_tokens_event: None,
        output_tokens: None,
        cache_creation_tokens_event: None,
        cache_creation_tokens: None,
        cache_read_tokens_event: None,
        cache_read_tokens: None,
        model_event: None,
        model: None,
        stop_reason_event: None,
        stop_reason: None,
    }
}

/// Finalises a tapped stream exactly once.
///
/// Dropping an unfinished finaliser (client disconnect, stream abandoned)
/// still emits the event, marked truncated.
struct StreamFinalizer {
    inner: Option<StreamFlowState>,
}

struct StreamFlowState {
    flow: FlowState,
    acc: StreamAccumulator,
    sink: SinkHandle,
    counters: Arc<TapCounters>,
    status: u16,
}

impl StreamFinalizer {
    fn new(
        flow: FlowState,
        acc: StreamAccumulator,
        sink: SinkHandle,
        counters: Arc<TapCounters>,
        status: u16,
    ) -> Self {
        Self {
            inner: Some(StreamFlowState {
                flow,
                acc,
                sink,
                counters,
                status,
            }),
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        if let Some(state) = &mut self.inner {
            state.acc.feed(chunk);
        }
    }

    fn complete(&mut self) {
        self.finish(false);
    }

    fn abort(&mut self) {
        self.finish(true);
    }

    fn finish(&mut self, truncated: bool) {
        let Some(state) = self.inner.take() else {
            return;
        };
        let outcome = state.acc.finalize();
        state.counters.record_skipped(outcome.skipped);

        let raw_response = if state.flow.capture_full {
            outcome
                .raw_tail
                .map(|tail| Value::String(String::from_utf8_lossy(&tail).into_owned()))
        } else {
            None
        };

        let event = state
            .flow
            .into_event(outcome.usage, state.status, true, truncated, raw_response);
        tracing::info!(
            provider = %event.provider_id,
            model = %event.model,
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            truncated,
            "recorded streaming event"
        );
        state.sink.enqueue(event);
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// Extracts host from request URI or Host header.
fn extract_host(req: &Request<Body>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }

    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1")
}

/// Legacy path routing for clients pointed straight at the proxy.
fn compat_provider_for_path(path: &str) -> Option<&'static str> {
    if path.contains("/v1/messages") {
        Some("anthropic")
    } else if path.contains("/v1/chat/completions") || path.contains("/v1/responses") {
        Some("openai")
    } else if path.contains("generateContent") {
        Some("gemini")
    } else {
        None
    }
}

/// Telemetry/metrics flows produce no events.
fn is_telemetry_path(path: &str) -> bool {
    let path = path.to_lowercase();
    ["/telemetry", "/metrics", "/clienttelemetry"]
        .iter()
        .any(|p| path.contains(p))
}

/// Rewrites the request to the upstream HTTPS endpoint. Returns the
/// untouched request on failure so forwarding is never broken.
fn rewrite_upstream(req: Request<Body>, upstream: &str) -> Result<Request<Body>, Request<Body>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri = Uri::builder()
        .scheme("https")
        .authority(upstream)
        .path_and_query(path_and_query)
        .build();

    match uri {
        Ok(uri) => {
            let (mut parts, body) = req.into_parts();
            parts.uri = uri;
            if let Ok(host_value) = upstream.parse::<hyper::header::HeaderValue>() {
                parts.headers.insert(hyper::header::HOST, host_value);
            }
            Ok(Request::from_parts(parts, body))
        }
        Err(e) => {
            tracing::warn!("failed to rewrite upstream uri: {e}");
            Err(req)
        }
    }
}

fn health_response() -> Response<Body> {
    Response::builder()
        .status(200)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(bytes_to_body(Bytes::from(
            r#"{"status":"ok","proxy":true}"#,
        )))
        .unwrap()
}

fn unknown_path_response(path: &str) -> Response<Body> {
    Response::builder()
        .status(400)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(bytes_to_body(Bytes::from(format!(
            "Unknown API path: {path}. Supported: Anthropic, OpenAI, Gemini"
        ))))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokentap_core::provider::ProviderRegistry;
    use tokentap_storage::store::EventStore;
    use tokentap_storage::{Database, EventFilter, EventSink, SinkConfig};

    const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Harness {
        controller: FlowController,
        sink: EventSink,
        db: Arc<Database>,
        _state_dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_registry(ProviderRegistry::bundled().unwrap())
        }

        fn with_registry(registry: ProviderRegistry) -> Self {
            let state_dir = TempDir::new().unwrap();
            let db = Arc::new(Database::in_memory().unwrap());
            let sink = EventSink::spawn(
                db.clone(),
                SinkConfig {
                    workers: 1,
                    ..Default::default()
                },
            );
            let config = HandlerConfig {
                registry: RegistryHandle::from_registry(registry),
                sink: sink.handle(),
                security: SecurityGate::load(state_dir.path()).unwrap(),
                resolver: ContextResolver::with_env(None, None, None, None),
                counters: Arc::new(TapCounters::new()),
            };
            Self {
                controller: FlowController::new(config),
                sink,
                db,
                _state_dir: state_dir,
            }
        }

        async fn stored_events(self) -> Vec<Event> {
            self.sink.drain(Duration::from_secs(5)).await;
            let (events, _) = self.db.query_events(&EventFilter::default(), 0, 100).unwrap();
            events.into_iter().map(|e| e.event).collect()
        }
    }

    fn json_request(host: &str, path: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("https://{host}{path}"))
            .header("content-type", "application/json")
            .header("user-agent", "claude-code/2.0 (darwin; arm64)")
            .body(bytes_to_body(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn json_response(status: u16, body: &Value) -> Response<Body> {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(bytes_to_body(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn read_body(res: Response<Body>) -> Bytes {
        res.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn health_endpoint_answers_inline() {
        let mut harness = Harness::new();
        let req = Request::builder()
            .method("GET")
            .uri("http://localhost/health")
            .body(Body::empty())
            .unwrap();

        match harness.controller.process_request(CLIENT_IP, req).await {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), 200);
                let body = read_body(res).await;
                let json: Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["status"], "ok");
                assert_eq!(json["proxy"], true);
            }
            RequestOrResponse::Request(_) => panic!("health must be answered inline"),
        }
    }

    #[tokio::test]
    async fn unknown_local_path_rejected_with_400() {
        let mut harness = Harness::new();
        let req = Request::builder()
            .method("POST")
            .uri("http://127.0.0.1/v9/unheard-of")
            .body(Body::empty())
            .unwrap();

        match harness.controller.process_request(CLIENT_IP, req).await {
            RequestOrResponse::Response(res) => assert_eq!(res.status(), 400),
            RequestOrResponse::Request(_) => panic!("unknown path must be rejected"),
        }
    }

    #[tokio::test]
    async fn compat_path_rewritten_to_upstream_host() {
        let mut harness = Harness::new();
        let req = json_request("localhost", "/v1/messages", &json!({"model": "claude-3"}));

        match harness.controller.process_request(CLIENT_IP, req).await {
            RequestOrResponse::Request(req) => {
                assert_eq!(req.uri().host(), Some("api.anthropic.com"));
                assert_eq!(req.uri().scheme_str(), Some("https"));
            }
            RequestOrResponse::Response(_) => panic!("compat request must be forwarded"),
        }
        // The post-rewrite host resolved to a provider.
        assert!(harness.controller.flow.is_some());
        assert_eq!(
            harness.controller.flow.as_ref().unwrap().provider_id,
            "anthropic"
        );
    }

    #[tokio::test]
    async fn unknown_host_is_passthrough_under_known_only() {
        let mut harness = Harness::new();
        let req = json_request("api.novel.example", "/v1/chat", &json!({"model": "x"}));

        match harness.controller.process_request(CLIENT_IP, req).await {
            RequestOrResponse::Request(_) => {}
            RequestOrResponse::Response(_) => panic!("passthrough must forward"),
        }
        assert!(harness.controller.flow.is_none());

        // The paired response also passes untouched and emits nothing.
        let res = json_response(200, &json!({"usage": {"input_tokens": 5}}));
        let _ = harness.controller.process_response(res).await;
        let events = harness.stored_events().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn telemetry_paths_emit_no_events() {
        let mut harness = Harness::new();
        let req = json_request("api.anthropic.com", "/v1/telemetry/batch", &json!({}));
        let _ = harness.controller.process_request(CLIENT_IP, req).await;
        assert!(harness.controller.flow.is_none());
    }

    #[tokio::test]
    async fn buffered_anthropic_flow_records_full_event() {
        let mut harness = Harness::new();

        let messages: Vec<Value> = (0..35)
            .map(|i| json!({"role": if i % 2 == 0 {"user"} else {"assistant"}, "content": format!("msg {i}")}))
            .collect();
        let request_body = json!({
            "model": "claude-sonnet-4-5-20250929",
            "messages": messages,
            "system": [
                {"type": "text", "text": "s1"},
                {"type": "text", "text": "s2"},
                {"type": "text", "text": "s3"}
            ]
        });

        let req = json_request("api.anthropic.com", "/v1/messages", &request_body);
        let _ = harness.controller.process_request(CLIENT_IP, req).await;

        let res = json_response(
            200,
            &json!({
                "model": "claude-sonnet-4-5-20250929",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 3, "output_tokens": 99, "cache_read_input_tokens": 54624}
            }),
        );
        let res = harness.controller.process_response(res).await;
        let _ = read_body(res).await;

        let events = harness.stored_events().await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.provider_id, "anthropic");
        assert_eq!(event.input_tokens, 3);
        assert_eq!(event.output_tokens, 99);
        assert_eq!(event.cache_read_tokens, 54624);
        assert_eq!(event.total_tokens, 102);
        assert_eq!(event.messages.len(), 35);
        assert_eq!(event.system.as_ref().unwrap().as_array().unwrap().len(), 3);
        assert!(!event.streaming);
        assert!(event.is_token_consuming);
        assert_eq!(event.client_type, ClientType::ClaudeCode);
        // Debug mode is off: content is redacted, raw payloads absent.
        assert_eq!(event.messages[0]["content"], "[REDACTED]");
        assert!(event.raw_request.is_none());
        assert!(event.response_status == 200);
    }

    #[tokio::test]
    async fn streamed_flow_uses_terminal_totals() {
        let mut harness = Harness::new();

        let req = json_request(
            "api.anthropic.com",
            "/v1/messages",
            &json!({"model": "claude-3", "messages": [{"role": "user", "content": "hi"}], "stream": true}),
        );
        let _ = harness.controller.process_request(CLIENT_IP, req).await;

        let frames = vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3\",\"usage\":{\"input_tokens\":10}}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":8}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":17}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":25}}\n\n",
        ];
        let chunks = frames
            .into_iter()
            .map(|f| Ok::<Bytes, std::io::Error>(Bytes::from(f)));
        let res = Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let tapped = harness.controller.process_response(res).await;

        // Drive the tapped body to completion, as the client would.
        let forwarded = read_body(tapped).await;
        assert!(std::str::from_utf8(&forwarded).unwrap().contains("message_start"));

        let events = harness.stored_events().await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.streaming);
        assert!(!event.truncated);
        assert_eq!(event.input_tokens, 10);
        assert_eq!(event.output_tokens, 25);
        assert_eq!(event.model, "claude-3");
    }

    #[tokio::test]
    async fn dropped_stream_emits_truncated_event() {
        let mut harness = Harness::new();

        let req = json_request(
            "api.anthropic.com",
            "/v1/messages",
            &json!({"model": "claude-3", "messages": [{"role": "user", "content": "hi"}], "stream": true}),
        );
        let _ = harness.controller.process_request(CLIENT_IP, req).await;

        let chunks = vec![Ok::<Bytes, std::io::Error>(Bytes::from(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10}}}\n\n",
        ))];
        let res = Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let tapped = harness.controller.process_response(res).await;
        // Client disconnects: the tapped body is dropped without being read.
        drop(tapped);

        let events = harness.stored_events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].truncated);
        assert!(events[0].streaming);
    }

    #[tokio::test]
    async fn quality_fallback_restores_message_count() {
        // A registry whose anthropic messages path collapses to one entry.
        let mut doc: Value =
            serde_json::from_str(tokentap_core::provider::BUNDLED_PROVIDERS).unwrap();
        doc["providers"]["anthropic"]["request"]["messages_path"] = json!("$.messages[0]");
        let registry = ProviderRegistry::from_value(doc).unwrap();
        let mut harness = Harness::with_registry(registry);

        let messages: Vec<Value> = (0..12)
            .map(|i| json!({"role": "user", "content": format!("m{i}")}))
            .collect();
        let req = json_request(
            "api.anthropic.com",
            "/v1/messages",
            &json!({"model": "claude-3", "messages": messages}),
        );
        let _ = harness.controller.process_request(CLIENT_IP, req).await;
        assert_eq!(
            harness.controller.config.counters.extract_degraded(),
            1,
            "degraded counter must increment"
        );

        let res = json_response(200, &json!({"usage": {"input_tokens": 1, "output_tokens": 1}}));
        let res = harness.controller.process_response(res).await;
        let _ = read_body(res).await;

        let events = harness.stored_events().await;
        assert_eq!(events[0].messages.len(), 12, "legacy extractor output wins");
    }

    #[tokio::test]
    async fn capture_all_records_unknown_provider_with_raw_request() {
        let mut doc: Value =
            serde_json::from_str(tokentap_core::provider::BUNDLED_PROVIDERS).unwrap();
        doc["capture_mode"] = json!("capture_all");
        let registry = ProviderRegistry::from_value(doc).unwrap();
        let mut harness = Harness::with_registry(registry);

        let req = json_request(
            "api.novel.example",
            "/api/generate",
            &json!({"model": "novel-1", "prompt": "hello there"}),
        );
        let _ = harness.controller.process_request(CLIENT_IP, req).await;

        let res = json_response(200, &json!({"output": "hi"}));
        let res = harness.controller.process_response(res).await;
        let _ = read_body(res).await;

        let events = harness.stored_events().await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.provider_id, "unknown");
        assert_eq!(event.capture_mode, CaptureMode::CaptureAll);
        assert!(event.raw_request.is_some(), "unknown profile captures raw");
        assert_eq!(event.input_tokens, 0);
    }

    #[tokio::test]
    async fn upstream_5xx_recorded_with_status() {
        let mut harness = Harness::new();
        let req = json_request(
            "api.anthropic.com",
            "/v1/messages",
            &json!({"model": "claude-3", "messages": [{"role": "user", "content": "hi"}]}),
        );
        let _ = harness.controller.process_request(CLIENT_IP, req).await;

        let res = json_response(529, &json!({"error": {"type": "overloaded_error"}}));
        let res = harness.controller.process_response(res).await;
        let _ = read_body(res).await;

        let events = harness.stored_events().await;
        assert_eq!(events[0].response_status, 529);
        assert_eq!(events[0].input_tokens, 0);
    }

    #[test]
    fn compat_routing_table() {
        assert_eq!(compat_provider_for_path("/v1/messages"), Some("anthropic"));
        assert_eq!(
            compat_provider_for_path("/v1/chat/completions"),
            Some("openai")
        );
        assert_eq!(compat_provider_for_path("/v1/responses"), Some("openai"));
        assert_eq!(
            compat_provider_for_path("/v1beta/models/gemini:streamGenerateContent"),
            Some("gemini")
        );
        assert_eq!(compat_provider_for_path("/v9/unheard-of"), None);
    }

    #[test]
    fn telemetry_path_matching() {
        assert!(is_telemetry_path("/v1/Telemetry/batch"));
        assert!(is_telemetry_path("/metrics"));
        assert!(is_telemetry_path("/ClientTelemetry"));
        assert!(!is_telemetry_path("/v1/messages"));
    }

    #[test]
    fn host_extraction_prefers_uri() {
        let req = Request::builder()
            .uri("https://api.anthropic.com/v1/messages")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_host(&req).as_deref(), Some("api.anthropic.com"));

        let req = Request::builder()
            .uri("/v1/messages")
            .header("host", "api.openai.com:443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_host(&req).as_deref(), Some("api.openai.com"));
    }

    #[test]
    fn cloned_controller_starts_without_flow_state() {
        let state_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let sink = EventSink::spawn(db, SinkConfig::default());
        let config = HandlerConfig {
            registry: RegistryHandle::from_registry(ProviderRegistry::bundled().unwrap()),
            sink: sink.handle(),
            security: SecurityGate::load(state_dir.path()).unwrap(),
            resolver: ContextResolver::with_env(None, None, None, None),
            counters: Arc::new(TapCounters::new()),
        };
        let controller = FlowController::new(config);
        let cloned = controller.clone();
        assert!(cloned.flow.is_none());
    }
}
