//! End-to-end tests for the Parley gateway
//!
//! A hyper-based mock upstream serves the status handshake and the SSE chat
//! endpoint on an ephemeral port; the gateway and the HTTP server run against
//! it for real.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use parley::config::{Config, RateLimitBackend};
use parley::error::{AuthError, ParleyError, UpstreamError};
use parley::observability::{Metrics, Observability};
use parley::session::{Challenge, SessionNegotiator, CHALLENGE_HEADER, TOKEN_HEADER};
use parley::upstream::{build_http_client, UpstreamClient, UpstreamMessage, UpstreamRequest};
use parley::{GatewayService, Server};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

// ============================================================================
// Mock upstream
// ============================================================================

type ChatHandler = Arc<dyn Fn(u32, &Value) -> Response<Full<Bytes>> + Send + Sync>;

#[derive(Clone, Copy)]
enum StatusMode {
    Ok,
    NoChallenge,
    Reject(u16),
}

/// One chat call as the mock saw it
#[derive(Debug, Clone)]
struct RecordedChat {
    body: Value,
    token: Option<String>,
    hash: Option<String>,
}

struct MockState {
    status: StatusMode,
    chat: ChatHandler,
    chat_calls: AtomicU32,
    requests: Mutex<Vec<RecordedChat>>,
}

impl MockState {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/status" => self.status_response(),
            "/chat" => {
                let header = |name: &str| {
                    req.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from)
                };
                let token = header(TOKEN_HEADER);
                let hash = header(CHALLENGE_HEADER);
                let bytes = req.into_body().collect().await.unwrap().to_bytes();
                let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

                let n = self.chat_calls.fetch_add(1, Ordering::SeqCst);
                let response = (self.chat)(n, &body);
                self.requests.lock().push(RecordedChat { body, token, hash });
                response
            }
            _ => status_only(404),
        }
    }

    fn status_response(&self) -> Response<Full<Bytes>> {
        let builder = Response::builder().header(TOKEN_HEADER, "token-1");
        let builder = match self.status {
            StatusMode::Ok => builder.header(CHALLENGE_HEADER, challenge_header()),
            StatusMode::NoChallenge => builder,
            StatusMode::Reject(code) => return status_only(code),
        };
        builder.body(Full::new(Bytes::new())).unwrap()
    }
}

struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockUpstream {
    async fn start<F>(chat: F) -> Self
    where
        F: Fn(u32, &Value) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_with(StatusMode::Ok, chat).await
    }

    async fn start_with<F>(status: StatusMode, chat: F) -> Self
    where
        F: Fn(u32, &Value) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            status,
            chat: Arc::new(chat),
            chat_calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let shared = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let state = shared.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { Ok::<_, Infallible>(state.handle(req).await) }
                                });
                                let _ = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await;
                            });
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn chat_calls(&self) -> u32 {
        self.state.chat_calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<RecordedChat> {
        self.state.requests.lock().clone()
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.upstream.status_url = format!("http://{}/status", self.addr);
        config.upstream.chat_url = format!("http://{}/chat", self.addr);
        config.upstream.request_timeout = Duration::from_secs(5);
        config.upstream.stream_idle_timeout = Duration::from_secs(2);
        config.upstream.retry.base_backoff = Duration::from_millis(10);
        config.upstream.retry.max_retry_wait = Duration::from_secs(1);
        config.rate_limit.backend = RateLimitBackend::Memory;
        config.rate_limit.min_interval = Duration::ZERO;
        config
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn challenge_header() -> String {
    STANDARD.encode("{server_hashes: ['s1', 's2'], client_hashes: ['ua'], signal: {}}")
}

fn status_only(code: u16) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// An SSE body carrying `fragments`, then the `[DONE]` sentinel
fn sse(fragments: &[&str]) -> Response<Full<Bytes>> {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&format!("data: {}\n\n", json!({ "message": fragment })));
    }
    body.push_str("data: [DONE]\n\n");
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn rate_limited(retry_after: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(429)
        .header("retry-after", retry_after)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn hello_request() -> UpstreamRequest {
    UpstreamRequest {
        model: "gpt-4o-mini".to_string(),
        messages: vec![UpstreamMessage {
            role: "user",
            content: "Hi".to_string(),
        }],
    }
}

async fn gateway(config: &Config) -> GatewayService {
    GatewayService::from_config(config, Arc::new(Metrics::new().unwrap()))
        .await
        .unwrap()
}

// ============================================================================
// Session negotiation
// ============================================================================

#[tokio::test]
async fn test_negotiate_solves_challenge() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi"])).await;
    let config = upstream.config();
    let negotiator = SessionNegotiator::new(build_http_client(&config.upstream).unwrap(), &config.upstream);

    let credential = negotiator.negotiate().await.unwrap();
    assert_eq!(credential.token, "token-1");
    assert_eq!(credential.challenge.server_hashes, vec!["s1", "s2"]);

    let solved = STANDARD.decode(&credential.hash_header).unwrap();
    let solved: Value = serde_json::from_slice(&solved).unwrap();
    assert_eq!(solved["server_hashes"], json!(["s1", "s2"]));
    assert_eq!(
        solved["client_hashes"][0],
        json!(Challenge::parse("{client_hashes: ['ua'], server_hashes: []}")
            .unwrap()
            .client_digests()[0])
    );
    assert_eq!(solved["signals"], json!({}));
}

#[tokio::test]
async fn test_missing_challenge_header() {
    let upstream = MockUpstream::start_with(StatusMode::NoChallenge, |_, _| sse(&["Hi"])).await;
    let config = upstream.config();
    let negotiator = SessionNegotiator::new(build_http_client(&config.upstream).unwrap(), &config.upstream);

    assert_eq!(
        negotiator.negotiate().await.unwrap_err(),
        AuthError::MissingHeader(CHALLENGE_HEADER)
    );
}

#[tokio::test]
async fn test_rejected_handshake() {
    let upstream = MockUpstream::start_with(StatusMode::Reject(418), |_, _| sse(&["Hi"])).await;
    let config = upstream.config();
    let negotiator = SessionNegotiator::new(build_http_client(&config.upstream).unwrap(), &config.upstream);

    assert_eq!(
        negotiator.negotiate().await.unwrap_err(),
        AuthError::UpstreamStatus(418)
    );
}

// ============================================================================
// Upstream client
// ============================================================================

#[tokio::test]
async fn test_send_collects_reply() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi", " there"])).await;
    let config = upstream.config();
    let http = build_http_client(&config.upstream).unwrap();
    let negotiator = SessionNegotiator::new(http.clone(), &config.upstream);
    let client = UpstreamClient::new(http, &config.upstream);

    let credential = negotiator.negotiate().await.unwrap();
    let reply = client.send(&hello_request(), &credential).await.unwrap();
    assert_eq!(reply, "Hi there");

    let recorded = upstream.requests();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].token.as_deref(), Some("token-1"));
    assert_eq!(recorded[0].hash.as_deref(), Some(credential.hash_header.as_str()));
    assert_eq!(recorded[0].body["messages"][0]["role"], "user");
}

#[tokio::test]
async fn test_stream_yields_fragments() {
    use futures::StreamExt;

    let upstream = MockUpstream::start(|_, _| sse(&["Hi", " there"])).await;
    let config = upstream.config();
    let http = build_http_client(&config.upstream).unwrap();
    let negotiator = SessionNegotiator::new(http.clone(), &config.upstream);
    let client = UpstreamClient::new(http, &config.upstream);

    let credential = negotiator.negotiate().await.unwrap();
    let fragments: Vec<String> = client
        .stream(&hello_request(), &credential)
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(fragments, vec!["Hi", " there"]);
}

#[tokio::test]
async fn test_rate_limited_status() {
    let upstream = MockUpstream::start(|_, _| rate_limited("3")).await;
    let config = upstream.config();
    let http = build_http_client(&config.upstream).unwrap();
    let negotiator = SessionNegotiator::new(http.clone(), &config.upstream);
    let client = UpstreamClient::new(http, &config.upstream);

    let credential = negotiator.negotiate().await.unwrap();
    assert_eq!(
        client.send(&hello_request(), &credential).await.unwrap_err(),
        UpstreamError::RateLimited {
            retry_after_ms: 3_000
        }
    );
}

#[tokio::test]
async fn test_upstream_error_marker() {
    let upstream = MockUpstream::start(|_, _| {
        Response::builder()
            .body(Full::new(Bytes::from(
                "data: {\"message\":\"partial\"}\n\ndata: {\"action\":\"error\",\"type\":\"ERR_CONVERSATION_LIMIT\"}\n\n",
            )))
            .unwrap()
    })
    .await;
    let config = upstream.config();
    let http = build_http_client(&config.upstream).unwrap();
    let negotiator = SessionNegotiator::new(http.clone(), &config.upstream);
    let client = UpstreamClient::new(http, &config.upstream);

    let credential = negotiator.negotiate().await.unwrap();
    assert!(matches!(
        client.send(&hello_request(), &credential).await,
        Err(UpstreamError::Reported(_))
    ));
}

// ============================================================================
// Gateway
// ============================================================================

#[tokio::test]
async fn test_gateway_retries_upstream_429() {
    let upstream = MockUpstream::start(|n, _| {
        if n == 0 {
            rate_limited("0")
        } else {
            sse(&["Hi", " there"])
        }
    })
    .await;
    let gateway = gateway(&upstream.config()).await;

    let prepared = gateway
        .prepare(
            serde_json::from_value(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "Hi"}]
            }))
            .unwrap(),
        )
        .unwrap();
    let completion = gateway.complete(&prepared).await.unwrap();

    assert_eq!(upstream.chat_calls(), 2);
    assert_eq!(
        completion.choices[0].message.content.as_deref(),
        Some("Hi there")
    );
    let snapshot = gateway.limiter().snapshot().await.unwrap();
    assert_eq!(snapshot.window_events.len(), 2);
}

#[tokio::test]
async fn test_gateway_gives_up_on_long_pause() {
    let upstream = MockUpstream::start(|_, _| rate_limited("120")).await;
    let gateway = gateway(&upstream.config()).await;

    let prepared = gateway
        .prepare(
            serde_json::from_value(json!({
                "messages": [{"role": "user", "content": "Hi"}]
            }))
            .unwrap(),
        )
        .unwrap();
    let err = gateway.complete(&prepared).await.unwrap_err();

    assert!(matches!(
        err,
        ParleyError::Upstream(UpstreamError::RateLimited {
            retry_after_ms: 120_000
        })
    ));
    assert_eq!(upstream.chat_calls(), 1);
    assert!(gateway.limiter().snapshot().await.unwrap().limited);
}

#[tokio::test]
async fn test_gateway_auth_failure_skips_chat() {
    let upstream = MockUpstream::start_with(StatusMode::NoChallenge, |_, _| sse(&["Hi"])).await;
    let gateway = gateway(&upstream.config()).await;

    let prepared = gateway
        .prepare(
            serde_json::from_value(json!({
                "messages": [{"role": "user", "content": "Hi"}]
            }))
            .unwrap(),
        )
        .unwrap();
    let err = gateway.complete(&prepared).await.unwrap_err();

    assert!(matches!(
        err,
        ParleyError::Auth(AuthError::MissingHeader(CHALLENGE_HEADER))
    ));
    assert_eq!(upstream.chat_calls(), 0);
}

// ============================================================================
// HTTP server
// ============================================================================

struct RunningServer {
    base: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<parley::Result<()>>,
}

impl RunningServer {
    async fn start(config: Config) -> Self {
        let observability = Arc::new(Observability::new(&config.observability).unwrap());
        let gateway = GatewayService::from_config(&config, observability.metrics.clone())
            .await
            .unwrap();
        let server = Server::with_gateway(config, Arc::new(gateway), observability);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            base,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.url("/v1/chat/completions"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

/// Content deltas of an SSE response body, in order
fn sse_contents(body: &str) -> (Vec<String>, Vec<Value>) {
    let mut contents = Vec::new();
    let mut chunks = Vec::new();
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            continue;
        }
        let chunk: Value = serde_json::from_str(data).unwrap();
        if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
            contents.push(content.to_string());
        }
        chunks.push(chunk);
    }
    (contents, chunks)
}

#[tokio::test]
async fn test_server_health_models_and_metrics() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi"])).await;
    let server = RunningServer::start(upstream.config()).await;

    let health: Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"status": "ok"}));

    let models: Value = reqwest::get(server.url("/v1/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["object"], "list");
    assert!(models["data"]
        .as_array()
        .unwrap()
        .iter()
        .all(|m| m["object"] == "model"));

    let missing = reqwest::get(server.url("/nope")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let wrong_method = reqwest::get(server.url("/v1/chat/completions")).await.unwrap();
    assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);

    let metrics = reqwest::get(server.url("/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("parley_requests_total"));
    assert!(metrics.contains("route=\"/health\""));

    server.stop().await;
}

#[tokio::test]
async fn test_server_non_streaming_completion() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi", " there"])).await;
    let server = RunningServer::start(upstream.config()).await;

    let response = reqwest::Client::new()
        .post(server.url("/v1/chat/completions"))
        .header("x-request-id", "req-e2e-1")
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-e2e-1");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    // ceil(8 / 4)
    assert_eq!(body["usage"]["completion_tokens"], 2);
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));

    server.stop().await;
}

#[tokio::test]
async fn test_server_streaming_completion() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi", " there"])).await;
    let server = RunningServer::start(upstream.config()).await;

    let response = server
        .post(json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let body = response.text().await.unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));

    let (contents, chunks) = sse_contents(&body);
    assert_eq!(contents, vec!["Hi", " there"]);
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
    assert!(chunks
        .iter()
        .all(|c| c["object"] == "chat.completion.chunk" && c["id"] == chunks[0]["id"]));

    server.stop().await;
}

#[tokio::test]
async fn test_server_rejects_invalid_requests() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi"])).await;
    let server = RunningServer::start(upstream.config()).await;

    let response = server.post(json!({"model": "gpt-4o-mini", "messages": []})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let response = reqwest::Client::new()
        .post(server.url("/v1/chat/completions"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server
        .post(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"description": "no name"}}]
        }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("tools[0]"));

    assert_eq!(upstream.chat_calls(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_server_rejects_oversized_body() {
    let upstream = MockUpstream::start(|_, _| sse(&["Hi"])).await;
    let mut config = upstream.config();
    config.server.max_body_size = 64;
    let server = RunningServer::start(config).await;

    let response = server
        .post(json!({
            "messages": [{"role": "user", "content": "x".repeat(256)}]
        }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(upstream.chat_calls(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_server_tool_calls() {
    let reply = r#"{"tool_calls":[{"function":{"name":"get_weather","arguments":"{\"location\":\"SF\"}"}}]}"#;
    let upstream = MockUpstream::start(move |_, _| sse(&[&reply[..20], &reply[20..]])).await;
    let server = RunningServer::start(upstream.config()).await;

    let tools = json!([{
        "type": "function",
        "function": {
            "name": "get_weather",
            "description": "Current weather",
            "parameters": {
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }
        }
    }]);

    let response = server
        .post(json!({
            "messages": [{"role": "user", "content": "Weather in SF?"}],
            "tools": tools
        }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    let choice = &body["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    assert!(choice["message"]["content"].is_null());
    let call = &choice["message"]["tool_calls"][0];
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(call["function"]["arguments"], r#"{"location":"SF"}"#);
    assert!(call["id"].as_str().unwrap().starts_with("call_"));

    let response = server
        .post(json!({
            "stream": true,
            "messages": [{"role": "user", "content": "Weather in SF?"}],
            "tools": tools
        }))
        .await;
    let (contents, chunks) = sse_contents(&response.text().await.unwrap());
    assert!(contents.is_empty());
    assert_eq!(
        chunks[0]["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
        "get_weather"
    );
    assert_eq!(
        chunks.last().unwrap()["choices"][0]["finish_reason"],
        "tool_calls"
    );

    let recorded = upstream.requests();
    let first = recorded[0].body["messages"][0]["content"].as_str().unwrap();
    assert!(first.contains("Function: get_weather"));
    assert!(first.contains("location (string, required)"));

    server.stop().await;
}

#[tokio::test]
async fn test_server_maps_upstream_429() {
    let upstream = MockUpstream::start(|_, _| rate_limited("90")).await;
    let server = RunningServer::start(upstream.config()).await;

    let response = server
        .post(json!({"messages": [{"role": "user", "content": "Hi"}]}))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "90");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");

    server.stop().await;
}
