//! HTTP request handling for the OpenAI-compatible surface

use crate::error::{ErrorResponse, ParleyError, Result};
use crate::gateway::{GatewayService, PreparedRequest};
use crate::llm::{ChatCompletionRequest, StreamEvent};
use crate::observability::{AccessLogBuilder, AccessLogger, Observability, Timer};
use crate::request_id::{extract_request_id, RequestIdGenerator, X_REQUEST_ID};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Response body: buffered JSON or an SSE stream
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
const MODELS: &str = "/v1/models";
const HEALTH: &str = "/health";
const METRICS: &str = "/metrics";

/// Serves connections against a [`GatewayService`]
pub struct RequestHandler {
    gateway: Arc<GatewayService>,
    observability: Arc<Observability>,
    ids: RequestIdGenerator,
    max_body_size: usize,
}

impl RequestHandler {
    pub fn new(
        gateway: Arc<GatewayService>,
        observability: Arc<Observability>,
        max_body_size: usize,
    ) -> Self {
        Self {
            gateway,
            observability,
            ids: RequestIdGenerator::new("req"),
            max_body_size,
        }
    }

    /// Serve HTTP/1.1 on one connection until it closes or `drain` resolves.
    /// On drain the connection finishes its current request, then closes.
    pub async fn serve_connection<F>(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        drain: F,
    ) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let io = TokioIo::new(stream);
        let handler = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req, addr).await) }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);
        tokio::pin!(drain);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = &mut drain => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };

        if let Err(e) = result {
            if !e.is_incomplete_message() {
                debug!(client = %addr, error = %e, "HTTP connection error");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Handle one request
    pub async fn handle(&self, req: Request<Incoming>, addr: SocketAddr) -> Response<ResponseBody> {
        let timer = Timer::start();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = extract_request_id(req.headers()).unwrap_or_else(|| self.ids.generate());

        debug!(request_id = %request_id, method = %method, path = %path, "Processing request");

        let route = match (&method, path.as_str()) {
            (&Method::POST, CHAT_COMPLETIONS) => CHAT_COMPLETIONS,
            (&Method::GET, MODELS) => MODELS,
            (&Method::GET, HEALTH) => HEALTH,
            (&Method::GET, METRICS) => METRICS,
            (_, CHAT_COMPLETIONS | MODELS | HEALTH | METRICS) => "method_not_allowed",
            _ => "not_found",
        };

        let mut response = match route {
            CHAT_COMPLETIONS => {
                let log = AccessLogBuilder::new(request_id.clone(), addr.ip().to_string())
                    .request(method.as_str(), &path);
                self.chat_completions(req, log).await
            }
            MODELS => json_response(StatusCode::OK, &self.gateway.list_models()),
            HEALTH => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),
            METRICS => self.metrics(),
            "method_not_allowed" => self.error(&ErrorResponse {
                status: 405,
                error_type: "invalid_request_error",
                code: Some("method_not_allowed"),
                message: format!("Method {} is not allowed on {}", method, path),
                retry_after_secs: None,
            }),
            _ => self.error(&ErrorResponse {
                status: 404,
                error_type: "invalid_request_error",
                code: Some("not_found"),
                message: format!("Unknown route {}", path),
                retry_after_secs: None,
            }),
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        let status = response.status().as_u16();
        self.observability
            .metrics
            .record_request(method.as_str(), route, status, timer.elapsed());
        debug!(request_id = %request_id, status, "Request handled");

        response
    }

    async fn chat_completions(
        &self,
        req: Request<Incoming>,
        log: AccessLogBuilder,
    ) -> Response<ResponseBody> {
        let request = match self.read_json::<ChatCompletionRequest>(req).await {
            Ok(request) => request,
            Err(err) => return self.fail(log, &err),
        };

        let prepared = match self.gateway.prepare(request) {
            Ok(prepared) => prepared,
            Err(err) => return self.fail(log, &err),
        };
        let log = log.completion(&prepared.model, prepared.stream);

        if prepared.stream {
            self.stream_completion(prepared, log).await
        } else {
            match self.gateway.complete(&prepared).await {
                Ok(completion) => {
                    let tool_calls = completion
                        .choices
                        .first()
                        .and_then(|choice| choice.message.tool_calls.as_ref())
                        .map_or(0, Vec::len);
                    let response = json_response(StatusCode::OK, &completion);
                    self.observability
                        .access_logger
                        .log(&log.status(200).tool_calls(tool_calls).build());
                    response
                }
                Err(err) => self.fail(log, &err),
            }
        }
    }

    async fn stream_completion(
        &self,
        prepared: PreparedRequest,
        log: AccessLogBuilder,
    ) -> Response<ResponseBody> {
        let events = match self.gateway.complete_stream(prepared).await {
            Ok(events) => events,
            Err(err) => return self.fail(log, &err),
        };

        let mut stream_log = StreamLog {
            builder: Some(log.status(200)),
            logger: self.observability.access_logger.clone(),
            tool_calls: 0,
            error: None,
        };
        let frames = events.map(move |event| {
            stream_log.observe(&event);
            Ok::<_, std::io::Error>(Frame::data(event.to_sse()))
        });

        let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, req: Request<Incoming>) -> Result<T> {
        let body = Limited::new(req.into_body(), self.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ParleyError::Validation(format!(
                        "Request body exceeds {} bytes",
                        self.max_body_size
                    ))
                } else {
                    ParleyError::Http(format!("Failed to read request body: {}", e))
                }
            })?
            .to_bytes();

        serde_json::from_slice(&body)
            .map_err(|e| ParleyError::Validation(format!("Invalid JSON body: {}", e)))
    }

    fn metrics(&self) -> Response<ResponseBody> {
        match self.observability.metrics.export() {
            Ok(text) => {
                let mut response = Response::new(full(Bytes::from(text)));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(err) => self.error(&ErrorResponse::from(&err)),
        }
    }

    /// Log a failed completion and render its error
    fn fail(&self, log: AccessLogBuilder, err: &ParleyError) -> Response<ResponseBody> {
        let body = ErrorResponse::from(err);
        if body.status >= 500 {
            warn!(error = %err, "Completion failed");
        }
        let message = err.to_string();
        self.observability
            .access_logger
            .log(&log.status(body.status).error(Some(&message)).build());
        self.error(&body)
    }

    fn error(&self, body: &ErrorResponse) -> Response<ResponseBody> {
        self.observability.metrics.record_error(body.error_type);
        error_response(body)
    }
}

/// Writes the access log record when the stream ends or the client goes away
struct StreamLog {
    builder: Option<AccessLogBuilder>,
    logger: Arc<AccessLogger>,
    tool_calls: usize,
    error: Option<String>,
}

impl StreamLog {
    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Chunk(chunk) => {
                if let Some(calls) = chunk
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.tool_calls.as_ref())
                {
                    self.tool_calls += calls.len();
                }
            }
            StreamEvent::Error(err) => self.error = Some(err.message.clone()),
            StreamEvent::Done => {}
        }
    }
}

impl Drop for StreamLog {
    fn drop(&mut self) {
        if let Some(builder) = self.builder.take() {
            let entry = builder
                .tool_calls(self.tool_calls)
                .error(self.error.as_deref())
                .build();
            self.logger.log(&entry);
        }
    }
}

fn full(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => error_response(&ErrorResponse::from(&ParleyError::from(e))),
    }
}

/// Render an OpenAI-style error, with `Retry-After` when one applies
pub fn error_response(body: &ErrorResponse) -> Response<ResponseBody> {
    let mut response = Response::new(full(Bytes::from(body.to_json().to_string())));
    *response.status_mut() =
        StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(secs) = body.retry_after_secs {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
