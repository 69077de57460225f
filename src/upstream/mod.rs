//! Client for the upstream chat endpoint
//!
//! Provides:
//! - Conversation translation into the upstream's user/assistant-only format
//! - Buffered (`send`) and incremental (`stream`) chat calls
//! - Status classification, including 429 `retry-after` handling

mod sse;

pub use sse::{classify_data, collect_reply, error_marker, DataLine, SseLineDecoder};

use crate::config::UpstreamConfig;
use crate::error::{ParleyError, Result, UpstreamError};
use crate::llm::{render_tool_calls, ChatMessage, Role, FALLBACK_REPLY};
use crate::session::{SessionCredential, CHALLENGE_HEADER, TOKEN_HEADER};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Fragments of an in-progress reply
pub type FragmentStream =
    Pin<Box<dyn Stream<Item = std::result::Result<String, UpstreamError>> + Send>>;

/// Wait assumed when a 429 carries no usable `retry-after`
pub const DEFAULT_RETRY_AFTER_MS: u64 = 60_000;

/// One message as the upstream accepts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamMessage {
    pub role: &'static str,
    pub content: String,
}

/// Chat call payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
}

impl UpstreamRequest {
    /// Translate a validated conversation.
    ///
    /// The upstream only knows `user` and `assistant`: system prompts and tool
    /// results travel as user text, earlier tool calls as assistant text in the
    /// same JSON shape the model is asked to produce.
    pub fn from_conversation(model: impl Into<String>, messages: &[ChatMessage]) -> Self {
        let messages = messages
            .iter()
            .map(|message| match message.role {
                Role::System | Role::User => UpstreamMessage {
                    role: "user",
                    content: message.content.clone(),
                },
                Role::Tool => UpstreamMessage {
                    role: "user",
                    content: format!(
                        "Tool result for call {}:\n{}",
                        message.tool_call_id.as_deref().unwrap_or("unknown"),
                        message.content
                    ),
                },
                Role::Assistant if message.tool_calls.is_empty() => UpstreamMessage {
                    role: "assistant",
                    content: message.content.clone(),
                },
                Role::Assistant => {
                    let calls = render_tool_calls(&message.tool_calls);
                    let content = if message.content.trim().is_empty() {
                        calls
                    } else {
                        format!("{}\n{}", message.content, calls)
                    };
                    UpstreamMessage {
                        role: "assistant",
                        content,
                    }
                }
            })
            .collect();

        Self {
            model: model.into(),
            messages,
        }
    }

    /// Text sent upstream, for usage estimation
    pub fn prompt_texts(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(|m| m.content.as_str())
    }
}

/// Build the shared HTTP client
pub fn build_http_client(config: &UpstreamConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.request_timeout.min(Duration::from_secs(10)))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| ParleyError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Issues chat calls with a negotiated credential
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    chat_url: String,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            chat_url: config.chat_url.clone(),
            request_timeout: config.request_timeout,
            idle_timeout: config.stream_idle_timeout,
        }
    }

    fn request(
        &self,
        request: &UpstreamRequest,
        credential: &SessionCredential,
    ) -> reqwest::RequestBuilder {
        self.client
            .post(&self.chat_url)
            .header(http::header::ACCEPT, "text/event-stream")
            .header(http::header::USER_AGENT, &credential.user_agent)
            .header(TOKEN_HEADER, &credential.token)
            .header(CHALLENGE_HEADER, &credential.hash_header)
            .json(request)
    }

    /// Complete reply text, or [`FALLBACK_REPLY`] if the upstream sent none
    pub async fn send(
        &self,
        request: &UpstreamRequest,
        credential: &SessionCredential,
    ) -> std::result::Result<String, UpstreamError> {
        debug!(model = %request.model, messages = request.messages.len(), "Sending chat request");

        let response = self
            .request(request, credential)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check_status(response)?;
        let body = response.text().await?;

        let reply = collect_reply(&body)?;
        if reply.is_empty() {
            warn!(model = %request.model, "Upstream reply was empty, using fallback");
            return Ok(FALLBACK_REPLY.to_string());
        }
        Ok(reply)
    }

    /// Reply fragments as they arrive.
    ///
    /// The request timeout bounds the wait for response headers, the idle
    /// timeout each read after that. Dropping the stream closes the connection.
    pub async fn stream(
        &self,
        request: &UpstreamRequest,
        credential: &SessionCredential,
    ) -> std::result::Result<FragmentStream, UpstreamError> {
        debug!(model = %request.model, messages = request.messages.len(), "Opening chat stream");

        let response =
            tokio::time::timeout(self.request_timeout, self.request(request, credential).send())
                .await
                .map_err(|_| UpstreamError::Timeout)??;
        let response = check_status(response)?;

        Ok(fragment_stream(response.bytes_stream().boxed(), self.idle_timeout))
    }
}

fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_ms = retry_after_ms(response.headers());
        warn!(retry_after_ms, "Upstream rate limited the chat call");
        return Err(UpstreamError::RateLimited { retry_after_ms });
    }
    warn!(status = %status, "Upstream returned error status");
    Err(UpstreamError::HttpStatus(status.as_u16()))
}

/// `retry-after` in milliseconds; only the delta-seconds form is honored
pub fn retry_after_ms(headers: &http::HeaderMap) -> u64 {
    headers
        .get(http::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0).ceil() as u64)
        .unwrap_or(DEFAULT_RETRY_AFTER_MS)
}

struct ReadState<B> {
    body: B,
    decoder: SseLineDecoder,
    pending: VecDeque<String>,
    idle_timeout: Duration,
    finished: bool,
}

/// Decode a raw byte stream into reply fragments
pub fn fragment_stream<B, E>(body: B, idle_timeout: Duration) -> FragmentStream
where
    B: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<UpstreamError> + Send + 'static,
{
    let state = ReadState {
        body,
        decoder: SseLineDecoder::new(),
        pending: VecDeque::new(),
        idle_timeout,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(data) = st.pending.pop_front() {
                match classify_data(&data) {
                    DataLine::Fragment(text) => return Some((Ok(text), st)),
                    DataLine::Done => return None,
                    DataLine::Error(description) => {
                        st.finished = true;
                        st.pending.clear();
                        return Some((Err(UpstreamError::Reported(description)), st));
                    }
                    DataLine::Empty => continue,
                    DataLine::Unparsable => {
                        debug!(line = %data, "Skipping unparsable stream line");
                        continue;
                    }
                }
            }
            if st.finished {
                return None;
            }
            match tokio::time::timeout(st.idle_timeout, st.body.next()).await {
                Err(_) => {
                    warn!("Upstream stream idle timeout");
                    st.finished = true;
                    return Some((Err(UpstreamError::Timeout), st));
                }
                Ok(Some(Ok(bytes))) => st.pending.extend(st.decoder.feed(&bytes)),
                Ok(Some(Err(e))) => {
                    st.finished = true;
                    return Some((Err(e.into()), st));
                }
                Ok(None) => {
                    st.finished = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http::HeaderValue;

    fn body(
        parts: Vec<&'static str>,
    ) -> impl Stream<Item = std::result::Result<Bytes, UpstreamError>> + Send + Unpin + 'static {
        stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(parts: Vec<&'static str>) -> Vec<std::result::Result<String, UpstreamError>> {
        fragment_stream(body(parts), Duration::from_secs(5)).collect().await
    }

    #[tokio::test]
    async fn test_stream_yields_fragments_across_reads() {
        let items = collect(vec![
            "data: {\"message\":\"Hi\"}\n\ndata: {\"mes",
            "sage\":\" there\"}\n\n",
            "data: [DONE]\n\n",
            "data: {\"message\":\"ignored\"}\n\n",
        ])
        .await;
        let fragments: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(fragments, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn test_stream_error_object_fails() {
        let items = collect(vec![
            "data: {\"message\":\"a\"}\n\ndata: {\"action\":\"error\",\"type\":\"boom\"}\n\ndata: {\"message\":\"b\"}\n\n",
        ])
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Err(UpstreamError::Reported("boom".to_string())));
    }

    #[tokio::test]
    async fn test_stream_tail_without_newline() {
        let items = collect(vec!["data: {\"message\":\"tail\"}"]).await;
        assert_eq!(items, vec![Ok("tail".to_string())]);
    }

    #[tokio::test]
    async fn test_stream_idle_timeout() {
        let pending = stream::iter(vec![Ok::<_, UpstreamError>(Bytes::from_static(
            b"data: {\"message\":\"a\"}\n",
        ))])
        .chain(stream::pending());
        let items: Vec<_> = fragment_stream(Box::pin(pending), Duration::from_millis(20))
            .collect()
            .await;
        assert_eq!(items, vec![Ok("a".to_string()), Err(UpstreamError::Timeout)]);
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = http::HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), DEFAULT_RETRY_AFTER_MS);

        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_ms(&headers), 7_000);

        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_ms(&headers), DEFAULT_RETRY_AFTER_MS);
    }

    #[test]
    fn test_conversation_translation() {
        let mut assistant = ChatMessage::new(Role::Assistant, "");
        assistant.tool_calls = vec![crate::llm::ToolCall {
            id: "call_1".to_string(),
            name: "get_weather".to_string(),
            arguments: "{\"location\":\"SF\"}".to_string(),
        }];
        let mut tool = ChatMessage::new(Role::Tool, "sunny");
        tool.tool_call_id = Some("call_1".to_string());

        let request = UpstreamRequest::from_conversation(
            "gpt-4o-mini",
            &[
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "weather?"),
                assistant,
                tool,
            ],
        );

        let roles: Vec<&str> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "user", "assistant", "user"]);
        assert_eq!(request.messages[0].content, "be brief");
        assert!(request.messages[2].content.starts_with("{\"tool_calls\":"));
        assert_eq!(request.messages[3].content, "Tool result for call call_1:\nsunny");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][1]["role"], "user");
    }
}
