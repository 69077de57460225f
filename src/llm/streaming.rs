//! Streaming response translation
//!
//! Turns the upstream's plain text fragments into OpenAI
//! `chat.completion.chunk` events, framed as Server-Sent Events.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{ErrorResponse, ParleyError, UpstreamError};
use crate::llm::types::{
    ChatCompletionChunk, ChunkChoice, Delta, FinishReason, Role, ToolCall,
};
use crate::llm::FALLBACK_REPLY;

/// One event of a translated stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A completion chunk
    Chunk(ChatCompletionChunk),
    /// The upstream failed mid-stream
    Error(ErrorResponse),
    /// The `[DONE]` sentinel
    Done,
}

impl StreamEvent {
    /// Frame as an SSE message
    pub fn to_sse(&self) -> Bytes {
        match self {
            StreamEvent::Chunk(chunk) => match serde_json::to_string(chunk) {
                Ok(json) => Bytes::from(format_sse_data(&json)),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize chunk");
                    Bytes::new()
                }
            },
            StreamEvent::Error(err) => Bytes::from(format_sse_data(&err.to_json().to_string())),
            StreamEvent::Done => Bytes::from_static(format_sse_done().as_bytes()),
        }
    }

    /// The chunk, if this is one
    pub fn as_chunk(&self) -> Option<&ChatCompletionChunk> {
        match self {
            StreamEvent::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }
}

/// Builds the chunks of a single completion
#[derive(Debug, Clone)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    emitted_content: bool,
}

enum Phase {
    Streaming,
    Finishing,
    Sentinel,
    Finished,
}

impl StreamTranslator {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            role_sent: false,
            emitted_content: false,
        }
    }

    /// Content chunk; the first chunk of the stream also carries the role
    pub fn content(&mut self, fragment: &str) -> ChatCompletionChunk {
        if !fragment.is_empty() {
            self.emitted_content = true;
        }
        let delta = Delta {
            role: self.take_role(),
            content: Some(fragment.to_string()),
            tool_calls: None,
        };
        self.chunk(delta, None)
    }

    /// Single chunk carrying every call as an indexed delta
    pub fn tool_calls(&mut self, calls: &[ToolCall]) -> ChatCompletionChunk {
        let delta = Delta {
            role: self.take_role(),
            content: None,
            tool_calls: Some(
                calls
                    .iter()
                    .enumerate()
                    .map(|(i, call)| call.to_openai(Some(i)))
                    .collect(),
            ),
        };
        self.chunk(delta, None)
    }

    /// Terminal empty-delta chunk
    pub fn finish(&self, reason: FinishReason) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(reason))
    }

    fn take_role(&mut self) -> Option<Role> {
        if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some(Role::Assistant)
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Translate an upstream fragment stream.
    ///
    /// Yields one content chunk per non-empty fragment in arrival order, then a
    /// `stop` chunk and `Done`. An upstream error yields `Error` then `Done`.
    /// Dropping the returned stream drops `upstream`.
    pub fn translate<S>(self, upstream: S) -> impl Stream<Item = StreamEvent> + Send
    where
        S: Stream<Item = std::result::Result<String, UpstreamError>> + Send + Unpin + 'static,
    {
        futures::stream::unfold(
            (self, upstream, Phase::Streaming),
            |(mut translator, mut upstream, phase)| async move {
                match phase {
                    Phase::Streaming => loop {
                        match upstream.next().await {
                            Some(Ok(fragment)) if fragment.is_empty() => continue,
                            Some(Ok(fragment)) => {
                                let chunk = translator.content(&fragment);
                                return Some((
                                    StreamEvent::Chunk(chunk),
                                    (translator, upstream, Phase::Streaming),
                                ));
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, completion_id = %translator.id, "Upstream stream failed");
                                let response = ErrorResponse::from(&ParleyError::Upstream(e));
                                return Some((
                                    StreamEvent::Error(response),
                                    (translator, upstream, Phase::Sentinel),
                                ));
                            }
                            None if !translator.emitted_content => {
                                debug!(completion_id = %translator.id, "Upstream stream was empty, sending fallback reply");
                                let chunk = translator.content(FALLBACK_REPLY);
                                return Some((
                                    StreamEvent::Chunk(chunk),
                                    (translator, upstream, Phase::Finishing),
                                ));
                            }
                            None => {
                                let chunk = translator.finish(FinishReason::Stop);
                                return Some((
                                    StreamEvent::Chunk(chunk),
                                    (translator, upstream, Phase::Sentinel),
                                ));
                            }
                        }
                    },
                    Phase::Finishing => {
                        let chunk = translator.finish(FinishReason::Stop);
                        Some((
                            StreamEvent::Chunk(chunk),
                            (translator, upstream, Phase::Sentinel),
                        ))
                    }
                    Phase::Sentinel => {
                        Some((StreamEvent::Done, (translator, upstream, Phase::Finished)))
                    }
                    Phase::Finished => None,
                }
            },
        )
    }
}

/// Format SSE data line
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Format SSE done marker
pub fn format_sse_done() -> &'static str {
    "data: [DONE]\n\n"
}
