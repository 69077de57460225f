//! Request orchestration
//!
//! A completion runs as: validate and augment the conversation, wait for the
//! rate limiter, negotiate a session, call the upstream, then shape the reply
//! (tool call extraction, streaming translation, usage estimates).

use crate::config::{Config, RetryConfig};
use crate::error::{AuthError, ParleyError, Result, UpstreamError};
use crate::llm::{
    build_system_prompt, estimate_tokens, estimate_total, extract_tool_calls, validate_tools,
    ChatCompletion, ChatCompletionRequest, ChatMessage, Choice, FinishReason, ModelCatalog,
    ModelList, ResponseMessage, Role, StreamEvent, StreamTranslator, ToolChoice, ToolDefinition,
    Usage,
};
use crate::observability::{Metrics, Timer};
use crate::rate_limit::RateLimiter;
use crate::request_id::RequestIdGenerator;
use crate::session::{SessionCredential, SessionNegotiator};
use crate::upstream::{build_http_client, FragmentStream, UpstreamClient, UpstreamRequest};
use futures::stream::{self, BoxStream};
use futures::{Future, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A validated request, ready to send
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub completion_id: String,
    /// Client-facing model id
    pub model: String,
    pub created: i64,
    pub stream: bool,
    pub tool_choice: ToolChoice,
    /// Whether the reply should be scanned for tool calls
    pub tools_active: bool,
    pub upstream: UpstreamRequest,
}

/// The OpenAI-compatible chat service
pub struct GatewayService {
    catalog: ModelCatalog,
    negotiator: SessionNegotiator,
    upstream: UpstreamClient,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    ids: RequestIdGenerator,
    metrics: Arc<Metrics>,
}

impl GatewayService {
    /// Assemble from an existing limiter
    pub fn new(config: &Config, limiter: Arc<RateLimiter>, metrics: Arc<Metrics>) -> Result<Self> {
        let client = build_http_client(&config.upstream)?;
        Ok(Self {
            catalog: ModelCatalog::new(&config.models),
            negotiator: SessionNegotiator::new(client.clone(), &config.upstream),
            upstream: UpstreamClient::new(client, &config.upstream),
            limiter,
            retry: config.upstream.retry.clone(),
            ids: RequestIdGenerator::completions(),
            metrics,
        })
    }

    /// Assemble with the configured rate limit backend
    pub async fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit).await?);
        Self::new(config, limiter, metrics)
    }

    /// The `/v1/models` listing
    pub fn list_models(&self) -> ModelList {
        self.catalog.list()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Validate a request and build the upstream conversation. Makes no
    /// network calls.
    pub fn prepare(&self, request: ChatCompletionRequest) -> Result<PreparedRequest> {
        let raw_messages = request
            .messages
            .ok_or_else(|| ParleyError::Validation("messages is required".to_string()))?;
        if raw_messages.is_empty() {
            return Err(ParleyError::Validation(
                "messages must not be empty".to_string(),
            ));
        }

        let mut conversation = raw_messages
            .iter()
            .enumerate()
            .map(|(i, raw)| ChatMessage::from_value(i, raw))
            .collect::<Result<Vec<_>>>()?;

        let tools = request.tools.unwrap_or_default();
        let validation = validate_tools(&tools);
        if !validation.valid {
            return Err(ParleyError::Validation(validation.errors.join("; ")));
        }
        let definitions: Vec<ToolDefinition> =
            tools.iter().filter_map(ToolDefinition::from_value).collect();

        let tool_choice = ToolChoice::from_value(request.tool_choice.as_ref())?;
        match &tool_choice {
            ToolChoice::Function(name) if !definitions.iter().any(|d| &d.name == name) => {
                return Err(ParleyError::Validation(format!(
                    "tool_choice names unknown function '{}'",
                    name
                )));
            }
            ToolChoice::Required if definitions.is_empty() => {
                return Err(ParleyError::Validation(
                    "tool_choice 'required' needs at least one tool".to_string(),
                ));
            }
            _ => {}
        }

        if !definitions.is_empty() {
            let prompt = build_system_prompt(&definitions, &tool_choice);
            conversation.insert(0, ChatMessage::new(Role::System, prompt));
        }
        let tools_active = !definitions.is_empty() && tool_choice.allows_calls();

        let entry = self.catalog.resolve(request.model.as_deref());
        debug!(
            model = %entry.id,
            upstream_model = %entry.upstream_id(),
            messages = conversation.len(),
            tools = definitions.len(),
            "Prepared completion request"
        );

        Ok(PreparedRequest {
            completion_id: self.ids.generate(),
            model: entry.id.clone(),
            created: chrono::Utc::now().timestamp(),
            stream: request.stream,
            tool_choice,
            tools_active,
            upstream: UpstreamRequest::from_conversation(entry.upstream_id(), &conversation),
        })
    }

    /// Non-streaming completion
    pub async fn complete(&self, prepared: &PreparedRequest) -> Result<ChatCompletion> {
        let upstream = &self.upstream;
        let request = &prepared.upstream;
        let reply = self
            .call_upstream("send", |credential| async move {
                upstream.send(request, &credential).await
            })
            .await?;

        let calls = if prepared.tools_active {
            extract_tool_calls(&reply)
        } else {
            Vec::new()
        };
        let usage = Usage::new(
            estimate_total(prepared.upstream.prompt_texts()),
            estimate_tokens(&reply),
        );

        let (message, finish_reason) = if calls.is_empty() {
            (
                ResponseMessage {
                    role: Role::Assistant,
                    content: Some(reply),
                    tool_calls: None,
                },
                FinishReason::Stop,
            )
        } else {
            self.metrics.record_tool_calls(calls.len());
            (
                ResponseMessage {
                    role: Role::Assistant,
                    content: None,
                    tool_calls: Some(calls.iter().map(|c| c.to_openai(None)).collect()),
                },
                FinishReason::ToolCalls,
            )
        };

        Ok(ChatCompletion {
            id: prepared.completion_id.clone(),
            object: "chat.completion".to_string(),
            created: prepared.created,
            model: prepared.model.clone(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        })
    }

    /// Streaming completion.
    ///
    /// Failures before the upstream starts answering are returned as errors;
    /// later failures arrive in-stream. With tools active the reply is
    /// buffered so a tool call can be sent as a single delta.
    pub async fn complete_stream(
        &self,
        prepared: PreparedRequest,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        let upstream = &self.upstream;
        let request = &prepared.upstream;
        let fragments = self
            .call_upstream("stream", |credential| async move {
                upstream.stream(request, &credential).await
            })
            .await?;

        let translator = StreamTranslator::new(
            prepared.completion_id.clone(),
            prepared.model.clone(),
            prepared.created,
        );

        if !prepared.tools_active {
            return Ok(translator.translate(fragments).boxed());
        }

        let metrics = self.metrics.clone();
        Ok(stream::once(buffered_tool_stream(translator, fragments, metrics))
            .flatten()
            .boxed())
    }

    /// Admission, handshake and one upstream call, retrying upstream 429s
    async fn call_upstream<T, F, Fut>(&self, mode: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut(SessionCredential) -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let mut retries: u32 = 0;
        loop {
            match self.limiter.acquire().await {
                Ok(waited) => self.metrics.record_rate_limit_wait(waited),
                Err(e) => warn!(error = %e, "Rate limiter unavailable, calling without admission"),
            }

            let credential = match self.negotiator.negotiate().await {
                Ok(credential) => {
                    self.metrics.record_negotiation("ok");
                    credential
                }
                Err(e) => {
                    self.metrics.record_negotiation(auth_outcome(&e));
                    warn!(error = %e, "Session negotiation failed");
                    return Err(e.into());
                }
            };

            let timer = Timer::start();
            let err = match call(credential).await {
                Ok(value) => {
                    self.metrics.record_upstream_call(mode, "ok", timer.elapsed());
                    return Ok(value);
                }
                Err(e) => e,
            };
            self.metrics
                .record_upstream_call(mode, upstream_outcome(&err), timer.elapsed());

            let UpstreamError::RateLimited { retry_after_ms } = err else {
                return Err(err.into());
            };

            let retry_after = Duration::from_millis(retry_after_ms);
            if let Err(e) = self.limiter.mark_limited(retry_after).await {
                warn!(error = %e, "Failed to record upstream pause");
            }

            if retries >= self.retry.max_retries {
                return Err(err.into());
            }
            let backoff = self
                .retry
                .base_backoff
                .saturating_mul(2u32.saturating_pow(retries));
            let delay = backoff.max(retry_after);
            if delay > self.retry.max_retry_wait {
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    "Upstream pause exceeds the retry budget"
                );
                return Err(err.into());
            }

            retries += 1;
            self.metrics.record_rate_limit_retry();
            info!(
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying after upstream rate limit"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Collect the whole reply, then emit either its tool calls or the original
/// fragments in order
async fn buffered_tool_stream(
    mut translator: StreamTranslator,
    mut fragments: FragmentStream,
    metrics: Arc<Metrics>,
) -> BoxStream<'static, StreamEvent> {
    let mut collected: Vec<String> = Vec::new();
    while let Some(item) = fragments.next().await {
        match item {
            Ok(fragment) => collected.push(fragment),
            Err(e) => {
                let replay: Vec<std::result::Result<String, UpstreamError>> = collected
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(e)))
                    .collect();
                return translator.translate(stream::iter(replay)).boxed();
            }
        }
    }

    let calls = extract_tool_calls(&collected.concat());
    if calls.is_empty() {
        let replay: Vec<std::result::Result<String, UpstreamError>> =
            collected.into_iter().map(Ok).collect();
        return translator.translate(stream::iter(replay)).boxed();
    }

    metrics.record_tool_calls(calls.len());
    let delta = translator.tool_calls(&calls);
    let finish = translator.finish(FinishReason::ToolCalls);
    stream::iter(vec![
        StreamEvent::Chunk(delta),
        StreamEvent::Chunk(finish),
        StreamEvent::Done,
    ])
    .boxed()
}

fn auth_outcome(err: &AuthError) -> &'static str {
    match err {
        AuthError::UpstreamStatus(_) => "upstream_status",
        AuthError::MissingHeader(_) => "missing_header",
        AuthError::MalformedChallenge(_) => "malformed_challenge",
        AuthError::Transport(_) => "transport",
    }
}

fn upstream_outcome(err: &UpstreamError) -> &'static str {
    match err {
        UpstreamError::RateLimited { .. } => "rate_limited",
        UpstreamError::HttpStatus(_) => "http_status",
        UpstreamError::Reported(_) => "reported",
        UpstreamError::Timeout => "timeout",
        UpstreamError::Transport(_) => "transport",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{MemoryStore, RateLimitPolicy};
    use serde_json::json;

    fn service() -> GatewayService {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateLimitPolicy::default(),
        ));
        GatewayService::new(
            &Config::default(),
            limiter,
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
    }

    fn request(body: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_empty_messages_rejected() {
        let err = service()
            .prepare(request(json!({"model": "gpt-4o-mini", "messages": []})))
            .unwrap_err();
        assert!(matches!(err, ParleyError::Validation(_)));

        let err = service()
            .prepare(request(json!({"model": "gpt-4o-mini"})))
            .unwrap_err();
        assert!(matches!(err, ParleyError::Validation(_)));
    }

    #[test]
    fn test_prepare_translates_and_resolves_model() {
        let prepared = service()
            .prepare(request(json!({
                "model": "claude-3-haiku",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "Hi"}
                ],
                "temperature": 0.2
            })))
            .unwrap();

        assert_eq!(prepared.model, "claude-3-haiku");
        assert_eq!(prepared.upstream.model, "claude-3-haiku-20240307");
        assert!(prepared.completion_id.starts_with("chatcmpl-"));
        assert!(!prepared.tools_active);
        assert!(prepared.upstream.messages.iter().all(|m| m.role == "user"));
    }

    #[test]
    fn test_prepare_adds_tool_prompt() {
        let prepared = service()
            .prepare(request(json!({
                "messages": [{"role": "user", "content": "weather in SF?"}],
                "tools": [{
                    "type": "function",
                    "function": {"name": "get_weather", "parameters": {"type": "object"}}
                }],
                "tool_choice": "required"
            })))
            .unwrap();

        assert!(prepared.tools_active);
        assert_eq!(prepared.tool_choice, ToolChoice::Required);
        assert_eq!(prepared.upstream.messages.len(), 2);
        assert!(prepared.upstream.messages[0]
            .content
            .contains("Function: get_weather"));
        assert_eq!(prepared.model, "gpt-4o-mini");
    }

    #[test]
    fn test_tool_choice_none_keeps_prompt_but_disables_parsing() {
        let prepared = service()
            .prepare(request(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [{"type": "function", "function": {"name": "f"}}],
                "tool_choice": "none"
            })))
            .unwrap();
        assert!(!prepared.tools_active);
        assert!(prepared.upstream.messages[0].content.contains("Do NOT call"));
    }

    #[test]
    fn test_invalid_tools_rejected_with_all_errors() {
        let err = service()
            .prepare(request(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [
                    {"type": "function", "function": {}},
                    {"type": "other", "function": {"name": "ok"}}
                ]
            })))
            .unwrap_err()
            .to_string();
        assert!(err.contains("tools[0].function.name"));
        assert!(err.contains("tools[1].type"));
    }

    #[test]
    fn test_unknown_forced_function_rejected() {
        let err = service()
            .prepare(request(json!({
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [{"type": "function", "function": {"name": "f"}}],
                "tool_choice": {"type": "function", "function": {"name": "g"}}
            })))
            .unwrap_err();
        assert!(matches!(err, ParleyError::Validation(_)));
    }

    #[test]
    fn test_list_models() {
        let models = service().list_models();
        assert_eq!(models.object, "list");
        assert!(models.data.iter().any(|m| m.id == "gpt-4o-mini"));
    }
}
