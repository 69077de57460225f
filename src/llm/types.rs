//! OpenAI-compatible wire types for the client-facing surface

use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Inbound chat completion request, kept loosely typed so that
/// validation can report exactly which field is wrong
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Requested model
    #[serde(default)]
    pub model: Option<String>,

    /// Conversation
    #[serde(default)]
    pub messages: Option<Vec<Value>>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Tool definitions
    #[serde(default)]
    pub tools: Option<Vec<Value>>,

    /// Tool choice: "auto" | "none" | "required" | {"type":"function","function":{"name":..}}
    #[serde(default)]
    pub tool_choice: Option<Value>,

    /// Sampling parameters and the like, accepted and ignored
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A validated conversation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on `tool` messages
    pub tool_call_id: Option<String>,
    /// Calls previously made by the assistant
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    /// Plain message with no tool metadata
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Validate one raw message at position `index`
    pub fn from_value(index: usize, value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            ParleyError::Validation(format!("messages[{}] must be an object", index))
        })?;

        let role = obj
            .get("role")
            .and_then(Value::as_str)
            .and_then(Role::parse)
            .ok_or_else(|| {
                ParleyError::Validation(format!(
                    "messages[{}].role must be one of system, user, assistant, tool",
                    index
                ))
            })?;

        let tool_calls = match obj.get("tool_calls") {
            Some(Value::Array(calls)) if role == Role::Assistant => calls
                .iter()
                .enumerate()
                .filter_map(|(i, call)| ToolCall::from_openai(i, call))
                .collect(),
            Some(Value::Array(_)) | Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(ParleyError::Validation(format!(
                    "messages[{}].tool_calls must be an array",
                    index
                )))
            }
        };

        let content = match obj.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => flatten_parts(index, parts)?,
            Some(Value::Null) | None if role == Role::Assistant && !tool_calls.is_empty() => {
                String::new()
            }
            Some(Value::Null) | None => {
                return Err(ParleyError::Validation(format!(
                    "messages[{}].content is required",
                    index
                )))
            }
            Some(_) => {
                return Err(ParleyError::Validation(format!(
                    "messages[{}].content must be a string or an array of text parts",
                    index
                )))
            }
        };

        let tool_call_id = obj
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(String::from);

        Ok(Self {
            role,
            content,
            tool_call_id,
            tool_calls,
        })
    }
}

fn flatten_parts(index: usize, parts: &[Value]) -> Result<String> {
    let mut texts = Vec::with_capacity(parts.len());
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some(other) => {
                return Err(ParleyError::Validation(format!(
                    "messages[{}] content part type '{}' is not supported",
                    index, other
                )))
            }
            None => {
                return Err(ParleyError::Validation(format!(
                    "messages[{}] content parts need a type",
                    index
                )))
            }
        }
    }
    Ok(texts.join("\n"))
}

/// A decoded tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

impl ToolCall {
    /// Render in the OpenAI `tool_calls` shape; `index` is set for stream deltas
    pub fn to_openai(&self, index: Option<usize>) -> Value {
        let mut value = serde_json::json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments,
            }
        });
        if let (Some(index), Some(obj)) = (index, value.as_object_mut()) {
            obj.insert("index".to_string(), Value::from(index));
        }
        value
    }

    /// Parse an OpenAI-shaped call from a request history
    fn from_openai(position: usize, value: &Value) -> Option<Self> {
        let function = value.get("function")?;
        let name = function.get("name")?.as_str()?.to_string();
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "{}".to_string(),
            Some(other) => other.to_string(),
        };
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("call_{}", position));
        Some(Self {
            id,
            name,
            arguments,
        })
    }
}

/// Why a completion stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

/// Non-streaming completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

/// One completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: FinishReason,
}

/// Assistant message in a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

/// Estimated token usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Content carried by this chunk's first choice
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    /// Finish reason of this chunk's first choice
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first()?.finish_reason
    }
}

/// One streamed choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    /// `null` while in progress
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message delta
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

/// `/v1/models` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

/// One advertised model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}
