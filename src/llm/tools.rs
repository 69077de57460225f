//! Emulated function calling
//!
//! The upstream model has no native tool support. Tools are described to it in
//! an instruction block, and its free-text reply is decoded back into calls.
//! Decoding is best effort with a fixed fallback order:
//!
//! 1. the whole reply (optionally fenced) is JSON with a `tool_calls` array
//! 2. a `tool_calls: [...]` span somewhere in the reply parses as a JSON array
//! 3. individual `function: {name: "...", arguments: ...}` fragments
//!
//! A reply that matches none of these simply has no tool calls.

use crate::error::{ParleyError, Result};
use crate::llm::types::ToolCall;
use regex::Regex;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::debug;

static TOOL_CALLS_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""?tool_calls"?\s*:\s*\["#).unwrap());

static FUNCTION_FRAGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)"?function"?\s*:\s*\{\s*"?name"?\s*:\s*"([^"]+)"\s*,\s*"?arguments"?\s*:\s*("(?:[^"\\]|\\.)*"|\{)"#,
    )
    .unwrap()
});

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n?(.*?)\n?```$").unwrap());

/// A tool offered to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Vec<ToolParameter>,
}

/// One named parameter of a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: String,
    pub description: Option<String>,
    pub required: bool,
}

impl ToolDefinition {
    /// Read an OpenAI tool object; returns `None` if it has no usable name.
    /// Run [`validate_tools`] first to get error messages.
    pub fn from_value(value: &Value) -> Option<Self> {
        let function = value.get("function")?;
        let name = function
            .get("name")?
            .as_str()
            .filter(|s| !s.trim().is_empty())?
            .to_string();
        let description = function
            .get("description")
            .and_then(Value::as_str)
            .map(String::from);

        let mut parameters = Vec::new();
        if let Some(schema) = function.get("parameters") {
            let required: Vec<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (param_name, schema) in properties {
                    parameters.push(ToolParameter {
                        name: param_name.clone(),
                        param_type: schema_type(schema),
                        description: schema
                            .get("description")
                            .and_then(Value::as_str)
                            .map(String::from),
                        required: required.contains(&param_name.as_str()),
                    });
                }
            }
        }

        Some(Self {
            name,
            description,
            parameters,
        })
    }
}

fn schema_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("|"),
        _ if schema.get("enum").is_some() => "enum".to_string(),
        _ => "any".to_string(),
    }
}

/// How the model may use the offered tools
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force this function
    Function(String),
}

impl ToolChoice {
    /// Parse the request's `tool_choice`; absent means `auto`
    pub fn from_value(value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(ToolChoice::Auto),
            Some(Value::String(s)) => match s.as_str() {
                "auto" => Ok(ToolChoice::Auto),
                "none" => Ok(ToolChoice::None),
                "required" => Ok(ToolChoice::Required),
                other => Err(ParleyError::Validation(format!(
                    "tool_choice '{}' is not one of auto, none, required",
                    other
                ))),
            },
            Some(obj @ Value::Object(_)) => obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(|name| ToolChoice::Function(name.to_string()))
                .ok_or_else(|| {
                    ParleyError::Validation(
                        "tool_choice object must name a function".to_string(),
                    )
                }),
            Some(_) => Err(ParleyError::Validation(
                "tool_choice must be a string or an object".to_string(),
            )),
        }
    }

    /// Whether replies should be scanned for calls
    pub fn allows_calls(&self) -> bool {
        !matches!(self, ToolChoice::None)
    }
}

/// Outcome of [`validate_tools`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Check every tool, collecting all problems rather than stopping at the first
pub fn validate_tools(tools: &[Value]) -> ToolValidation {
    let mut errors = Vec::new();

    for (i, tool) in tools.iter().enumerate() {
        if !tool.is_object() {
            errors.push(format!("tools[{}] must be an object", i));
            continue;
        }

        if tool.get("type").and_then(Value::as_str) != Some("function") {
            errors.push(format!("tools[{}].type must be \"function\"", i));
        }

        let function = tool.get("function");
        match function.and_then(|f| f.get("name")) {
            Some(Value::String(name)) if !name.trim().is_empty() => {}
            Some(Value::String(_)) => {
                errors.push(format!("tools[{}].function.name must not be empty", i))
            }
            _ => errors.push(format!(
                "tools[{}].function.name must be a non-empty string",
                i
            )),
        }

        match function.and_then(|f| f.get("parameters")) {
            None | Some(Value::Null) => {}
            Some(params) => {
                if params.get("type").and_then(Value::as_str) != Some("object") {
                    errors.push(format!(
                        "tools[{}].function.parameters.type must be \"object\"",
                        i
                    ));
                }
            }
        }
    }

    ToolValidation {
        valid: errors.is_empty(),
        errors,
    }
}

/// Render the instruction block describing `tools` and the reply contract
pub fn build_system_prompt(tools: &[ToolDefinition], choice: &ToolChoice) -> String {
    let mut prompt = String::from(
        "You have access to the following functions. Use them when they help answer the user.\n",
    );

    for tool in tools {
        let _ = write!(prompt, "\nFunction: {}\n", tool.name);
        if let Some(description) = &tool.description {
            let _ = writeln!(prompt, "Description: {}", description);
        }
        if tool.parameters.is_empty() {
            prompt.push_str("Parameters: none\n");
        } else {
            prompt.push_str("Parameters:\n");
            for param in &tool.parameters {
                let requirement = if param.required { "required" } else { "optional" };
                let _ = write!(
                    prompt,
                    "  - {} ({}, {})",
                    param.name, param.param_type, requirement
                );
                if let Some(description) = &param.description {
                    let _ = write!(prompt, ": {}", description);
                }
                prompt.push('\n');
            }
        }
    }

    prompt.push_str(
        "\nTo call one or more functions, reply with ONLY a JSON object in exactly this format, with no other text:\n\
         {\"tool_calls\":[{\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"<function name>\",\"arguments\":\"<arguments as a JSON-encoded string>\"}}]}\n\
         The \"arguments\" value must be a string containing a JSON object with the function's parameters.\n\
         If no function is needed, answer normally in plain text.\n",
    );

    match choice {
        ToolChoice::Auto => {}
        ToolChoice::None => {
            prompt.push_str("\nDo NOT call any function in this reply. Answer in plain text.\n")
        }
        ToolChoice::Required => prompt
            .push_str("\nYou MUST call at least one of the functions above in this reply.\n"),
        ToolChoice::Function(name) => {
            let _ = write!(
                prompt,
                "\nYou MUST call the function \"{}\" in this reply.\n",
                name
            );
        }
    }

    prompt
}

/// Render calls the way the model was told to write them, for replaying
/// earlier assistant turns in the conversation history
pub fn render_tool_calls(calls: &[ToolCall]) -> String {
    let calls: Vec<Value> = calls.iter().map(|c| c.to_openai(None)).collect();
    serde_json::json!({ "tool_calls": calls }).to_string()
}

/// Which decoding tier produced the calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionTier {
    WholeReply,
    ToolCallsSpan,
    FunctionFragments,
}

/// Calls found in a reply and the tier that found them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub calls: Vec<ToolCall>,
    /// `None` if no tier matched
    pub tier: Option<ExtractionTier>,
}

/// Decode tool calls from a model reply; an empty list means plain text
pub fn extract_tool_calls(reply: &str) -> Vec<ToolCall> {
    extract_with_tier(reply).calls
}

/// Like [`extract_tool_calls`], also reporting the matching tier
pub fn extract_with_tier(reply: &str) -> Extraction {
    let stamp = now_millis();

    if let Some(calls) = parse_whole_reply(reply, stamp) {
        return Extraction {
            calls,
            tier: Some(ExtractionTier::WholeReply),
        };
    }
    if let Some(calls) = parse_tool_calls_span(reply, stamp) {
        return Extraction {
            calls,
            tier: Some(ExtractionTier::ToolCallsSpan),
        };
    }
    if let Some(calls) = parse_function_fragments(reply, stamp) {
        return Extraction {
            calls,
            tier: Some(ExtractionTier::FunctionFragments),
        };
    }
    Extraction::default()
}

fn parse_whole_reply(reply: &str, stamp: u64) -> Option<Vec<ToolCall>> {
    let trimmed = reply.trim();
    let candidate = CODE_FENCE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    let value: Value = serde_json::from_str(candidate).ok()?;
    let entries = value.get("tool_calls")?.as_array()?;
    non_empty(decode_entries(entries, stamp))
}

fn parse_tool_calls_span(reply: &str, stamp: u64) -> Option<Vec<ToolCall>> {
    for found in TOOL_CALLS_KEY.find_iter(reply) {
        // the match ends just past the opening bracket
        let start = found.end() - 1;
        let Some(end) = matching_bracket(reply, start) else {
            continue;
        };
        if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&reply[start..=end]) {
            if let Some(calls) = non_empty(decode_entries(&entries, stamp)) {
                return Some(calls);
            }
        }
    }
    None
}

fn parse_function_fragments(reply: &str, stamp: u64) -> Option<Vec<ToolCall>> {
    let mut calls = Vec::new();
    let mut pos = 0;

    while let Some(caps) = FUNCTION_FRAGMENT.captures_at(reply, pos) {
        let (Some(whole), Some(name), Some(raw)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            break;
        };
        pos = whole.end();

        let arguments = if raw.as_str().starts_with('"') {
            serde_json::from_str::<String>(raw.as_str()).ok()
        } else {
            // object arguments: the match stops at the opening brace
            matching_bracket(reply, raw.start()).and_then(|end| {
                pos = end + 1;
                serde_json::from_str::<Value>(&reply[raw.start()..=end])
                    .ok()
                    .map(|v| v.to_string())
            })
        };

        match arguments {
            Some(arguments) => calls.push(ToolCall {
                id: synthesize_id(stamp, calls.len()),
                name: name.as_str().to_string(),
                arguments,
            }),
            None => debug!(
                name = name.as_str(),
                "Skipping tool call fragment with unreadable arguments"
            ),
        }
    }

    non_empty(calls)
}

fn non_empty(calls: Vec<ToolCall>) -> Option<Vec<ToolCall>> {
    (!calls.is_empty()).then_some(calls)
}

fn decode_entries(entries: &[Value], stamp: u64) -> Vec<ToolCall> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| decode_entry(entry, index, stamp))
        .collect()
}

fn decode_entry(entry: &Value, index: usize, stamp: u64) -> Option<ToolCall> {
    // tolerate calls written without the `function` wrapper
    let function = entry.get("function").unwrap_or(entry);
    let name = function
        .get("name")?
        .as_str()
        .filter(|s| !s.is_empty())?
        .to_string();

    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };

    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| synthesize_id(stamp, index));

    Some(ToolCall {
        id,
        name,
        arguments,
    })
}

fn synthesize_id(stamp: u64, index: usize) -> String {
    format!("call_{}_{}", stamp, index)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Index of the bracket closing the one at `open`, skipping JSON strings
fn matching_bracket(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
