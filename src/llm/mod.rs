//! OpenAI-compatible surface for the gateway
//!
//! Wire types for chat completions, the model catalog, token estimation,
//! emulated tool calling, and translation of upstream fragments into
//! streamed completion chunks.

mod models;
mod streaming;
mod tokenizer;
pub mod tools;
mod types;

pub use models::*;
pub use streaming::*;
pub use tokenizer::*;
pub use tools::{
    build_system_prompt, extract_tool_calls, render_tool_calls, validate_tools, ToolChoice,
    ToolDefinition, ToolValidation,
};
pub use types::*;

/// Reply used whenever the upstream produces no text at all
pub const FALLBACK_REPLY: &str =
    "I'm sorry, I couldn't generate a response right now. Please try again.";
