//! Parley - OpenAI-compatible gateway for a session-based chat upstream
//!
//! Parley accepts OpenAI-style chat completion requests and forwards them to an
//! upstream chat service that requires a short-lived session handshake per call
//! and answers as a server-sent event stream. It provides:
//!
//! - **Session negotiation**: status call, challenge decoding and solving
//! - **Streaming translation**: upstream SSE fragments to OpenAI chunks
//! - **Shared rate limiting**: a sliding window coordinated across processes
//! - **Tool calling**: function definitions rendered into a system prompt and
//!   tool calls recovered from free-form replies
//! - **Observability**: Prometheus metrics and structured access logging
//!
//! # Quick Start
//!
//! ```no_run
//! use parley::Server;
//!
//! #[tokio::main]
//! async fn main() -> parley::Result<()> {
//!     let config = parley::config::load_config("parley.yaml")?;
//!     let server = Server::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Configuration
//!
//! Every section is optional:
//!
//! ```yaml
//! server:
//!   listen: "127.0.0.1:8080"
//!
//! rate_limit:
//!   max_requests: 20
//!   window: 60s
//!   min_interval: 1s
//!   backend: file
//!
//! models:
//!   default_model: gpt-4o-mini
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod rate_limit;
pub mod request_id;
pub mod server;
pub mod session;
pub mod upstream;

pub use config::Config;
pub use error::{ParleyError, Result};
pub use gateway::GatewayService;
pub use server::Server;

/// Parley version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parley name
pub const NAME: &str = env!("CARGO_PKG_NAME");
