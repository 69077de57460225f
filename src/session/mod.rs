//! Upstream session negotiation
//!
//! Every chat call needs a fresh credential: a token and a solved challenge,
//! both issued by the status endpoint. Credentials are never cached.

mod challenge;

pub use challenge::Challenge;

use crate::config::UpstreamConfig;
use crate::error::AuthError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Session token response header
pub const TOKEN_HEADER: &str = "x-vqd-4";
/// Challenge response header, echoed back solved on the chat call
pub const CHALLENGE_HEADER: &str = "x-vqd-hash-1";
/// Request header asking the status endpoint to issue a token
pub const ACCEPT_TOKEN_HEADER: &str = "x-vqd-accept";

/// Credential for exactly one upstream chat call
#[derive(Debug, Clone)]
pub struct SessionCredential {
    pub token: String,
    pub challenge: Challenge,
    /// Solved challenge for the `x-vqd-hash-1` request header
    pub hash_header: String,
    /// User agent used for the handshake, reused for the chat call
    pub user_agent: String,
}

/// Performs the status handshake
pub struct SessionNegotiator {
    client: reqwest::Client,
    status_url: String,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
    timeout: Duration,
}

impl SessionNegotiator {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            status_url: config.status_url.clone(),
            user_agents: config.user_agents.clone(),
            next_agent: AtomicUsize::new(rand::random::<u8>() as usize),
            timeout: config.request_timeout,
        }
    }

    /// Obtain a fresh credential. No retries are made here.
    pub async fn negotiate(&self) -> Result<SessionCredential, AuthError> {
        let user_agent = self.next_user_agent();
        debug!(url = %self.status_url, "Negotiating upstream session");

        let response = self
            .client
            .get(&self.status_url)
            .header(http::header::USER_AGENT, &user_agent)
            .header(http::header::CACHE_CONTROL, "no-store")
            .header(ACCEPT_TOKEN_HEADER, "1")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Status endpoint rejected handshake");
            return Err(AuthError::UpstreamStatus(status.as_u16()));
        }

        let headers = response.headers();
        let token = header_value(headers, TOKEN_HEADER)?;
        let raw_challenge = header_value(headers, CHALLENGE_HEADER)?;

        let challenge = Challenge::decode(&raw_challenge)?;
        let hash_header = challenge.solve();

        debug!(
            server_hashes = challenge.server_hashes.len(),
            client_hashes = challenge.client_hashes.len(),
            "Session negotiated"
        );

        Ok(SessionCredential {
            token,
            challenge,
            hash_header,
            user_agent,
        })
    }

    fn next_user_agent(&self) -> String {
        if self.user_agents.is_empty() {
            return String::new();
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        self.user_agents[index].clone()
    }
}

fn header_value(headers: &http::HeaderMap, name: &'static str) -> Result<String, AuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or(AuthError::MissingHeader(name))
}
