//! Shared rate limit record and the admission arithmetic over it

use crate::config::RateLimitConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Current Unix time in milliseconds
pub fn current_time_millis() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// How far ahead of the local clock a peer's timestamps may run before the
/// record is treated as unusable
pub const CLOCK_SKEW_TOLERANCE_MS: u64 = 5_000;

/// Limits applied to upstream calls, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_ms: u64,
    pub min_interval_ms: u64,
    pub stale_after_ms: u64,
    pub safety_margin_ms: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window_ms: config.window.as_millis() as u64,
            min_interval_ms: config.min_interval.as_millis() as u64,
            stale_after_ms: config.stale_after.as_millis() as u64,
            safety_margin_ms: config.safety_margin.as_millis() as u64,
        }
    }
}

/// Persisted limiter state, shared by every process using the same store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    /// Call timestamps inside the trailing window
    pub window_events: Vec<u64>,
    #[serde(default)]
    pub last_request_time: u64,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub updated_at: u64,
}

impl RateLimitState {
    /// Decode a stored record.
    ///
    /// Returns `None` for anything that should count as "no state": nothing
    /// stored, a stale record, a legacy fixed-window record, or garbage.
    pub fn decode(raw: Option<&str>, now: u64, policy: &RateLimitPolicy) -> Option<Self> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable rate limit state");
                return None;
            }
        };

        if value.get("windowEvents").is_none()
            && (value.get("count").is_some() || value.get("windowStart").is_some())
        {
            debug!("Discarding legacy fixed-window rate limit state");
            return None;
        }

        let mut state: Self = match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Discarding malformed rate limit state");
                return None;
            }
        };

        if now.saturating_sub(state.updated_at) > policy.stale_after_ms {
            debug!(updated_at = state.updated_at, "Rate limit state is stale");
            return None;
        }
        if state.updated_at > now.saturating_add(CLOCK_SKEW_TOLERANCE_MS) {
            warn!(
                updated_at = state.updated_at,
                now, "Discarding rate limit state written in the future"
            );
            return None;
        }

        state.prune(now, policy.window_ms);
        Some(state)
    }

    /// Drop events that have left the window.
    ///
    /// Timestamps slightly ahead of `now` are pulled back to `now`; anything
    /// further out than the skew tolerance is dropped.
    pub fn prune(&mut self, now: u64, window_ms: u64) {
        let horizon = now.saturating_add(CLOCK_SKEW_TOLERANCE_MS);
        self.window_events
            .retain(|&t| t <= horizon && now.saturating_sub(t) < window_ms);
        for t in &mut self.window_events {
            *t = (*t).min(now);
        }
        self.last_request_time = self.last_request_time.min(now);
    }

    /// End of the current upstream-imposed pause, if one is active
    pub fn limited_until(&self) -> Option<u64> {
        if !self.limited {
            return None;
        }
        self.retry_after_ms
            .map(|retry| self.last_request_time.saturating_add(retry))
    }

    /// Milliseconds to wait before the next call; expects a pruned state
    pub fn wait_ms(&self, now: u64, policy: &RateLimitPolicy) -> u64 {
        if self.window_events.len() >= policy.max_requests as usize {
            let oldest = self.window_events.iter().min().copied().unwrap_or(now);
            return oldest
                .saturating_add(policy.window_ms)
                .saturating_sub(now)
                .saturating_add(policy.safety_margin_ms);
        }

        if self.last_request_time > 0 {
            let elapsed = now.saturating_sub(self.last_request_time);
            if elapsed < policy.min_interval_ms {
                return policy.min_interval_ms - elapsed;
            }
        }

        // a record stops counting once stale, so no pause outlives that
        match self.limited_until() {
            Some(until) if until > now => (until - now).min(policy.stale_after_ms),
            _ => 0,
        }
    }

    /// Count a call made at `now`
    pub fn record(&mut self, now: u64) {
        self.window_events.push(now);
        self.last_request_time = now;
        if self.limited_until().is_some_and(|until| until <= now) {
            self.limited = false;
            self.retry_after_ms = None;
        }
    }

    /// Pause calls for `retry_after_ms` starting at `now`
    pub fn mark_limited(&mut self, now: u64, retry_after_ms: u64) {
        self.limited = true;
        self.retry_after_ms = Some(retry_after_ms);
        self.last_request_time = self.last_request_time.max(now);
    }

    pub(crate) fn stamp(&mut self, owner_id: &str, now: u64) {
        self.owner_id = owner_id.to_string();
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::default()
    }

    #[test]
    fn test_policy_defaults() {
        let policy = policy();
        assert_eq!(policy.max_requests, 20);
        assert_eq!(policy.window_ms, 60_000);
        assert_eq!(policy.min_interval_ms, 1_000);
        assert_eq!(policy.stale_after_ms, 300_000);
        assert_eq!(policy.safety_margin_ms, 100);
    }

    #[test]
    fn test_camel_case_round_trip() {
        let state = RateLimitState {
            window_events: vec![1, 2],
            last_request_time: 2,
            limited: true,
            retry_after_ms: Some(500),
            owner_id: "1-a".to_string(),
            updated_at: 3,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"windowEvents\":[1,2]"));
        assert!(json.contains("\"lastRequestTime\":2"));
        assert!(json.contains("\"retryAfterMs\":500"));
        assert!(json.contains("\"ownerId\":\"1-a\""));
        assert!(json.contains("\"updatedAt\":3"));
    }

    #[test]
    fn test_decode_discards_legacy_and_stale() {
        let now = 1_000_000;
        let legacy = r#"{"count": 5, "windowStart": 999000}"#;
        assert!(RateLimitState::decode(Some(legacy), now, &policy()).is_none());

        let stale = format!(
            r#"{{"windowEvents":[{}],"lastRequestTime":0,"limited":false,"ownerId":"x","updatedAt":{}}}"#,
            now - 10,
            now - 400_000
        );
        assert!(RateLimitState::decode(Some(&stale), now, &policy()).is_none());

        assert!(RateLimitState::decode(Some("{broken"), now, &policy()).is_none());
        assert!(RateLimitState::decode(None, now, &policy()).is_none());
    }

    #[test]
    fn test_decode_prunes() {
        let now = 1_000_000;
        let raw = format!(
            r#"{{"windowEvents":[{},{},{}],"updatedAt":{}}}"#,
            now - 60_000,
            now - 59_999,
            now,
            now
        );
        let state = RateLimitState::decode(Some(&raw), now, &policy()).unwrap();
        assert_eq!(state.window_events, vec![now - 59_999, now]);
    }

    #[test]
    fn test_full_window_waits_for_oldest() {
        let now = 1_000_000;
        let mut state = RateLimitState::default();
        for i in 0..20 {
            state.window_events.push(now - 30_000 + i * 100);
        }
        state.last_request_time = now - 28_100;
        // oldest leaves at now + 30_000
        assert_eq!(state.wait_ms(now, &policy()), 30_000 + 100);
    }

    #[test]
    fn test_spacing() {
        let now = 1_000_000;
        let mut state = RateLimitState::default();
        state.record(now - 400);
        assert_eq!(state.wait_ms(now, &policy()), 600);
        assert_eq!(state.wait_ms(now + 600, &policy()), 0);
    }

    #[test]
    fn test_limited_state_is_honored_then_cleared() {
        let now = 1_000_000;
        let mut state = RateLimitState::default();
        state.record(now);
        state.mark_limited(now, 5_000);
        assert_eq!(state.wait_ms(now + 2_000, &policy()), 3_000);
        assert_eq!(state.wait_ms(now + 5_000, &policy()), 0);

        state.record(now + 5_000);
        assert!(!state.limited);
        assert_eq!(state.retry_after_ms, None);
    }

    #[test]
    fn test_future_events_do_not_block() {
        let now = 1_000_000;
        let ahead: Vec<String> = (0..20).map(|i| (now + 3_600_000 + i).to_string()).collect();
        let raw = format!(
            r#"{{"windowEvents":[{}],"lastRequestTime":{},"updatedAt":{}}}"#,
            ahead.join(","),
            now + 3_600_019,
            now
        );
        let state = RateLimitState::decode(Some(&raw), now, &policy()).unwrap();
        assert!(state.window_events.is_empty());
        assert_eq!(state.last_request_time, now);
        assert!(state.wait_ms(now, &policy()) <= policy().min_interval_ms);

        // small skew is kept but aged from now
        let mut state = RateLimitState {
            window_events: vec![now - 10, now + 2_000],
            ..Default::default()
        };
        state.prune(now, policy().window_ms);
        assert_eq!(state.window_events, vec![now - 10, now]);
    }

    #[test]
    fn test_future_updated_at_is_discarded() {
        let now = 1_000_000;
        let raw = format!(
            r#"{{"windowEvents":[{}],"updatedAt":{}}}"#,
            now,
            now + 3_600_000
        );
        assert!(RateLimitState::decode(Some(&raw), now, &policy()).is_none());
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let now = 1_000_000;
        let max: Vec<String> = (0..20).map(|_| u64::MAX.to_string()).collect();
        let raw = format!(
            r#"{{"windowEvents":[{}],"updatedAt":{}}}"#,
            max.join(","),
            now
        );
        let state = RateLimitState::decode(Some(&raw), now, &policy()).unwrap();
        assert_eq!(state.wait_ms(now, &policy()), 0);

        // unpruned state still saturates instead of wrapping
        let state = RateLimitState {
            window_events: vec![u64::MAX; 20],
            last_request_time: now - 5_000,
            ..Default::default()
        };
        assert_eq!(state.wait_ms(now, &policy()), u64::MAX);

        let mut limited = RateLimitState::default();
        limited.mark_limited(now, u64::MAX);
        assert_eq!(limited.wait_ms(now + 2_000, &policy()), policy().stale_after_ms);
    }

    #[test]
    fn test_fresh_state_admits_immediately() {
        assert_eq!(RateLimitState::default().wait_ms(1_000_000, &policy()), 0);
    }
}
