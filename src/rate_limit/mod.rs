//! Outbound rate limiting shared across processes
//!
//! Every process talking to the upstream consults the same record: a sliding
//! window of call timestamps, the time of the last call, and any pause the
//! upstream imposed with a 429. The record lives behind a [`StateStore`]:
//!
//! - `file`: a JSON file in the temp dir, shared by processes on one host
//! - `memory`: this process only
//! - `redis`: shared across hosts (`distributed-rate-limit` feature)
//!
//! Updates are read-compute-write with compare-and-swap. Exact for the memory
//! and Redis stores, best effort for the file store.

mod state;
mod store;

#[cfg(feature = "distributed-rate-limit")]
mod distributed;

#[cfg(feature = "distributed-rate-limit")]
pub use distributed::RedisStore;
pub use state::{
    current_time_millis, RateLimitPolicy, RateLimitState, CLOCK_SKEW_TOLERANCE_MS,
};
pub use store::{FileStore, MemoryStore, StateStore};

use crate::config::{RateLimitBackend, RateLimitConfig};
use crate::error::{ParleyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at a compare-and-swap before overwriting
const MAX_CAS_ATTEMPTS: u32 = 5;

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Admission control for upstream calls
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    policy: RateLimitPolicy,
    owner_id: String,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, policy: RateLimitPolicy) -> Self {
        let owner_id = format!("{}-{:08x}", std::process::id(), rand::random::<u32>());
        Self {
            store,
            policy,
            owner_id,
            clock: Arc::new(current_time_millis),
        }
    }

    /// Build with the configured backend
    pub async fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = match config.backend {
            RateLimitBackend::Memory => Arc::new(MemoryStore::new()),
            RateLimitBackend::File => Arc::new(FileStore::new(config.state_file())),
            RateLimitBackend::Redis => redis_store(config).await?,
        };
        info!(
            backend = store.name(),
            max_requests = config.max_requests,
            window_ms = config.window.as_millis() as u64,
            "Rate limiter initialized"
        );
        Ok(Self::new(store, RateLimitPolicy::from(config)))
    }

    /// Replace the millisecond clock
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Identifies this process in the shared record
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// How long to wait before the next upstream call. Never fails: an
    /// unreadable store counts as no state.
    pub async fn admit(&self) -> Duration {
        let now = self.now();
        let raw = match self.store.load().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, store = self.store.name(), "Rate limit state unavailable");
                None
            }
        };
        let wait = RateLimitState::decode(raw.as_deref(), now, &self.policy)
            .map(|state| state.wait_ms(now, &self.policy))
            .unwrap_or(0);
        Duration::from_millis(wait)
    }

    /// Count an upstream call made now
    pub async fn record_attempt(&self) -> Result<()> {
        self.transact(|state, now| {
            state.record(now);
            ((), true)
        })
        .await
    }

    /// Honor an upstream 429 for `retry_after`
    pub async fn mark_limited(&self, retry_after: Duration) -> Result<()> {
        let retry_after_ms = retry_after.as_millis() as u64;
        warn!(retry_after_ms, "Upstream imposed a pause");
        self.transact(|state, now| {
            state.mark_limited(now, retry_after_ms);
            ((), true)
        })
        .await
    }

    /// Wait until a call is admitted, then record it. Returns the time spent
    /// waiting.
    ///
    /// The admission check and the recording happen in one compare-and-swap,
    /// so two processes cannot both claim the last slot of a window.
    pub async fn acquire(&self) -> Result<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            let policy = self.policy;
            let wait_ms = self
                .transact(|state, now| {
                    let wait = state.wait_ms(now, &policy);
                    if wait > 0 {
                        (wait, false)
                    } else {
                        state.record(now);
                        (0, true)
                    }
                })
                .await?;

            if wait_ms == 0 {
                return Ok(waited);
            }
            let wait = Duration::from_millis(wait_ms);
            debug!(wait_ms, "Rate limiter delaying upstream call");
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Current record, if any
    pub async fn snapshot(&self) -> Option<RateLimitState> {
        let raw = self.store.load().await.ok()?;
        RateLimitState::decode(raw.as_deref(), self.now(), &self.policy)
    }

    /// Read-compute-write with compare-and-swap. `apply` returns its output and
    /// whether the modified state should be written.
    async fn transact<T, F>(&self, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut RateLimitState, u64) -> (T, bool) + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.now();
            let raw = self.store.load().await?;
            let mut state =
                RateLimitState::decode(raw.as_deref(), now, &self.policy).unwrap_or_default();

            let (output, write) = apply(&mut state, now);
            if !write {
                return Ok(output);
            }
            state.stamp(&self.owner_id, now);
            let serialized = serde_json::to_string(&state)?;

            if attempt >= MAX_CAS_ATTEMPTS {
                warn!(
                    store = self.store.name(),
                    attempts = attempt,
                    "Rate limit state contended, overwriting"
                );
                self.store.store(&serialized).await?;
                return Ok(output);
            }

            if self
                .store
                .compare_and_swap(raw.as_deref(), &serialized)
                .await?
            {
                return Ok(output);
            }
            debug!(attempt, "Rate limit state changed concurrently, retrying");
        }
    }
}

#[cfg(feature = "distributed-rate-limit")]
async fn redis_store(config: &RateLimitConfig) -> Result<Arc<dyn StateStore>> {
    let url = config.redis_url.as_deref().ok_or_else(|| {
        ParleyError::Config("rate_limit.redis_url is required for the redis backend".to_string())
    })?;
    let store = RedisStore::connect(url, config.redis_key.clone(), config.stale_after).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "distributed-rate-limit"))]
async fn redis_store(_config: &RateLimitConfig) -> Result<Arc<dyn StateStore>> {
    Err(ParleyError::Config(
        "The redis rate limit backend requires the 'distributed-rate-limit' feature".to_string(),
    ))
}
