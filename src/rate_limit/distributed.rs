//! Redis-backed state store
//!
//! Shares the limiter record across hosts. Compare-and-swap runs as a Lua
//! script so the check and the write are atomic.

use super::store::StateStore;
use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::debug;

/// Redis store for the limiter record
pub struct RedisStore {
    connection: ConnectionManager,
    key: String,
    /// Records expire once stale anyway
    ttl_ms: u64,
    cas_script: Script,
}

impl RedisStore {
    /// Connect to `redis_url`
    pub async fn connect(redis_url: &str, key: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| ParleyError::Config(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| ParleyError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let cas_script = Script::new(
            r#"
            local current = redis.call('GET', KEYS[1])
            local has_expected = ARGV[1] == '1'

            if has_expected then
                if current ~= ARGV[2] then
                    return 0
                end
            elseif current then
                return 0
            end

            redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
            return 1
            "#,
        );

        let key = key.into();
        debug!(key = %key, "Rate limit store connected to Redis");

        Ok(Self {
            connection,
            key,
            ttl_ms: ttl.as_millis().max(1) as u64,
            cas_script,
        })
    }
}

fn redis_error(e: redis::RedisError) -> ParleyError {
    ParleyError::Store(format!("Redis error: {}", e))
}

#[async_trait]
impl StateStore for RedisStore {
    async fn load(&self) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get::<_, Option<String>>(&self.key)
            .await
            .map_err(redis_error)
    }

    async fn store(&self, value: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.pset_ex::<_, _, ()>(&self.key, value, self.ttl_ms)
            .await
            .map_err(redis_error)
    }

    async fn compare_and_swap(&self, expected: Option<&str>, value: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let swapped: i64 = self
            .cas_script
            .key(&self.key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(self.ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(swapped == 1)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
