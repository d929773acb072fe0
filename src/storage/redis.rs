// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis / Valkey backend for the cache cluster.
//!
//! Values are opaque byte strings; framing lives in [`crate::cache_entry`].
//! Writes and every coordination primitive (locks, lists, counters, token
//! buckets) go to the writer endpoint. Plain entry reads go to the reader
//! endpoint when one is configured, so replica lag can only ever make a read
//! look like a miss, never break mutual exclusion.
//!
//! Two operations must be atomic server-side and run as Lua scripts:
//! - compare-and-delete for lock release
//! - refill-then-take for the rate limiter's token bucket
//!
//! No per-command retry happens here: every call is already routed through
//! the circuit breaker, which needs to see each failure.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, Script};

use super::traits::{CacheStore, StorageError, StoreStats, TokenGrant};
use crate::resilience::retry::{retry, RetryConfig};

const RELEASE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const TAKE_TOKEN_SCRIPT: &str = r"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
    tokens = capacity
    last = now
end

if now > last then
    tokens = math.min(capacity, tokens + (now - last) / window_ms * capacity)
    last = now
end

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(last))
redis.call('PEXPIRE', key, window_ms * 2)
return {allowed, tostring(tokens)}
";

pub struct RedisStore {
    writer: ConnectionManager,
    /// Separate replica endpoint for entry reads, if configured
    reader: Option<ConnectionManager>,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:v1:user:1")
    prefix: String,
    release_script: Script,
    token_script: Script,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::connect(connection_string, None, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// The prefix is prepended to all keys, enabling namespacing when
    /// sharing a Redis instance with other applications.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use cache_engine::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "myapp:v1:user:1", "myapp:wb:queue"
    /// let store = RedisStore::with_prefix("redis://localhost", Some("myapp:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        Self::connect(connection_string, None, prefix).await
    }

    /// Connect to a writer and, optionally, a separate reader endpoint.
    pub async fn connect(
        writer_url: &str,
        reader_url: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Self, StorageError> {
        let writer = Self::open("redis_connect_writer", writer_url).await?;
        let reader = match reader_url {
            Some(url) if url != writer_url => Some(Self::open("redis_connect_reader", url).await?),
            _ => None,
        };

        Ok(Self {
            writer,
            reader,
            prefix: prefix.unwrap_or("").to_string(),
            release_script: Script::new(RELEASE_IF_EQUALS_SCRIPT),
            token_script: Script::new(TAKE_TOKEN_SCRIPT),
        })
    }

    async fn open(operation: &str, url: &str) -> Result<ConnectionManager, StorageError> {
        let client = Client::open(url).map_err(backend)?;

        // Use startup config: fast-fail on bad config, don't hang forever
        retry(operation, &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)
    }

    /// Apply the prefix to a key.
    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }

    fn read_connection(&self) -> ConnectionManager {
        self.reader.clone().unwrap_or_else(|| self.writer.clone())
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether reads are routed to a separate endpoint
    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// PSETEX/PX reject zero; round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Pull `used_memory:<n>` out of an `INFO memory` reply.
fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("used_memory:"))
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.read_connection();
        let value: Option<Vec<u8>> = conn.get(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.writer.clone();
        let key = self.prefixed_key(key);
        let mut command = cmd("SET");
        command.arg(&key).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = command.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.writer.clone();
        let removed: u64 = conn.del(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StorageError> {
        let mut conn = self.writer.clone();
        let value: i64 = conn.incr(self.prefixed_key(key), delta).await.map_err(backend)?;
        Ok(value)
    }

    async fn push(&self, list: &str, value: &[u8]) -> Result<u64, StorageError> {
        let mut conn = self.writer.clone();
        let len: u64 = conn.rpush(self.prefixed_key(list), value).await.map_err(backend)?;
        Ok(len)
    }

    async fn pop(&self, list: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.writer.clone();
        let value: Option<Vec<u8>> = cmd("LPOP")
            .arg(self.prefixed_key(list))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn list_len(&self, list: &str) -> Result<u64, StorageError> {
        let mut conn = self.writer.clone();
        let len: u64 = conn.llen(self.prefixed_key(list)).await.map_err(backend)?;
        Ok(len)
    }

    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.writer.clone();
        // SET key value NX PX ttl → "OK" or nil
        let reply: Option<String> = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        let mut conn = self.writer.clone();
        let removed: i64 = self
            .release_script
            .key(self.prefixed_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.writer.clone();
        let key = self.prefixed_key(key);
        let mut pipeline = pipe();
        pipeline.atomic().cmd("SADD").arg(&key).arg(member).ignore();
        if let Some(ttl) = ttl {
            pipeline.cmd("PEXPIRE").arg(&key).arg(ttl_millis(ttl)).ignore();
        }
        let _: () = pipeline.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.writer.clone();
        let members: Vec<String> = conn.smembers(self.prefixed_key(key)).await.map_err(backend)?;
        Ok(members)
    }

    async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        window: Duration,
        now_ms: u64,
    ) -> Result<TokenGrant, StorageError> {
        let mut conn = self.writer.clone();
        let (allowed, remaining): (i64, String) = self
            .token_script
            .key(self.prefixed_key(key))
            .arg(capacity)
            .arg(ttl_millis(window))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        let remaining = remaining
            .parse::<f64>()
            .map_err(|e| StorageError::Backend(format!("Invalid token count '{}': {}", remaining, e)))?;
        Ok(TokenGrant {
            allowed: allowed == 1,
            remaining,
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.writer.clone();
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let mut conn = self.writer.clone();
        let key_count: u64 = cmd("DBSIZE").query_async(&mut conn).await.map_err(backend)?;
        let info: String = cmd("INFO").arg("memory").query_async(&mut conn).await.map_err(backend)?;
        Ok(StoreStats {
            key_count: Some(key_count),
            memory_used_bytes: parse_used_memory(&info),
        })
    }

    /// One MGET round trip.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.read_connection();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        let values: Vec<Option<Vec<u8>>> = cmd("MGET")
            .arg(&prefixed)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(values)
    }

    /// Pipelined PSETEX, one round trip.
    async fn set_many(&self, entries: &[(String, Vec<u8>, Duration)]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.writer.clone();
        let mut pipeline = pipe();
        for (key, value, ttl) in entries {
            pipeline
                .cmd("PSETEX")
                .arg(self.prefixed_key(key))
                .arg(ttl_millis(*ttl))
                .arg(value.as_slice())
                .ignore();
        }
        let _: () = pipeline.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.writer.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        let removed: u64 = cmd("DEL")
            .arg(&prefixed)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_key() {
        assert_eq!(prefixed("", "v1:user:1"), "v1:user:1");
        assert_eq!(prefixed("app:", "v1:user:1"), "app:v1:user:1");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5_000);
    }

    #[test]
    fn test_parse_used_memory() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        assert_eq!(parse_used_memory(info), Some(1_048_576));
        assert_eq!(parse_used_memory("# Memory\r\n"), None);
    }
}
