// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Wrong value type at '{key}': expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
    },
}

/// Outcome of one token-bucket step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenGrant {
    /// Whether a token was consumed
    pub allowed: bool,
    /// Tokens left in the bucket after this step
    pub remaining: f64,
}

/// Best-effort size report from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Approximate number of live keys (DBSIZE)
    pub key_count: Option<u64>,
    /// Memory used by the backend in bytes (INFO memory)
    pub memory_used_bytes: Option<u64>,
}

/// Operations the cache cluster must expose.
///
/// Implemented by [`super::redis::RedisStore`] for Redis/Valkey and by
/// [`super::memory::InMemoryStore`] as a fake with the same semantics.
/// Every TTL is physical: the key disappears once it elapses.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError>;
    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StorageError>;

    /// Append to the tail of a list, returning the new length.
    async fn push(&self, list: &str, value: &[u8]) -> Result<u64, StorageError>;
    /// Pop from the head of a list.
    async fn pop(&self, list: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn list_len(&self, list: &str) -> Result<u64, StorageError>;

    /// Atomic SET NX with expiry. Returns true if this call created the key.
    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError>;
    /// Atomic compare-and-delete. Returns true if the key held `expected` and was removed.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError>;

    /// Add a member to a set, refreshing the set's TTL when given.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), StorageError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Refill-then-take on the bucket stored at `key`, atomically.
    async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        window: Duration,
        now_ms: u64,
    ) -> Result<TokenGrant, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
    async fn stats(&self) -> Result<StoreStats, StorageError>;

    /// Fetch many keys in one round trip. Default falls back to sequential gets.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write many keys with TTLs. Default falls back to sequential sets.
    async fn set_many(&self, entries: &[(String, Vec<u8>, Duration)]) -> Result<(), StorageError> {
        for (key, value, ttl) in entries {
            self.set(key, value, Some(*ttl)).await?;
        }
        Ok(())
    }

    /// Delete many keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StorageError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
