// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache cluster with Redis semantics.
//!
//! Keys carry a physical TTL checked lazily on access, using
//! `tokio::time::Instant` so tests can drive expiry with a paused clock.
//! Each key holds one value type (bytes, list, set or token bucket); using
//! a key as the wrong type fails the same way Redis' WRONGTYPE does.
//!
//! [`InMemoryStore::set_unavailable`] makes every call fail like a lost
//! connection, for outage tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::traits::{CacheStore, StorageError, StoreStats, TokenGrant};
use crate::rate_limiter::RateLimitBucket;

enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<String>),
    Bucket(RateLimitBucket),
}

impl Value {
    fn approx_bytes(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::List(l) => l.iter().map(Vec::len).sum(),
            Value::Set(s) => s.iter().map(String::len).sum(),
            Value::Bucket(_) => std::mem::size_of::<RateLimitBucket>(),
        }
    }
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StorageError {
    StorageError::WrongType {
        key: key.to_string(),
        expected,
    }
}

pub struct InMemoryStore {
    data: DashMap<String, Slot>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("connection refused (simulated outage)".into()));
        }
        Ok(())
    }

    /// Live key count (expired keys excluded)
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all keys
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Remaining physical TTL of a key, `None` if absent or persistent.
    #[must_use]
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.purge_expired(key);
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Bytes(b) => Ok(Some(b.clone())),
                _ => Err(wrong_type(key, "string")),
            },
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        self.check_available()?;
        self.data
            .insert(key.to_string(), Slot::new(Value::Bytes(value.to_vec()), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        Ok(self.data.remove(key).is_some())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Bytes(b"0".to_vec()), None));
        let Value::Bytes(raw) = &mut slot.value else {
            return Err(wrong_type(key, "integer"));
        };
        let current: i64 = std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| wrong_type(key, "integer"))?;
        let next = current.saturating_add(delta);
        *raw = next.to_string().into_bytes();
        Ok(next)
    }

    async fn push(&self, list: &str, value: &[u8]) -> Result<u64, StorageError> {
        self.check_available()?;
        self.purge_expired(list);
        let mut slot = self
            .data
            .entry(list.to_string())
            .or_insert_with(|| Slot::new(Value::List(VecDeque::new()), None));
        let Value::List(items) = &mut slot.value else {
            return Err(wrong_type(list, "list"));
        };
        items.push_back(value.to_vec());
        Ok(items.len() as u64)
    }

    async fn pop(&self, list: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_available()?;
        self.purge_expired(list);
        let popped = match self.data.get_mut(list) {
            None => return Ok(None),
            Some(mut slot) => match &mut slot.value {
                Value::List(items) => items.pop_front(),
                _ => return Err(wrong_type(list, "list")),
            },
        };
        // Empty lists disappear, as in Redis
        self.data
            .remove_if(list, |_, slot| matches!(&slot.value, Value::List(items) if items.is_empty()));
        Ok(popped)
    }

    async fn list_len(&self, list: &str) -> Result<u64, StorageError> {
        self.check_available()?;
        self.purge_expired(list);
        match self.data.get(list) {
            None => Ok(0),
            Some(slot) => match &slot.value {
                Value::List(items) => Ok(items.len() as u64),
                _ => Err(wrong_type(list, "list")),
            },
        }
    }

    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(Value::Bytes(value.to_vec()), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        let removed = self
            .data
            .remove_if(key, |_, slot| matches!(&slot.value, Value::Bytes(b) if b == expected));
        Ok(removed.is_some())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Set(HashSet::new()), None));
        let Value::Set(members) = &mut slot.value else {
            return Err(wrong_type(key, "set"));
        };
        members.insert(member.to_string());
        if let Some(ttl) = ttl {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(Vec::new()),
            Some(slot) => match &slot.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(wrong_type(key, "set")),
            },
        }
    }

    async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        window: Duration,
        now_ms: u64,
    ) -> Result<TokenGrant, StorageError> {
        self.check_available()?;
        self.purge_expired(key);
        let mut slot = self.data.entry(key.to_string()).or_insert_with(|| {
            Slot::new(Value::Bucket(RateLimitBucket::full(key, capacity, now_ms)), None)
        });
        let Value::Bucket(bucket) = &mut slot.value else {
            return Err(wrong_type(key, "hash"));
        };
        bucket.refill(capacity, window, now_ms);
        let allowed = bucket.try_take();
        let remaining = bucket.tokens;
        slot.expires_at = Some(Instant::now() + window * 2);
        Ok(TokenGrant { allowed, remaining })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_available()?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.check_available()?;
        let now = Instant::now();
        let (count, bytes) = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .fold((0u64, 0u64), |(c, b), e| {
                (c + 1, b + (e.key().len() + e.value().value.approx_bytes()) as u64)
            });
        Ok(StoreStats {
            key_count: Some(count),
            memory_used_bytes: Some(bytes),
        })
    }
}
