// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timeout-bound, circuit-protected client for the cache cluster.
//!
//! Every call is wrapped in `tokio::time::timeout` and routed through the
//! engine's [`CircuitBreaker`], so a timeout counts as a failure and an
//! open circuit rejects without touching the network. Backend errors leave
//! this module as [`CacheError::Unavailable`].
//!
//! Entries are framed and unframed here: [`CacheConnection::read_entry`]
//! turns an undecodable value into a miss.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache_entry::CacheEntry;
use crate::error::CacheError;
use crate::metrics;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::storage::traits::{CacheStore, StorageError, StoreStats, TokenGrant};

#[derive(Clone)]
pub struct CacheConnection {
    store: Arc<dyn CacheStore>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl CacheConnection {
    pub fn new(store: Arc<dyn CacheStore>, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self {
            store,
            breaker,
            timeout,
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let _timer = crate::time_operation!(operation);
        let timeout = self.timeout;
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, f()).await {
                    Ok(result) => result,
                    Err(_) => {
                        metrics::record_timeout(operation);
                        Err(StorageError::Timeout(timeout))
                    }
                }
            })
            .await;

        match &result {
            Ok(_) => metrics::record_operation(operation, "success"),
            Err(CircuitError::Rejected) => metrics::record_operation(operation, "rejected"),
            Err(CircuitError::Inner(e)) => {
                debug!(operation, error = %e, "Cache call failed");
                metrics::record_operation(operation, "error");
            }
        }
        result.map_err(CacheError::from)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.call("get", || self.store.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.call("set", || self.store.set(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.call("delete", || self.store.delete(key)).await
    }

    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.call("increment", || self.store.increment(key, delta)).await
    }

    pub async fn push(&self, list: &str, value: &[u8]) -> Result<u64, CacheError> {
        self.call("push", || self.store.push(list, value)).await
    }

    pub async fn pop(&self, list: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.call("pop", || self.store.pop(list)).await
    }

    pub async fn list_len(&self, list: &str) -> Result<u64, CacheError> {
        self.call("list_len", || self.store.list_len(list)).await
    }

    pub async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError> {
        self.call("set_nx", || self.store.set_if_not_exists(key, value, ttl)).await
    }

    pub async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        self.call("delete_if_equals", || self.store.delete_if_equals(key, expected)).await
    }

    pub async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.call("set_add", || self.store.set_add(key, member, ttl)).await
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.call("set_members", || self.store.set_members(key)).await
    }

    pub async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        window: Duration,
        now_ms: u64,
    ) -> Result<TokenGrant, CacheError> {
        self.call("take_token", || self.store.take_token(key, capacity, window, now_ms))
            .await
    }

    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.call("get_many", || self.store.get_many(keys)).await
    }

    pub async fn set_many(&self, entries: &[(String, Vec<u8>, Duration)]) -> Result<(), CacheError> {
        self.call("set_many", || self.store.set_many(entries)).await
    }

    pub async fn delete_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.call("delete_many", || self.store.delete_many(keys)).await
    }

    pub async fn stats(&self) -> Result<StoreStats, CacheError> {
        self.call("stats", || self.store.stats()).await
    }

    /// Read and unframe an entry. Undecodable values are reported as misses.
    pub async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.get(key).await?.and_then(|raw| decode_or_miss(key, &raw)))
    }

    /// Frame and write an entry with its physical TTL.
    pub async fn write_entry(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let encoded = entry.encode()?;
        self.set(key, &encoded, Some(entry.physical_ttl())).await
    }

    /// One round trip for many entries; positions line up with `keys`.
    pub async fn read_entries(&self, keys: &[String]) -> Result<Vec<Option<CacheEntry>>, CacheError> {
        let raw = self.get_many(keys).await?;
        Ok(keys
            .iter()
            .zip(raw)
            .map(|(key, value)| value.and_then(|raw| decode_or_miss(key, &raw)))
            .collect())
    }

    /// Pipelined write of many entries.
    pub async fn write_entries(&self, entries: &[(String, CacheEntry)]) -> Result<(), CacheError> {
        let framed = entries
            .iter()
            .map(|(key, entry)| -> Result<_, CacheError> {
                Ok((key.clone(), entry.encode()?, entry.physical_ttl()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.set_many(&framed).await
    }

    /// Reachability probe that bypasses the breaker, so it can report
    /// recovery while the circuit is still open.
    pub async fn ping(&self) -> bool {
        let healthy = matches!(
            tokio::time::timeout(self.timeout, self.store.ping()).await,
            Ok(Ok(()))
        );
        metrics::set_backend_healthy(healthy);
        healthy
    }
}

fn decode_or_miss(key: &str, raw: &[u8]) -> Option<CacheEntry> {
    match CacheEntry::decode(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(key, error = %e, "Malformed cache entry, treating as miss");
            metrics::record_malformed_entry();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitConfig, CircuitState};
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;

    /// Store whose every call hangs.
    struct HangingStore;

    #[async_trait]
    impl CacheStore for HangingStore {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StorageError> {
            std::future::pending().await
        }
        async fn set(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<(), StorageError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<bool, StorageError> {
            std::future::pending().await
        }
        async fn increment(&self, _: &str, _: i64) -> Result<i64, StorageError> {
            std::future::pending().await
        }
        async fn push(&self, _: &str, _: &[u8]) -> Result<u64, StorageError> {
            std::future::pending().await
        }
        async fn pop(&self, _: &str) -> Result<Option<Vec<u8>>, StorageError> {
            std::future::pending().await
        }
        async fn list_len(&self, _: &str) -> Result<u64, StorageError> {
            std::future::pending().await
        }
        async fn set_if_not_exists(&self, _: &str, _: &[u8], _: Duration) -> Result<bool, StorageError> {
            std::future::pending().await
        }
        async fn delete_if_equals(&self, _: &str, _: &[u8]) -> Result<bool, StorageError> {
            std::future::pending().await
        }
        async fn set_add(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StorageError> {
            std::future::pending().await
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>, StorageError> {
            std::future::pending().await
        }
        async fn take_token(&self, _: &str, _: f64, _: Duration, _: u64) -> Result<TokenGrant, StorageError> {
            std::future::pending().await
        }
        async fn ping(&self) -> Result<(), StorageError> {
            std::future::pending().await
        }
        async fn stats(&self) -> Result<StoreStats, StorageError> {
            std::future::pending().await
        }
    }

    fn connection(store: Arc<dyn CacheStore>) -> CacheConnection {
        CacheConnection::new(
            store,
            Arc::new(CircuitBreaker::new("cache", CircuitConfig::default())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_entry_roundtrip_through_connection() {
        let conn = connection(Arc::new(InMemoryStore::new()));
        let entry = CacheEntry::normal(b"hello".to_vec(), Duration::from_secs(60));

        conn.write_entry("v1:user:1", &entry).await.unwrap();
        let read = conn.read_entry("v1:user:1").await.unwrap().unwrap();
        assert_eq!(read.value, b"hello");
    }

    #[tokio::test]
    async fn test_malformed_value_reads_as_miss() {
        let store = Arc::new(InMemoryStore::new());
        store.set("v1:user:1", br#"{"id":"1"}"#, None).await.unwrap();
        let conn = connection(store);

        assert!(conn.read_entry("v1:user:1").await.unwrap().is_none());
        assert!(conn.get("v1:user:1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_trip_the_breaker() {
        let conn = connection(Arc::new(HangingStore));

        for _ in 0..5 {
            let err = conn.get("k").await.unwrap_err();
            assert!(err.is_unavailable());
            assert!(err.to_string().contains("timed out"));
        }
        assert_eq!(conn.breaker().state(), CircuitState::Open);

        let err = conn.get("k").await.unwrap_err();
        assert!(err.to_string().contains("circuit breaker open"));
        assert_eq!(conn.breaker().rejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_bounded_and_bypasses_breaker() {
        let conn = connection(Arc::new(HangingStore));
        assert!(!conn.ping().await);
        assert_eq!(conn.breaker().calls_total(), 0);

        let healthy = connection(Arc::new(InMemoryStore::new()));
        assert!(healthy.ping().await);
    }

    #[tokio::test]
    async fn test_read_entries_aligns_positions() {
        let conn = connection(Arc::new(InMemoryStore::new()));
        conn.write_entries(&[(
            "b".to_string(),
            CacheEntry::normal(b"B".to_vec(), Duration::from_secs(60)),
        )])
        .await
        .unwrap();

        let read = conn
            .read_entries(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(read[0].is_none());
        assert_eq!(read[1].as_ref().unwrap().value, b"B");
    }
}
