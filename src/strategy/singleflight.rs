// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Singleflight: one rebuild per key across the whole cluster.
//!
//! On a miss every caller races for `lock:{key}`. The winner fetches from
//! the origin, fills the cache and releases. Losers poll the key on a
//! short jittered backoff; if the winner hasn't filled it by the time the
//! polls run out they fetch for themselves, so a crashed winner costs
//! latency, never availability. A NotFound from the origin is published as
//! a negative marker so waiting losers settle on it too.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{fetch_origin, served, Lookup, OriginFetch, ReadOptions, ReadPolicy, ReadStrategy, StrategyContext};
use crate::cache_entry::CacheEntry;
use crate::error::CacheError;
use crate::lock::LockGuard;
use crate::metrics;

pub struct Singleflight {
    ctx: Arc<StrategyContext>,
}

impl Singleflight {
    pub fn new(ctx: Arc<StrategyContext>) -> Self {
        Self { ctx }
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{}", key)
    }

    /// Winner path: fetch under the lock, fill, release.
    async fn rebuild(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: &OriginFetch,
        guard: LockGuard,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let kind = self.kind();

        // Another winner may have filled it between our miss and our acquire
        if let Lookup::Hit(entry) = self.ctx.lookup(kind, key).await {
            release(guard).await;
            return Ok(served(kind, entry));
        }

        let deadline = self.ctx.holder_deadline(guard.remaining());
        let result = fetch_origin(kind, fetch, deadline).await;
        if let Ok(value) = &result {
            self.publish(key, value.as_deref(), options).await;
        }
        release(guard).await;
        result
    }

    /// Fill with the fetched value, or a negative marker for NotFound.
    async fn publish(&self, key: &str, value: Option<&[u8]>, options: &ReadOptions) {
        match value {
            Some(value) => {
                self.ctx.fill(key, value.to_vec(), options.ttl).await;
            }
            None => {
                self.ctx
                    .store(key, &CacheEntry::negative(self.ctx.negative_ttl))
                    .await;
            }
        }
    }

    /// Loser path: poll for the winner's fill, then give up and fetch.
    async fn await_winner(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: &OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let kind = self.kind();
        let max_polls = self.ctx.poll.max_retries.unwrap_or(5) as u32;

        let mut polls = 0;
        while polls < max_polls {
            polls += 1;
            tokio::time::sleep(self.ctx.poll.delay_for_attempt(polls)).await;
            match self.ctx.lookup(kind, key).await {
                Lookup::Hit(entry) => {
                    metrics::record_singleflight_wait("filled", polls);
                    return Ok(served(kind, entry));
                }
                Lookup::Unavailable => break,
                Lookup::Stale(_) | Lookup::Miss => {}
            }
        }

        metrics::record_singleflight_wait("exhausted", polls);
        debug!(key, polls, "Singleflight wait exhausted, fetching directly");
        let value = fetch_origin(kind, fetch, self.ctx.origin_timeout).await?;
        self.publish(key, value.as_deref(), options).await;
        Ok(value)
    }
}

async fn release(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release().await {
        debug!(key = %key, error = %e, "Rebuild lock release failed, it will expire");
    }
}

#[async_trait]
impl ReadPolicy for Singleflight {
    fn kind(&self) -> ReadStrategy {
        ReadStrategy::Singleflight
    }

    async fn get(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let kind = self.kind();
        match self.ctx.lookup(kind, key).await {
            Lookup::Hit(entry) => return Ok(served(kind, entry)),
            Lookup::Unavailable => return fetch_origin(kind, &fetch, self.ctx.origin_timeout).await,
            Lookup::Stale(_) | Lookup::Miss => metrics::record_read(kind.as_str(), "miss"),
        }

        match self
            .ctx
            .lock
            .acquire(&Self::lock_key(key), self.ctx.rebuild_lock_ttl)
            .await
        {
            Ok(Some(guard)) => self.rebuild(key, options, &fetch, guard).await,
            Ok(None) => self.await_winner(key, options, &fetch).await,
            Err(e) => {
                warn!(key, error = %e, "Rebuild lock unavailable, fetching directly");
                fetch_origin(kind, &fetch, self.ctx.origin_timeout).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::CacheStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_fetch_once() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Arc::new(Singleflight::new(context(store.clone())));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(Some(b"hot"), Duration::from_millis(100), calls.clone());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let policy = Arc::clone(&policy);
            let fetch = fetch.clone();
            handles.push(tokio::spawn(async move {
                policy
                    .get("v1:product:1", &options(ReadStrategy::Singleflight), fetch)
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(b"hot".to_vec()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Winner released its lock
        assert!(store.get("lock:v1:product:1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_on_missing_id_fetch_once() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Arc::new(Singleflight::new(context(store.clone())));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(None, Duration::from_millis(100), calls.clone());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let policy = Arc::clone(&policy);
            let fetch = fetch.clone();
            handles.push(tokio::spawn(async move {
                policy
                    .get("v1:product:404", &options(ReadStrategy::Singleflight), fetch)
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let marker = CacheEntry::decode(&store.get("v1:product:404").await.unwrap().unwrap()).unwrap();
        assert!(marker.is_negative());
        assert!(store.get("lock:v1:product:404").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loser_fetches_itself_when_winner_never_fills() {
        let store = Arc::new(InMemoryStore::new());
        // Simulate a crashed winner holding the lock
        store
            .set_if_not_exists("lock:k", b"ghost", Duration::from_secs(5))
            .await
            .unwrap();
        let policy = Singleflight::new(context(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(Some(b"v"), Duration::ZERO, calls.clone());

        let value = policy
            .get("k", &options(ReadStrategy::Singleflight), fetch)
            .await
            .unwrap();

        assert_eq!(value, Some(b"v".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_releases_lock_on_origin_error() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Singleflight::new(context(store.clone()));

        let err = policy
            .get("k", &options(ReadStrategy::Singleflight), failing_fetch())
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Origin(_)));
        assert!(store.get("lock:k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_deadline_bounded_by_lock_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Singleflight::new(context(store));
        let calls = Arc::new(AtomicUsize::new(0));
        // Slower than both the origin timeout and the lock TTL
        let fetch = counting_fetch(Some(b"v"), Duration::from_secs(30), calls);

        let started = tokio::time::Instant::now();
        let err = policy
            .get("k", &options(ReadStrategy::Singleflight), fetch)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Origin(crate::origin::OriginError::Timeout(_))));
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_outage_fetches_directly() {
        let store = Arc::new(InMemoryStore::new());
        store.set_unavailable(true);
        let policy = Singleflight::new(context(store));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(Some(b"v"), Duration::ZERO, calls.clone());

        let value = policy.get("k", &options(ReadStrategy::Singleflight), fetch).await.unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
