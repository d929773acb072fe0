// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Negative caching: NotFound is remembered too.
//!
//! When the origin says a record does not exist, a NEGATIVE marker is stored
//! under the key with the (shorter) negative TTL. Until it expires, lookups
//! answer NotFound without touching the origin. This keeps probes for
//! missing ids from hammering the database.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{fetch_origin, served, Lookup, OriginFetch, ReadOptions, ReadPolicy, ReadStrategy, StrategyContext};
use crate::cache_entry::CacheEntry;
use crate::error::CacheError;
use crate::metrics;

pub struct NegativeCache {
    ctx: Arc<StrategyContext>,
}

impl NegativeCache {
    pub fn new(ctx: Arc<StrategyContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReadPolicy for NegativeCache {
    fn kind(&self) -> ReadStrategy {
        ReadStrategy::Negative
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

        match fetch_origin(kind, &fetch, self.ctx.origin_timeout).await? {
            Some(value) => {
                self.ctx.fill(key, value.clone(), options.ttl).await;
                Ok(Some(value))
            }
            None => {
                debug!(key, ttl = ?self.ctx.negative_ttl, "Caching NotFound");
                self.ctx
                    .store(key, &CacheEntry::negative(self.ctx.negative_ttl))
                    .await;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_not_found_suppresses_origin_until_marker_expires() {
        let store = Arc::new(InMemoryStore::new());
        let policy = NegativeCache::new(context(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(None, Duration::ZERO, calls.clone());
        let opts = options(ReadStrategy::Negative);

        assert!(policy.get("v1:user:404", &opts, fetch.clone()).await.unwrap().is_none());
        for _ in 0..5 {
            assert!(policy.get("v1:user:404", &opts, fetch.clone()).await.unwrap().is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Marker lives for the negative TTL, not the record TTL
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(policy.get("v1:user:404", &opts, fetch).await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_found_values_are_cached_normally() {
        let store = Arc::new(InMemoryStore::new());
        let policy = NegativeCache::new(context(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(Some(b"v"), Duration::ZERO, calls.clone());
        let opts = options(ReadStrategy::Negative);

        assert_eq!(policy.get("k", &opts, fetch.clone()).await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(policy.get("k", &opts, fetch).await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_marker_ttl_is_negative_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let policy = NegativeCache::new(context(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        policy
            .get("k", &options(ReadStrategy::Negative), counting_fetch(None, Duration::ZERO, calls))
            .await
            .unwrap();

        assert!(store.ttl_remaining("k").unwrap() <= Duration::from_secs(30));
    }
}
