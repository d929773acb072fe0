// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read strategies.
//!
//! Every strategy answers the same question: "give me the bytes for this key,
//! going to the origin through `fetch` if you must". They differ in what
//! they do around a miss:
//!
//! | Strategy | Miss behaviour |
//! |----------|----------------|
//! | [`CacheAside`] | fetch, store with jittered TTL |
//! | [`Singleflight`] | one caller rebuilds under `lock:{key}`, the rest poll |
//! | [`StaleWhileRevalidate`] | serve stale, refresh once in the background |
//! | [`NegativeCache`] | like cache-aside, but remembers NotFound |
//!
//! Strategy choice is data: [`ReadStrategy`] keys a [`StrategyTable`].
//!
//! All strategies share these rules:
//! - A NEGATIVE marker reads as NotFound (`Ok(None)`) without an origin call
//! - Cache unavailability degrades to a direct origin read, never an error
//! - Origin errors always propagate
//! - Origin calls run under a deadline; a lock holder's never outlives its lock

mod cache_aside;
mod negative;
mod singleflight;
mod swr;

pub use cache_aside::CacheAside;
pub use negative::NegativeCache;
pub use singleflight::Singleflight;
pub use swr::StaleWhileRevalidate;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache_entry::{jittered_ttl, CacheEntry, Freshness};
use crate::clock::now_ms;
use crate::config::CacheEngineConfig;
use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::lock::DistributedLock;
use crate::metrics;
use crate::origin::OriginError;
use crate::resilience::retry::RetryConfig;

/// Which read policy serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadStrategy {
    CacheAside,
    Singleflight,
    #[serde(rename = "swr", alias = "stale-while-revalidate")]
    StaleWhileRevalidate,
    #[serde(alias = "negative-cache")]
    Negative,
}

impl ReadStrategy {
    pub const ALL: [ReadStrategy; 4] = [
        Self::CacheAside,
        Self::Singleflight,
        Self::StaleWhileRevalidate,
        Self::Negative,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheAside => "cache-aside",
            Self::Singleflight => "singleflight",
            Self::StaleWhileRevalidate => "swr",
            Self::Negative => "negative",
        }
    }
}

impl fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "cache-aside" => Ok(Self::CacheAside),
            "singleflight" => Ok(Self::Singleflight),
            "swr" | "stale-while-revalidate" => Ok(Self::StaleWhileRevalidate),
            "negative" | "negative-cache" => Ok(Self::Negative),
            other => Err(CacheError::Config(format!("unknown read strategy '{other}'"))),
        }
    }
}

/// Per-request read knobs supplied by the request layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadOptions {
    pub strategy: ReadStrategy,
    /// Logical freshness lifetime
    pub ttl: Duration,
    /// Extra window during which SWR serves stale values
    pub stale_grace: Duration,
}

impl ReadOptions {
    /// Engine defaults.
    #[must_use]
    pub fn from_config(config: &CacheEngineConfig) -> Self {
        Self {
            strategy: config.default_strategy,
            ttl: config.default_ttl(),
            stale_grace: config.default_stale_grace(),
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_stale_grace(mut self, stale_grace: Duration) -> Self {
        self.stale_grace = stale_grace;
        self
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::from_config(&CacheEngineConfig::default())
    }
}

/// Loads the serialized value for one key from the origin.
///
/// Called at most once per strategy step, possibly from a background task,
/// so it owns everything it needs.
pub type OriginFetch = Arc<dyn Fn() -> OriginFuture + Send + Sync>;

pub type OriginFuture = BoxFuture<'static, Result<Option<Vec<u8>>, CacheError>>;

#[async_trait]
pub trait ReadPolicy: Send + Sync {
    fn kind(&self) -> ReadStrategy;

    /// `Ok(None)` means the record does not exist.
    async fn get(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stop any background work this policy owns.
    async fn shutdown(&self) {}
}

/// Everything a policy needs from the engine.
pub struct StrategyContext {
    pub(crate) conn: CacheConnection,
    pub(crate) lock: DistributedLock,
    pub(crate) jitter_range: f64,
    pub(crate) negative_ttl: Duration,
    pub(crate) origin_timeout: Duration,
    pub(crate) rebuild_lock_ttl: Duration,
    pub(crate) swr_lock_ttl: Duration,
    pub(crate) poll: RetryConfig,
}

impl StrategyContext {
    pub fn new(conn: CacheConnection, config: &CacheEngineConfig) -> Self {
        Self {
            lock: DistributedLock::new(conn.clone()),
            conn,
            jitter_range: config.jitter_range,
            negative_ttl: config.negative_ttl(),
            origin_timeout: config.origin_timeout(),
            rebuild_lock_ttl: config.rebuild_lock_ttl(),
            swr_lock_ttl: config.swr_lock_ttl(),
            poll: config.singleflight_poll(),
        }
    }

    /// Read `key` and classify it against the current time.
    pub(crate) async fn lookup(&self, strategy: ReadStrategy, key: &str) -> Lookup {
        match self.conn.read_entry(key).await {
            Ok(None) => Lookup::Miss,
            Ok(Some(entry)) => match entry.freshness(now_ms()) {
                Freshness::Fresh => Lookup::Hit(entry),
                Freshness::Stale => Lookup::Stale(entry),
                Freshness::Expired => Lookup::Miss,
            },
            Err(e) => {
                warn!(key, strategy = %strategy, error = %e, "Cache read failed, falling back to origin");
                metrics::record_read(strategy.as_str(), "unavailable");
                Lookup::Unavailable
            }
        }
    }

    /// Write an entry, logging instead of failing. Reads never fail on a
    /// cache write.
    pub(crate) async fn store(&self, key: &str, entry: &CacheEntry) -> bool {
        match self.conn.write_entry(key, entry).await {
            Ok(()) => true,
            Err(e) => {
                debug!(key, error = %e, "Cache fill failed");
                false
            }
        }
    }

    /// Store a fetched value as a normal entry with a jittered TTL.
    pub(crate) async fn fill(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        let entry = CacheEntry::normal(value, jittered_ttl(ttl, self.jitter_range));
        self.store(key, &entry).await
    }

    /// Deadline for an origin call made while holding a lock.
    pub(crate) fn holder_deadline(&self, lock_remaining: Duration) -> Duration {
        self.origin_timeout.min(lock_remaining)
    }
}

/// A key's cache state at read time.
pub(crate) enum Lookup {
    Hit(CacheEntry),
    /// Past its TTL but within the SWR grace window
    Stale(CacheEntry),
    Miss,
    Unavailable,
}

/// What a hit returns to the caller. Negative markers read as NotFound.
pub(crate) fn served(strategy: ReadStrategy, entry: CacheEntry) -> Option<Vec<u8>> {
    if entry.is_negative() {
        metrics::record_read(strategy.as_str(), "negative_hit");
        None
    } else {
        metrics::record_read(strategy.as_str(), "hit");
        Some(entry.value)
    }
}

/// Call the origin under `deadline`.
pub(crate) async fn fetch_origin(
    strategy: ReadStrategy,
    fetch: &OriginFetch,
    deadline: Duration,
) -> Result<Option<Vec<u8>>, CacheError> {
    let started = Instant::now();
    let result = match tokio::time::timeout(deadline, fetch()).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Origin(OriginError::Timeout(deadline))),
    };
    metrics::record_origin_latency(started.elapsed());
    let status = match &result {
        Ok(Some(_)) => "found",
        Ok(None) => "not_found",
        Err(_) => "error",
    };
    metrics::record_origin_fetch(strategy.as_str(), status);
    result
}

/// Dispatch table from [`ReadStrategy`] to its policy.
pub struct StrategyTable {
    policies: HashMap<ReadStrategy, Arc<dyn ReadPolicy>>,
}

impl StrategyTable {
    /// Build all four policies over one shared context.
    pub fn new(conn: CacheConnection, config: &CacheEngineConfig) -> Self {
        let ctx = Arc::new(StrategyContext::new(conn, config));
        let policies: [Arc<dyn ReadPolicy>; 4] = [
            Arc::new(CacheAside::new(Arc::clone(&ctx))),
            Arc::new(Singleflight::new(Arc::clone(&ctx))),
            Arc::new(StaleWhileRevalidate::new(
                Arc::clone(&ctx),
                config.swr_refresh_queue,
                config.swr_refresh_concurrency,
                Duration::from_millis(config.shutdown_drain_timeout_ms),
            )),
            Arc::new(NegativeCache::new(ctx)),
        ];
        Self {
            policies: policies.into_iter().map(|p| (p.kind(), p)).collect(),
        }
    }

    pub fn policy(&self, strategy: ReadStrategy) -> Result<&Arc<dyn ReadPolicy>, CacheError> {
        self.policies
            .get(&strategy)
            .ok_or_else(|| CacheError::Config(format!("no read policy registered for {strategy}")))
    }

    pub async fn get(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        self.policy(options.strategy)?.get(key, options, fetch).await
    }

    pub async fn shutdown(&self) {
        for strategy in ReadStrategy::ALL {
            if let Some(policy) = self.policies.get(&strategy) {
                policy.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
    use crate::storage::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn connection(store: Arc<InMemoryStore>) -> CacheConnection {
        CacheConnection::new(
            store,
            Arc::new(CircuitBreaker::new("cache", CircuitConfig::default())),
            Duration::from_secs(5),
        )
    }

    pub fn context(store: Arc<InMemoryStore>) -> Arc<StrategyContext> {
        Arc::new(StrategyContext::new(connection(store), &CacheEngineConfig::default()))
    }

    /// Origin fetch returning `value` after `latency`, counting calls.
    pub fn counting_fetch(
        value: Option<&'static [u8]>,
        latency: Duration,
        calls: Arc<AtomicUsize>,
    ) -> OriginFetch {
        Arc::new(move || -> OriginFuture {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                Ok(value.map(<[u8]>::to_vec))
            })
        })
    }

    pub fn failing_fetch() -> OriginFetch {
        Arc::new(|| -> OriginFuture {
            Box::pin(async {
                Err(CacheError::Origin(OriginError::Unavailable("db down".into())))
            })
        })
    }

    pub fn options(strategy: ReadStrategy) -> ReadOptions {
        ReadOptions::default()
            .with_strategy(strategy)
            .with_ttl(Duration::from_secs(60))
            .with_stale_grace(Duration::from_secs(30))
    }
}
