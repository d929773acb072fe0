// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache engine coordinator.
//!
//! The [`CacheEngine`] is the facade request handlers talk to. It wires
//! together:
//! - one circuit-protected [`CacheConnection`] shared by every component
//! - the rate limiter
//! - the read strategy table
//! - the write coordinator and write-behind worker
//! - invalidation and the cluster-wide version counter
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! Reads and writes work from `Created`; [`start()`](CacheEngine::start)
//! adds the background tasks (write-behind drain, version sync).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_engine::{CacheEngine, CacheEngineConfig, InMemoryOrigin, InMemoryStore, ReadOptions, WriteMode};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheEngineConfig::default();
//! let origin = Arc::new(InMemoryOrigin::new());
//! let engine = CacheEngine::new(config, Arc::new(InMemoryStore::new()), origin);
//! engine.start().await.expect("start failed");
//!
//! engine.set("42", &json!({"name": "Ada"}), WriteMode::WriteThrough).await.unwrap();
//! let user = engine.get("42", &ReadOptions::default()).await.unwrap();
//! assert_eq!(user.unwrap()["name"], "Ada");
//!
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{CacheStats, EngineState, PatchOutcome, RecomputeOutcome};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache_entry::KeySpace;
use crate::config::CacheEngineConfig;
use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::invalidation::{InvalidationManager, InvalidationReport};
use crate::lock::DistributedLock;
use crate::metrics;
use crate::origin::{OriginError, OriginStore, Record};
use crate::rate_limiter::RateLimiter;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::storage::traits::CacheStore;
use crate::strategy::{OriginFetch, OriginFuture, ReadOptions, StrategyTable};
use crate::write::{WriteBehindWorker, WriteCoordinator, WriteMode, WriteOutcome};

/// Caching middleware in front of an [`OriginStore`].
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc`. All components
/// share one connection and one circuit breaker.
pub struct CacheEngine {
    pub(super) config: CacheEngineConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) conn: CacheConnection,
    pub(super) origin: Arc<dyn OriginStore>,
    pub(super) keys: Arc<KeySpace>,

    pub(super) rate_limiter: RateLimiter,
    pub(super) strategies: StrategyTable,
    pub(super) writes: WriteCoordinator,
    pub(super) invalidation: Arc<InvalidationManager>,
    pub(super) lock: DistributedLock,
    pub(super) worker: Arc<WriteBehindWorker>,

    /// Flipped once to stop every background task
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Build an engine over `store` and `origin`.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to run background tasks. Use [`connect()`](Self::connect) to build
    /// one over Redis from configuration.
    pub fn new(config: CacheEngineConfig, store: Arc<dyn CacheStore>, origin: Arc<dyn OriginStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        let breaker = Arc::new(CircuitBreaker::new("cache", config.circuit_config()));
        let conn = CacheConnection::new(store, breaker, config.socket_timeout());
        let keys = Arc::new(KeySpace::new(config.cache_version, config.version_counter_key.clone()));
        let invalidation = Arc::new(InvalidationManager::new(conn.clone(), Arc::clone(&keys), &config));

        Self {
            rate_limiter: RateLimiter::from_config(conn.clone(), &config),
            strategies: StrategyTable::new(conn.clone(), &config),
            writes: WriteCoordinator::new(conn.clone(), Arc::clone(&origin), Arc::clone(&invalidation), &config),
            worker: Arc::new(WriteBehindWorker::new(conn.clone(), Arc::clone(&origin), &config)),
            lock: DistributedLock::new(conn.clone()),
            state: state_tx,
            state_rx,
            conn,
            origin,
            keys,
            invalidation,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    #[must_use]
    pub fn config(&self) -> &CacheEngineConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.conn.breaker()
    }

    #[must_use]
    pub fn cache_version(&self) -> u64 {
        self.keys.version()
    }

    /// Cache key for entity `id` in the default namespace.
    #[must_use]
    pub fn key_for(&self, id: &str) -> String {
        self.key_in(&self.config.namespace, id)
    }

    /// Cache key for `id` in `namespace`, under the current version.
    #[must_use]
    pub fn key_in(&self, namespace: &str, id: &str) -> String {
        self.keys.key(namespace, id).render()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Admission
    // ═══════════════════════════════════════════════════════════════════════════

    /// Spend one rate-limit token for `identity`.
    ///
    /// Returns `CacheError::RateLimited` when the bucket is empty. During a
    /// cluster outage the configured fail-open flag decides.
    pub async fn admit(&self, identity: &str) -> Result<(), CacheError> {
        self.rate_limiter.check(identity).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Read entity `id` through the strategy named in `options`.
    ///
    /// `Ok(None)` means the record does not exist. Cache trouble never
    /// surfaces here; origin trouble always does.
    #[tracing::instrument(skip(self, options), fields(strategy = %options.strategy))]
    pub async fn get(&self, id: &str, options: &ReadOptions) -> Result<Option<Record>, CacheError> {
        let key = self.key_for(id);
        let Some(bytes) = self.strategies.get(&key, options, self.origin_fetch(id)).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<Record>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached record is not valid JSON, dropping it");
                metrics::record_malformed_entry();
                if let Err(e) = self.conn.delete(&key).await {
                    debug!(key = %key, error = %e, "Could not drop corrupt entry");
                }
                self.origin_get(id).await
            }
        }
    }

    /// Origin fetch for `id`, owned so background refreshes can run it.
    pub(super) fn origin_fetch(&self, id: &str) -> OriginFetch {
        let origin = Arc::clone(&self.origin);
        let id = id.to_string();
        Arc::new(move || -> OriginFuture {
            let origin = Arc::clone(&origin);
            let id = id.clone();
            Box::pin(async move {
                match origin.get(&id).await? {
                    Some(record) => Ok(Some(serde_json::to_vec(&record)?)),
                    None => Ok(None),
                }
            })
        })
    }

    /// Direct origin read under the origin deadline.
    pub(super) async fn origin_get(&self, id: &str) -> Result<Option<Record>, CacheError> {
        let timeout = self.config.origin_timeout();
        match tokio::time::timeout(timeout, self.origin.get(id)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OriginError::Timeout(timeout).into()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write `record` for `id` with the default TTL.
    pub async fn set(&self, id: &str, record: &Record, mode: WriteMode) -> Result<WriteOutcome, CacheError> {
        self.set_with_ttl(id, record, mode, self.config.default_ttl()).await
    }

    #[tracing::instrument(skip(self, record))]
    pub async fn set_with_ttl(
        &self,
        id: &str,
        record: &Record,
        mode: WriteMode,
        ttl: std::time::Duration,
    ) -> Result<WriteOutcome, CacheError> {
        let key = self.key_for(id);
        self.writes.write(&key, id, record, ttl, mode).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Invalidation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drop the cached entry for `id` and everything derived from it.
    pub async fn invalidate(&self, id: &str) -> Result<InvalidationReport, CacheError> {
        self.invalidation.invalidate(&self.key_for(id)).await
    }

    /// Drop a derived entry and its own dependents.
    pub async fn invalidate_in(&self, namespace: &str, id: &str) -> Result<InvalidationReport, CacheError> {
        self.invalidation.invalidate(&self.key_in(namespace, id)).await
    }

    /// Make every existing entry unreachable by moving to a new key version.
    /// Returns the new version. Never fails.
    pub async fn invalidate_all(&self) -> u64 {
        self.invalidation.bump_version().await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Observability
    // ═══════════════════════════════════════════════════════════════════════════

    /// Health and usage snapshot. Never fails.
    pub async fn stats(&self) -> CacheStats {
        let reachable = self.conn.ping().await;
        let (key_count, memory_used_bytes, write_queue_depth, dead_letters) = if reachable {
            let store = self.conn.stats().await.ok();
            (
                store.as_ref().and_then(|s| s.key_count),
                store.as_ref().and_then(|s| s.memory_used_bytes),
                self.worker.queue_depth().await.ok(),
                self.worker.dead_letters().await.ok(),
            )
        } else {
            (None, None, None, None)
        };

        CacheStats {
            reachable,
            circuit: self.conn.breaker().health(),
            key_count,
            memory_used_bytes,
            write_queue_depth,
            dead_letters,
            stranded_writes: self.worker.stranded_len(),
            cache_version: self.keys.version(),
            state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::InMemoryOrigin;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::storage::memory::InMemoryStore;
    use crate::strategy::ReadStrategy;
    use serde_json::json;

    pub(super) fn engine_with(config: CacheEngineConfig) -> (CacheEngine, Arc<InMemoryStore>, Arc<InMemoryOrigin>) {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(InMemoryOrigin::with_records([
            ("1", json!({"id": "1", "name": "Ada"})),
            ("2", json!({"id": "2", "name": "Grace"})),
        ]));
        let engine = CacheEngine::new(config, store.clone(), origin.clone());
        (engine, store, origin)
    }

    pub(super) fn engine() -> (CacheEngine, Arc<InMemoryStore>, Arc<InMemoryOrigin>) {
        engine_with(CacheEngineConfig::default())
    }

    #[tokio::test]
    async fn test_new_engine_is_created() {
        let (engine, _, _) = engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(engine.key_for("7"), "v1:record:7");
        assert_eq!(engine.key_in("widget", "7"), "v1:widget:7");
    }

    #[tokio::test]
    async fn test_get_caches_every_strategy() {
        let (engine, _, origin) = engine();
        for strategy in ReadStrategy::ALL {
            engine.invalidate("1").await.unwrap();
            let before = origin.fetch_count();
            let opts = ReadOptions::default().with_strategy(strategy);

            let first = engine.get("1", &opts).await.unwrap().unwrap();
            let second = engine.get("1", &opts).await.unwrap().unwrap();

            assert_eq!(first["name"], "Ada");
            assert_eq!(first, second);
            assert_eq!(origin.fetch_count() - before, 1, "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let (engine, _, _) = engine();
        let opts = ReadOptions::default().with_strategy(ReadStrategy::Negative);
        assert!(engine.get("404", &opts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_through_then_read_skips_origin() {
        let (engine, _, origin) = engine();
        engine
            .set("3", &json!({"id": "3", "name": "Linus"}), WriteMode::WriteThrough)
            .await
            .unwrap();

        let opts = ReadOptions::default().with_strategy(ReadStrategy::CacheAside);
        let record = engine.get("3", &opts).await.unwrap().unwrap();

        assert_eq!(record["name"], "Linus");
        assert_eq!(origin.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_cached_json_falls_back_to_origin() {
        let (engine, _, origin) = engine();
        let key = engine.key_for("1");
        engine
            .conn
            .write_entry(&key, &crate::cache_entry::CacheEntry::normal(b"{not json".to_vec(), engine.config.default_ttl()))
            .await
            .unwrap();

        let record = engine.get("1", &ReadOptions::default()).await.unwrap().unwrap();
        assert_eq!(record["name"], "Ada");
        assert_eq!(origin.fetch_count(), 1);
        assert!(engine.conn.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_origin_error_propagates() {
        let (engine, _, origin) = engine();
        origin.set_fail_reads(true);

        let err = engine.get("1", &ReadOptions::default()).await.unwrap_err();
        assert!(matches!(err, CacheError::Origin(_)));
        assert_eq!(err.http_status_code(), 502);
    }

    #[tokio::test]
    async fn test_invalidate_all_orphans_old_keys() {
        let (engine, _, origin) = engine();
        let opts = ReadOptions::default().with_strategy(ReadStrategy::CacheAside);
        engine.get("1", &opts).await.unwrap();

        assert_eq!(engine.invalidate_all().await, 2);
        assert_eq!(engine.key_for("1"), "v2:record:1");

        engine.get("1", &opts).await.unwrap();
        assert_eq!(origin.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_admit_rate_limits() {
        let (engine, _, _) = engine_with(CacheEngineConfig {
            rate_max_tokens: 2,
            ..Default::default()
        });
        engine.admit("10.0.0.1").await.unwrap();
        engine.admit("10.0.0.1").await.unwrap();
        let err = engine.admit("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, CacheError::RateLimited { .. }));
        assert!(err.retry_after_secs().is_some());
    }

    #[tokio::test]
    async fn test_stats_when_healthy_and_down() {
        let (engine, store, _) = engine();
        engine.get("1", &ReadOptions::default()).await.unwrap();

        let stats = engine.stats().await;
        assert!(stats.reachable);
        assert_eq!(stats.circuit.state, CircuitState::Closed);
        assert_eq!(stats.key_count, Some(1));
        assert_eq!(stats.write_queue_depth, Some(0));
        assert_eq!(stats.cache_version, 1);
        assert_eq!(stats.state, EngineState::Created);

        store.set_unavailable(true);
        let stats = engine.stats().await;
        assert!(!stats.reachable);
        assert_eq!(stats.key_count, None);
        assert!(serde_json::to_value(&stats).is_ok());
    }
}
