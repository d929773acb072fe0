// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk, merge, derived-entry and recompute operations.
//!
//! - `get_many()` - One MGET, origin for the misses, pipelined refill
//! - `patch()` - Shallow merge into the origin record, then write
//! - `put_derived()` / `get_derived()` - Entries computed from a parent
//! - `recompute()` - Cluster-wide exclusive background job

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache_entry::{jittered_ttl, CacheEntry, Freshness};
use crate::clock::now_ms;
use crate::error::CacheError;
use crate::metrics;
use crate::origin::{OriginError, Record};
use crate::write::WriteMode;

use super::{CacheEngine, PatchOutcome, RecomputeOutcome};

/// Global lock guarding [`CacheEngine::recompute`].
const RECOMPUTE_LOCK: &str = "locks:recompute";

impl CacheEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Bulk & Derived Operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Read many records in one cache round trip.
    ///
    /// Misses go to the origin concurrently; found records are refilled with
    /// a jittered `ttl` and missing ids get NEGATIVE markers, all in one
    /// pipelined write. Positions in the result line up with `ids`.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_many(&self, ids: &[&str], ttl: Duration) -> Result<Vec<Option<Record>>, CacheError> {
        let keys: Vec<String> = ids.iter().map(|id| self.key_for(id)).collect();

        let (cached, reachable) = match self.conn.read_entries(&keys).await {
            Ok(entries) => (entries, true),
            Err(e) => {
                warn!(error = %e, "Bulk cache read failed, reading all from origin");
                (vec![None; keys.len()], false)
            }
        };

        let now = now_ms();
        let mut results: Vec<Option<Record>> = vec![None; ids.len()];
        let mut misses = Vec::new();
        for (i, entry) in cached.into_iter().enumerate() {
            match entry {
                Some(entry) if entry.freshness(now) != Freshness::Expired => {
                    if entry.is_negative() {
                        continue;
                    }
                    match serde_json::from_slice::<Record>(&entry.value) {
                        Ok(record) => results[i] = Some(record),
                        Err(_) => misses.push(i),
                    }
                }
                _ => misses.push(i),
            }
        }
        metrics::record_read("bulk", if misses.is_empty() { "hit" } else { "miss" });

        if misses.is_empty() {
            return Ok(results);
        }

        let fetched = futures::future::try_join_all(misses.iter().map(|&i| self.origin_get(ids[i]))).await?;

        let mut refill = Vec::with_capacity(misses.len());
        for (i, record) in misses.into_iter().zip(fetched) {
            let entry = match &record {
                Some(record) => CacheEntry::normal(
                    serde_json::to_vec(record)?,
                    jittered_ttl(ttl, self.config.jitter_range),
                ),
                None => CacheEntry::negative(self.config.negative_ttl()),
            };
            refill.push((keys[i].clone(), entry));
            results[i] = record;
        }

        if reachable {
            if let Err(e) = self.conn.write_entries(&refill).await {
                debug!(error = %e, "Bulk refill failed");
            }
        }
        Ok(results)
    }

    /// Merge `fields` into the record for `id` and write the result.
    ///
    /// Top-level keys in `fields` replace those in the current record. A
    /// missing (or non-object) record is created from `fields` alone.
    #[tracing::instrument(skip(self, fields))]
    pub async fn patch(&self, id: &str, fields: &Record, mode: WriteMode) -> Result<PatchOutcome, CacheError> {
        let Value::Object(patch) = fields else {
            return Err(CacheError::Codec("patch fields must be a JSON object".into()));
        };

        let merged = match self.origin_get(id).await? {
            Some(Value::Object(mut current)) => {
                current.extend(patch.clone());
                Value::Object(current)
            }
            _ => Value::Object(patch.clone()),
        };

        let write = self.set(id, &merged, mode).await?;
        Ok(PatchOutcome { record: merged, write })
    }

    /// Store a value derived from entity `parent_id` under `namespace:id`.
    ///
    /// The entry is dropped whenever the parent is written or invalidated.
    pub async fn put_derived(
        &self,
        parent_id: &str,
        namespace: &str,
        id: &str,
        value: &Record,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = self.key_in(namespace, id);
        let entry = CacheEntry::normal(serde_json::to_vec(value)?, ttl);
        self.conn.write_entry(&key, &entry).await?;
        self.invalidation
            .register_dependency(&self.key_for(parent_id), &key)
            .await
    }

    /// Read a derived entry. Derived values have no origin, so a miss or an
    /// unreachable cluster both answer `None`.
    pub async fn get_derived(&self, namespace: &str, id: &str) -> Option<Record> {
        let key = self.key_in(namespace, id);
        match self.conn.read_entry(&key).await {
            Ok(Some(entry)) if entry.freshness(now_ms()) == Freshness::Fresh && !entry.is_negative() => {
                serde_json::from_slice(&entry.value).ok()
            }
            Ok(_) => None,
            Err(e) => {
                debug!(key = %key, error = %e, "Derived read failed");
                None
            }
        }
    }

    /// Run `task` while holding the global recompute lock.
    ///
    /// Only one instance in the cluster recomputes at a time; the others
    /// get [`RecomputeOutcome::AlreadyRunning`]. The task is cut off when the
    /// lock would expire. Without the cluster no exclusivity can be
    /// promised, so an outage is an error.
    #[tracing::instrument(skip(self, task))]
    pub async fn recompute<F, Fut, T>(&self, task: F) -> Result<RecomputeOutcome<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let ttl = self.config.recompute_lock_ttl();
        let Some(guard) = self.lock.acquire(RECOMPUTE_LOCK, ttl).await? else {
            info!("Recompute already running elsewhere");
            return Ok(RecomputeOutcome::AlreadyRunning);
        };

        let result = tokio::time::timeout(guard.remaining(), task()).await;
        if let Err(e) = guard.release().await {
            debug!(error = %e, "Recompute lock release failed, it will expire");
        }

        match result {
            Ok(Ok(value)) => Ok(RecomputeOutcome::Completed(value)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(ttl = ?ttl, "Recompute overran its lock");
                Err(OriginError::Timeout(ttl).into())
            }
        }
    }
}
