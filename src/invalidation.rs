// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key and dependency invalidation, plus version-prefix mass invalidation.
//!
//! Dependency edges live in a set per parent (`deps:{parent}`) with their
//! own TTL. Invalidating a key walks those sets breadth-first, deleting
//! dependents of dependents, bounded in depth and key count. A visited set
//! makes cycles harmless.
//!
//! Mass invalidation bumps the cluster-wide version counter. Entries under
//! the old version are never read again and age out through their TTLs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache_entry::{dependency_key, KeySpace};
use crate::config::CacheEngineConfig;
use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::metrics;

/// What an invalidation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// The key itself existed and was deleted
    pub entry_removed: bool,
    /// Dependents deleted across every level of the cascade
    pub dependents_removed: u64,
    /// The cascade hit its depth or key bound before finishing
    pub truncated: bool,
}

pub struct InvalidationManager {
    conn: CacheConnection,
    keys: Arc<KeySpace>,
    dependency_ttl: Duration,
    max_depth: usize,
    max_keys: usize,
}

impl InvalidationManager {
    pub fn new(conn: CacheConnection, keys: Arc<KeySpace>, config: &CacheEngineConfig) -> Self {
        Self {
            conn,
            keys,
            dependency_ttl: config.dependency_ttl(),
            max_depth: config.max_cascade_depth.max(1),
            max_keys: config.max_cascade_keys.max(1),
        }
    }

    /// Record that `dependent` must be dropped whenever `parent` changes.
    pub async fn register_dependency(&self, parent: &str, dependent: &str) -> Result<(), CacheError> {
        self.conn
            .set_add(&dependency_key(parent), dependent, Some(self.dependency_ttl))
            .await
    }

    /// Delete `key` and everything that depends on it.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) -> Result<InvalidationReport, CacheError> {
        let entry_removed = self.conn.delete(key).await?;
        let mut report = self.cascade(key).await?;
        report.entry_removed = entry_removed;
        metrics::record_invalidation("key", u64::from(entry_removed) + report.dependents_removed);
        debug!(key, dependents = report.dependents_removed, "Invalidated");
        Ok(report)
    }

    /// Delete everything that depends on `parent`, leaving `parent` itself.
    pub async fn invalidate_dependents(&self, parent: &str) -> Result<InvalidationReport, CacheError> {
        let report = self.cascade(parent).await?;
        metrics::record_invalidation("cascade", report.dependents_removed);
        Ok(report)
    }

    async fn cascade(&self, root: &str) -> Result<InvalidationReport, CacheError> {
        let mut report = InvalidationReport::default();
        let mut visited: HashSet<String> = HashSet::from([root.to_string()]);
        let mut frontier = vec![root.to_string()];

        for _ in 0..self.max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for parent in &frontier {
                let set_key = dependency_key(parent);
                let members = self.conn.set_members(&set_key).await?;
                let fresh: Vec<String> = members
                    .into_iter()
                    .filter(|m| visited.insert(m.clone()))
                    .collect();
                if !fresh.is_empty() {
                    report.dependents_removed += self.conn.delete_many(&fresh).await?;
                }
                self.conn.delete(&set_key).await?;
                next.extend(fresh);

                if visited.len() >= self.max_keys {
                    report.truncated = true;
                    break;
                }
            }
            if report.truncated {
                break;
            }
            frontier = next;
        }

        if !frontier.is_empty() && !report.truncated {
            // Depth bound reached with dependents still unvisited
            let pending = futures::future::try_join_all(frontier.iter().map(|parent| {
                let set_key = dependency_key(parent);
                async move { self.conn.set_members(&set_key).await }
            }))
            .await?;
            report.truncated = pending.iter().any(|members| !members.is_empty());
        }

        if report.truncated {
            warn!(
                root,
                visited = visited.len(),
                max_depth = self.max_depth,
                max_keys = self.max_keys,
                "Dependency cascade truncated"
            );
        }
        Ok(report)
    }

    /// Move every instance to a new key version. Never fails: during an
    /// outage the local version still advances and the cluster catches up
    /// on the next successful bump.
    #[tracing::instrument(skip(self))]
    pub async fn bump_version(&self) -> u64 {
        let local = self.keys.version();
        let counter = self.keys.version_counter_key().to_string();

        let target = match self.conn.increment(&counter, 1).await {
            Ok(remote) => {
                let remote = remote.max(0) as u64;
                let target = remote.max(local + 1);
                if remote < target {
                    if let Err(e) = self.conn.increment(&counter, (target - remote) as i64).await {
                        warn!(error = %e, "Failed to raise cluster version counter");
                    }
                }
                target
            }
            Err(e) => {
                warn!(error = %e, "Cluster unavailable, bumping cache version locally");
                local + 1
            }
        };

        let active = self.keys.advance_to(target);
        metrics::set_cache_version(active);
        metrics::record_invalidation("version", 0);
        info!(from = local, to = active, "Cache version bumped");
        active
    }

    /// Adopt a newer version published by another instance.
    pub async fn sync_version(&self) -> Result<u64, CacheError> {
        let counter = self.keys.version_counter_key();
        let remote = self
            .conn
            .get(counter)
            .await?
            .and_then(|raw| std::str::from_utf8(&raw).ok()?.trim().parse::<u64>().ok());

        let before = self.keys.version();
        let active = match remote {
            Some(remote) => self.keys.advance_to(remote),
            None => before,
        };
        if active != before {
            info!(from = before, to = active, "Adopted cache version from cluster");
            metrics::set_cache_version(active);
        }
        Ok(active)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.keys.version()
    }
}
