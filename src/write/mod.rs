// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write coordination.
//!
//! # Write-through
//!
//! ```text
//! save to origin ──fail──► Err(Origin), cache untouched
//!       │
//!      ok ──► overwrite cache entry ──► invalidate dependents ──► Ok
//! ```
//!
//! The origin is authoritative, so a cache failure after a successful save
//! is not an error: the outcome reports `cache_updated = false` and the
//! entry heals on its next read or expiry.
//!
//! # Write-behind
//!
//! The record is appended as a [`WriteJob`] to the queue list and copied
//! into the cache for read-your-writes; the [`WriteBehindWorker`] saves it
//! later. Enqueue is the durability point, so it fails closed: if the
//! cluster is down the write is rejected, never silently dropped. Queue
//! depth is bounded through the [`BackpressureLevel`] ladder.
//!
//! Each job takes the next value of a per-entity sequence. A retried job
//! lands behind newer writes for the same entity, so the worker discards
//! any job whose sequence is not above the last one saved.

mod job;
mod worker;

pub use job::{saved_sequence_key, sequence_key, WriteJob};
pub use worker::{JobOutcome, WriteBehindWorker};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backpressure::BackpressureLevel;
use crate::cache_entry::CacheEntry;
use crate::config::CacheEngineConfig;
use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::invalidation::InvalidationManager;
use crate::metrics;
use crate::origin::{OriginError, OriginStore, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    WriteThrough,
    WriteBehind,
}

impl WriteMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteThrough => "write-through",
            Self::WriteBehind => "write-behind",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "write-through" | "through" => Ok(Self::WriteThrough),
            "write-behind" | "behind" => Ok(Self::WriteBehind),
            other => Err(CacheError::Config(format!("unknown write mode '{other}'"))),
        }
    }
}

/// What a successful write did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub mode: WriteMode,
    /// The cache now holds the written value
    pub cache_updated: bool,
    /// The origin save is pending on the write-behind queue
    pub queued: bool,
    pub dependents_invalidated: u64,
}

pub struct WriteCoordinator {
    conn: CacheConnection,
    origin: Arc<dyn OriginStore>,
    invalidation: Arc<InvalidationManager>,
    queue_key: String,
    max_depth: u64,
    origin_timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(
        conn: CacheConnection,
        origin: Arc<dyn OriginStore>,
        invalidation: Arc<InvalidationManager>,
        config: &CacheEngineConfig,
    ) -> Self {
        Self {
            conn,
            origin,
            invalidation,
            queue_key: config.write_behind_queue_key.clone(),
            max_depth: config.write_behind_max_depth,
            origin_timeout: config.origin_timeout(),
        }
    }

    /// Write `record` for entity `id`, cached under `key` for `ttl`.
    pub async fn write(
        &self,
        key: &str,
        id: &str,
        record: &Record,
        ttl: Duration,
        mode: WriteMode,
    ) -> Result<WriteOutcome, CacheError> {
        match mode {
            WriteMode::WriteThrough => self.write_through(key, id, record, ttl).await,
            WriteMode::WriteBehind => self.write_behind(key, id, record, ttl).await,
        }
    }

    #[tracing::instrument(skip(self, record))]
    pub async fn write_through(
        &self,
        key: &str,
        id: &str,
        record: &Record,
        ttl: Duration,
    ) -> Result<WriteOutcome, CacheError> {
        let mode = WriteMode::WriteThrough;
        let saved = match tokio::time::timeout(self.origin_timeout, self.origin.save(id, record)).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::Timeout(self.origin_timeout)),
        };
        if let Err(e) = saved {
            metrics::record_write(mode.as_str(), "origin_error");
            return Err(e.into());
        }

        let entry = CacheEntry::normal(serde_json::to_vec(record)?, ttl);
        let cache_updated = match self.conn.write_entry(key, &entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Origin saved but cache update failed");
                false
            }
        };
        let dependents_invalidated = self.invalidate_dependents(key).await;

        metrics::record_write(mode.as_str(), if cache_updated { "success" } else { "cache_stale" });
        Ok(WriteOutcome {
            mode,
            cache_updated,
            queued: false,
            dependents_invalidated,
        })
    }

    #[tracing::instrument(skip(self, record))]
    pub async fn write_behind(
        &self,
        key: &str,
        id: &str,
        record: &Record,
        ttl: Duration,
    ) -> Result<WriteOutcome, CacheError> {
        let mode = WriteMode::WriteBehind;

        let depth = self.conn.list_len(&self.queue_key).await.inspect_err(|_| {
            metrics::record_write(mode.as_str(), "unavailable");
        })?;
        let level = BackpressureLevel::from_depth(depth, self.max_depth);
        metrics::set_write_queue_depth(depth);
        metrics::set_backpressure_level(level as u8);
        if !level.should_accept_writes() {
            metrics::record_write(mode.as_str(), "rejected");
            warn!(depth, max = self.max_depth, level = %level, "Write-behind queue full, rejecting");
            return Err(CacheError::QueueFull {
                depth,
                max: self.max_depth,
                level,
            });
        }

        let sequence = self
            .conn
            .increment(&sequence_key(id), 1)
            .await
            .inspect_err(|_| metrics::record_write(mode.as_str(), "unavailable"))?;
        let job = WriteJob::new(id, record.clone()).with_sequence(sequence.max(0) as u64);
        self.conn
            .push(&self.queue_key, &job.encode()?)
            .await
            .inspect_err(|_| metrics::record_write(mode.as_str(), "unavailable"))?;

        // Read-your-writes until the worker catches up
        let entry = CacheEntry::normal(serde_json::to_vec(record)?, ttl);
        let cache_updated = match self.conn.write_entry(key, &entry).await {
            Ok(()) => true,
            Err(e) => {
                debug!(key, error = %e, "Write-behind cache update failed");
                false
            }
        };
        let dependents_invalidated = self.invalidate_dependents(key).await;

        metrics::record_write(mode.as_str(), "queued");
        Ok(WriteOutcome {
            mode,
            cache_updated,
            queued: true,
            dependents_invalidated,
        })
    }

    async fn invalidate_dependents(&self, key: &str) -> u64 {
        match self.invalidation.invalidate_dependents(key).await {
            Ok(report) => report.dependents_removed,
            Err(e) => {
                warn!(key, error = %e, "Dependent invalidation failed, dependents will expire");
                0
            }
        }
    }

    pub async fn queue_depth(&self) -> Result<u64, CacheError> {
        self.conn.list_len(&self.queue_key).await
    }
}
