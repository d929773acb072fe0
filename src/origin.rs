// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The authoritative store behind the cache.
//!
//! The engine only needs point reads and writes by id. Records are JSON
//! values; the cache stores their serialized bytes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// A record as held by the origin.
pub type Record = serde_json::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OriginError {
    #[error("origin unavailable: {0}")]
    Unavailable(String),
    #[error("origin rejected write for '{id}': {reason}")]
    Rejected { id: String, reason: String },
    #[error("origin call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait OriginStore: Send + Sync {
    /// `Ok(None)` means the record does not exist.
    async fn get(&self, id: &str) -> Result<Option<Record>, OriginError>;
    async fn save(&self, id: &str, record: &Record) -> Result<(), OriginError>;
}

/// Simulated origin with configurable latency and failure injection.
pub struct InMemoryOrigin {
    records: DashMap<String, Record>,
    latency: Duration,
    fetches: AtomicU64,
    saves: AtomicU64,
    fail_reads: AtomicBool,
    fail_saves: AtomicBool,
}

impl InMemoryOrigin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            latency: Duration::ZERO,
            fetches: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn with_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, Record)>,
        S: Into<String>,
    {
        let origin = Self::new();
        for (id, record) in records {
            origin.records.insert(id.into(), record);
        }
        origin
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert(&self, id: impl Into<String>, record: Record) {
        self.records.insert(id.into(), record);
    }

    pub fn remove(&self, id: &str) -> Option<Record> {
        self.records.remove(id).map(|(_, r)| r)
    }

    /// Direct read that bypasses counters and latency.
    #[must_use]
    pub fn record(&self, id: &str) -> Option<Record> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Number of `get` calls served
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of `save` calls attempted
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for InMemoryOrigin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OriginStore for InMemoryOrigin {
    async fn get(&self, id: &str) -> Result<Option<Record>, OriginError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(OriginError::Unavailable("injected read failure".into()));
        }
        Ok(self.record(id))
    }

    async fn save(&self, id: &str, record: &Record) -> Result<(), OriginError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(OriginError::Unavailable("injected save failure".into()));
        }
        self.records.insert(id.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_counts_fetches() {
        let origin = InMemoryOrigin::with_records([("1", json!({"id": "1", "name": "Ada"}))]);

        assert_eq!(origin.get("1").await.unwrap().unwrap()["name"], "Ada");
        assert_eq!(origin.get("2").await.unwrap(), None);
        assert_eq!(origin.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_save_failure_leaves_record_untouched() {
        let origin = InMemoryOrigin::with_records([("1", json!({"v": 1}))]);
        origin.set_fail_saves(true);

        let err = origin.save("1", &json!({"v": 2})).await.unwrap_err();
        assert!(matches!(err, OriginError::Unavailable(_)));
        assert_eq!(origin.record("1"), Some(json!({"v": 1})));

        origin.set_fail_saves(false);
        origin.save("1", &json!({"v": 2})).await.unwrap();
        assert_eq!(origin.record("1"), Some(json!({"v": 2})));
        assert_eq!(origin.save_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_simulated() {
        let origin = InMemoryOrigin::new().with_latency(Duration::from_millis(20));
        let start = tokio::time::Instant::now();
        origin.get("x").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
