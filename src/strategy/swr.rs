// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stale-while-revalidate.
//!
//! Entries carry two deadlines:
//!
//! ```text
//!   stored_at ──── fresh ──── expires_at ──── stale ──── stale_at ──── gone
//!                  serve                serve + refresh         block + fetch
//! ```
//!
//! A stale read returns immediately and schedules one background refresh.
//! `swrlock:{key}` coalesces refreshes across every instance; only the caller
//! that takes it enqueues a job. Jobs go through a bounded channel to a
//! refresher task that runs at most `concurrency` of them at once. A full
//! queue drops the job and releases the lock; the next stale read retries.
//!
//! The refresher starts on first use and stops on [`ReadPolicy::shutdown`]:
//! in-flight refreshes finish, queued ones are dropped, and the whole thing
//! is aborted if it overruns the drain timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{fetch_origin, served, Lookup, OriginFetch, ReadOptions, ReadPolicy, ReadStrategy, StrategyContext};
use crate::cache_entry::CacheEntry;
use crate::error::CacheError;
use crate::lock::LockGuard;
use crate::metrics;

const KIND: ReadStrategy = ReadStrategy::StaleWhileRevalidate;

/// One pending background refresh. Owns the coalescing lock until done.
struct RefreshJob {
    key: String,
    options: ReadOptions,
    fetch: OriginFetch,
    guard: LockGuard,
}

pub struct StaleWhileRevalidate {
    ctx: Arc<StrategyContext>,
    tx: mpsc::Sender<RefreshJob>,
    rx: Mutex<Option<mpsc::Receiver<RefreshJob>>>,
    concurrency: usize,
    drain_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StaleWhileRevalidate {
    pub fn new(ctx: Arc<StrategyContext>, queue: usize, concurrency: usize, drain_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            tx,
            rx: Mutex::new(Some(rx)),
            concurrency: concurrency.max(1),
            drain_timeout,
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    fn lock_key(key: &str) -> String {
        format!("swrlock:{}", key)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn the refresher the first time it is needed.
    fn ensure_started(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(run_refresher(
            Arc::clone(&self.ctx),
            rx,
            self.shutdown_tx.subscribe(),
            self.concurrency,
        ));
        *self.worker.lock() = Some(handle);
        debug!(concurrency = self.concurrency, "SWR refresher started");
    }

    /// Take the coalescing lock and hand the refresh to the background task.
    async fn schedule(&self, key: &str, options: &ReadOptions, fetch: OriginFetch) {
        let guard = match self.ctx.lock.acquire(&Self::lock_key(key), self.ctx.swr_lock_ttl).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                metrics::record_swr_refresh("coalesced");
                return;
            }
            Err(e) => {
                debug!(key, error = %e, "Could not take refresh lock, skipping refresh");
                metrics::record_swr_refresh("skipped");
                return;
            }
        };

        if self.is_shutting_down() {
            release(guard).await;
            metrics::record_swr_refresh("dropped");
            return;
        }

        self.ensure_started();
        let job = RefreshJob {
            key: key.to_string(),
            options: *options,
            fetch,
            guard,
        };
        match self.tx.try_send(job) {
            Ok(()) => metrics::record_swr_refresh("scheduled"),
            Err(err) => {
                let job = err.into_inner();
                warn!(key = %job.key, "Refresh queue full, dropping refresh");
                release(job.guard).await;
                metrics::record_swr_refresh("dropped");
            }
        }
    }

    /// Blocking fetch for cold or fully expired keys.
    async fn fetch_and_store(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: &OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let value = fetch_origin(KIND, fetch, self.ctx.origin_timeout).await?;
        if let Some(value) = &value {
            let entry = CacheEntry::swr(value.clone(), options.ttl, options.stale_grace);
            self.ctx.store(key, &entry).await;
        }
        Ok(value)
    }
}

#[async_trait]
impl ReadPolicy for StaleWhileRevalidate {
    fn kind(&self) -> ReadStrategy {
        KIND
    }

    async fn get(
        &self,
        key: &str,
        options: &ReadOptions,
        fetch: OriginFetch,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        match self.ctx.lookup(KIND, key).await {
            Lookup::Hit(entry) => Ok(served(KIND, entry)),
            Lookup::Stale(entry) => {
                metrics::record_read(KIND.as_str(), "stale");
                self.schedule(key, options, fetch).await;
                Ok((!entry.is_negative()).then_some(entry.value))
            }
            Lookup::Unavailable => fetch_origin(KIND, &fetch, self.ctx.origin_timeout).await,
            Lookup::Miss => {
                metrics::record_read(KIND.as_str(), "miss");
                self.fetch_and_store(key, options, &fetch).await
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        // Never started: nothing to drain
        self.rx.lock().take();

        let handle = self.worker.lock().take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(self.drain_timeout, &mut handle).await.is_err() {
            warn!(timeout = ?self.drain_timeout, "SWR refresher did not drain in time, aborting");
            handle.abort();
        } else {
            info!("SWR refresher stopped");
        }
    }
}

async fn run_refresher(
    ctx: Arc<StrategyContext>,
    mut rx: mpsc::Receiver<RefreshJob>,
    mut shutdown: watch::Receiver<bool>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            job = rx.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                let ctx = Arc::clone(&ctx);
                tasks.spawn(async move {
                    let _permit = permit;
                    refresh(&ctx, job).await;
                });
            }

            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Queued but never started: give their locks back
    rx.close();
    while let Ok(job) = rx.try_recv() {
        release(job.guard).await;
        metrics::record_swr_refresh("dropped");
    }
    while tasks.join_next().await.is_some() {}
}

async fn refresh(ctx: &StrategyContext, job: RefreshJob) {
    let RefreshJob {
        key,
        options,
        fetch,
        guard,
    } = job;

    let deadline = ctx.holder_deadline(guard.remaining());
    match fetch_origin(KIND, &fetch, deadline).await {
        Ok(Some(value)) => {
            let entry = CacheEntry::swr(value, options.ttl, options.stale_grace);
            if ctx.store(&key, &entry).await {
                metrics::record_swr_refresh("completed");
            } else {
                metrics::record_swr_refresh("failed");
            }
        }
        Ok(None) => {
            // Record is gone; stop serving the stale copy
            if let Err(e) = ctx.conn.delete(&key).await {
                debug!(key = %key, error = %e, "Could not drop entry for deleted record");
            }
            metrics::record_swr_refresh("not_found");
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Background refresh failed, serving stale until grace ends");
            metrics::record_swr_refresh("failed");
        }
    }
    release(guard).await;
}

async fn release(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release().await {
        debug!(key = %key, error = %e, "Refresh lock release failed, it will expire");
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::CacheStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(store: Arc<InMemoryStore>) -> (Arc<StaleWhileRevalidate>, Arc<StrategyContext>) {
        let ctx = context(store);
        let swr = StaleWhileRevalidate::new(Arc::clone(&ctx), 16, 4, Duration::from_secs(2));
        (Arc::new(swr), ctx)
    }

    async fn seed(ctx: &StrategyContext, key: &str, value: &[u8]) {
        let entry = CacheEntry::swr(value.to_vec(), Duration::from_secs(60), Duration::from_secs(30));
        ctx.conn.write_entry(key, &entry).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_served_without_origin() {
        let (swr, ctx) = policy(Arc::new(InMemoryStore::new()));
        seed(&ctx, "k", b"old").await;
        let calls = Arc::new(AtomicUsize::new(0));

        let value = swr
            .get("k", &options(KIND), counting_fetch(Some(b"new"), Duration::ZERO, calls.clone()))
            .await
            .unwrap();

        assert_eq!(value, Some(b"old".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reads_trigger_exactly_one_refresh() {
        let (swr, ctx) = policy(Arc::new(InMemoryStore::new()));
        seed(&ctx, "k", b"old").await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(Some(b"new"), Duration::from_millis(50), calls.clone());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let swr = Arc::clone(&swr);
            let fetch = fetch.clone();
            handles.push(tokio::spawn(async move { swr.get("k", &options(KIND), fetch).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(b"old".to_vec()));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = swr.get("k", &options(KIND), fetch).await.unwrap();
        assert_eq!(value, Some(b"new".to_vec()));
        assert!(ctx.conn.get("swrlock:k").await.unwrap().is_none());
        swr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_stale_at_blocks_on_origin() {
        let (swr, ctx) = policy(Arc::new(InMemoryStore::new()));
        seed(&ctx, "k", b"old").await;
        tokio::time::advance(Duration::from_secs(91)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let value = swr
            .get("k", &options(KIND), counting_fetch(Some(b"new"), Duration::ZERO, calls.clone()))
            .await
            .unwrap();

        assert_eq!(value, Some(b"new".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_key_stores_swr_entry_with_grace() {
        let store = Arc::new(InMemoryStore::new());
        let (swr, ctx) = policy(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        swr.get("k", &options(KIND), counting_fetch(Some(b"v"), Duration::ZERO, calls))
            .await
            .unwrap();

        let entry = ctx.conn.read_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.kind, crate::cache_entry::EntryKind::Swr);
        assert_eq!(store.ttl_remaining("k"), Some(Duration::from_secs(90)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_of_deleted_record_drops_entry() {
        let store = Arc::new(InMemoryStore::new());
        let (swr, ctx) = policy(store.clone());
        seed(&ctx, "k", b"old").await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(None, Duration::ZERO, calls.clone());
        assert_eq!(swr.get("k", &options(KIND), fetch).await.unwrap(), Some(b"old".to_vec()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("k").await.unwrap().is_none());
        swr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_shutdown_stale_is_served_without_refresh() {
        let (swr, ctx) = policy(Arc::new(InMemoryStore::new()));
        seed(&ctx, "k", b"old").await;
        swr.shutdown().await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(Some(b"new"), Duration::ZERO, calls.clone());
        assert_eq!(swr.get("k", &options(KIND), fetch).await.unwrap(), Some(b"old".to_vec()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(ctx.conn.get("swrlock:k").await.unwrap().is_none());
    }
}
