// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background worker that drains the write-behind queue into the origin.
//!
//! # Job lifecycle
//!
//! ```text
//! queued ─pop─► newer save already landed? ─yes─► dropped (Superseded)
//!                │
//!               due? ─no──► re-pushed (Deferred)
//!                │
//!               yes ─save ok──► done (Written)
//!                │
//!              fails ─attempts < max─► re-pushed with backoff (Retried)
//!                │
//!              attempts = max ─────► dead-letter list (DeadLettered)
//! ```
//!
//! A job popped during a partial outage may not be re-pushable. Such jobs
//! are held in memory and pushed back first on the next tick, ahead of any
//! new pop. Shutdown drains whatever is due within the drain timeout.
//!
//! After a save the job's sequence is recorded under `wb:saved:{id}`, so a
//! retried job that fell behind a newer write for the same entity is
//! dropped instead of overwriting it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::job::{saved_sequence_key, WriteJob};
use crate::clock::now_ms;
use crate::config::CacheEngineConfig;
use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::metrics;
use crate::origin::{OriginError, OriginStore};
use crate::resilience::retry::RetryConfig;

/// Most jobs handled in one tick.
const MAX_JOBS_PER_TICK: u64 = 256;

/// Outlives any retry schedule the backoff settings allow.
const SAVED_SEQUENCE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What happened to one popped job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Written,
    /// Not yet due; put back on the queue untouched
    Deferred,
    Retried { attempt: u32, delay: Duration },
    DeadLettered,
    /// A newer write for the same entity was already saved
    Superseded,
}

pub struct WriteBehindWorker {
    conn: CacheConnection,
    origin: Arc<dyn OriginStore>,
    queue_key: String,
    dead_letter_key: String,
    max_attempts: u32,
    backoff: RetryConfig,
    origin_timeout: Duration,
    poll_interval: Duration,
    drain_timeout: Duration,
    /// Jobs popped but not yet re-pushed because the cluster was down
    stranded: Mutex<VecDeque<Vec<u8>>>,
}

impl WriteBehindWorker {
    pub fn new(conn: CacheConnection, origin: Arc<dyn OriginStore>, config: &CacheEngineConfig) -> Self {
        Self {
            conn,
            origin,
            queue_key: config.write_behind_queue_key.clone(),
            dead_letter_key: config.dead_letter_key.clone(),
            max_attempts: config.write_behind_max_attempts.max(1),
            backoff: config.write_behind_backoff(),
            origin_timeout: config.origin_timeout(),
            poll_interval: Duration::from_millis(config.write_behind_poll_ms.max(1)),
            drain_timeout: Duration::from_millis(config.shutdown_drain_timeout_ms),
            stranded: Mutex::new(VecDeque::new()),
        }
    }

    /// Jobs held in memory awaiting a re-push.
    #[must_use]
    pub fn stranded_len(&self) -> usize {
        self.stranded.lock().len()
    }

    pub async fn queue_depth(&self) -> Result<u64, CacheError> {
        self.conn.list_len(&self.queue_key).await
    }

    pub async fn dead_letters(&self) -> Result<u64, CacheError> {
        self.conn.list_len(&self.dead_letter_key).await
    }

    /// Push a job onto `list`, holding it in memory if the cluster refuses.
    async fn push_or_strand(&self, list: &str, raw: Vec<u8>) {
        if let Err(e) = self.conn.push(list, &raw).await {
            warn!(list, error = %e, "Could not re-push write-behind job, holding in memory");
            self.stranded.lock().push_back(raw);
        }
    }

    /// Re-push stranded jobs, oldest first. Stops at the first failure.
    async fn flush_stranded(&self) -> Result<(), CacheError> {
        loop {
            let next = self.stranded.lock().pop_front();
            let Some(raw) = next else {
                return Ok(());
            };
            if let Err(e) = self.conn.push(&self.queue_key, &raw).await {
                self.stranded.lock().push_front(raw);
                return Err(e);
            }
            debug!("Re-pushed stranded write-behind job");
        }
    }

    async fn save(&self, job: &WriteJob) -> Result<(), OriginError> {
        match tokio::time::timeout(self.origin_timeout, self.origin.save(&job.entity_id, &job.payload)).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::Timeout(self.origin_timeout)),
        }
    }

    /// Highest sequence saved for `entity_id`. Unknown reads as zero.
    async fn saved_sequence(&self, entity_id: &str) -> u64 {
        match self.conn.get(&saved_sequence_key(entity_id)).await {
            Ok(Some(raw)) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                debug!(entity_id, error = %e, "Saved sequence unavailable");
                0
            }
        }
    }

    async fn mark_saved(&self, job: &WriteJob) {
        if job.sequence == 0 || self.saved_sequence(&job.entity_id).await >= job.sequence {
            return;
        }
        let value = job.sequence.to_string();
        if let Err(e) = self
            .conn
            .set(&saved_sequence_key(&job.entity_id), value.as_bytes(), Some(SAVED_SEQUENCE_TTL))
            .await
        {
            warn!(entity_id = %job.entity_id, error = %e, "Could not record saved sequence");
        }
    }

    /// Pop and handle one job. `Ok(None)` means the queue is empty.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, CacheError> {
        self.flush_stranded().await?;

        let Some(raw) = self.conn.pop(&self.queue_key).await? else {
            return Ok(None);
        };

        let mut job = match WriteJob::decode(&raw) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Undecodable write-behind job, dead-lettering");
                self.push_or_strand(&self.dead_letter_key, raw).await;
                metrics::record_write_behind_job("malformed");
                return Ok(Some(JobOutcome::DeadLettered));
            }
        };

        if job.sequence > 0 && job.is_superseded_by(self.saved_sequence(&job.entity_id).await) {
            debug!(entity_id = %job.entity_id, sequence = job.sequence, "Write-behind job superseded");
            metrics::record_write_behind_job("superseded");
            return Ok(Some(JobOutcome::Superseded));
        }

        let now = now_ms();
        if !job.is_due(now) {
            self.push_or_strand(&self.queue_key, raw).await;
            return Ok(Some(JobOutcome::Deferred));
        }

        let err = match self.save(&job).await {
            Ok(()) => {
                self.mark_saved(&job).await;
                metrics::record_write_behind_job("written");
                debug!(
                    entity_id = %job.entity_id,
                    attempts = job.attempt_count + 1,
                    age_ms = job.age(now).as_millis() as u64,
                    "Write-behind job saved"
                );
                return Ok(Some(JobOutcome::Written));
            }
            Err(e) => e,
        };

        let attempt = job.attempt_count + 1;
        if attempt >= self.max_attempts {
            job.record_failure(&err, Duration::ZERO, now);
            error!(
                entity_id = %job.entity_id,
                attempts = job.attempt_count,
                error = %err,
                "Write-behind job exhausted retries, dead-lettering"
            );
            self.push_or_strand(&self.dead_letter_key, job.encode()?).await;
            metrics::record_write_behind_job("dead_lettered");
            return Ok(Some(JobOutcome::DeadLettered));
        }

        let delay = self.backoff.delay_for_attempt(attempt);
        job.record_failure(&err, delay, now);
        warn!(
            entity_id = %job.entity_id,
            attempt,
            max_attempts = self.max_attempts,
            retry_in = ?delay,
            error = %err,
            "Write-behind job failed, requeueing"
        );
        self.push_or_strand(&self.queue_key, job.encode()?).await;
        metrics::record_write_behind_job("retried");
        Ok(Some(JobOutcome::Retried { attempt, delay }))
    }

    /// Handle every job present at the start of the call, up to the
    /// per-tick cap. Returns how many were popped.
    pub async fn drain_once(&self) -> Result<u64, CacheError> {
        self.flush_stranded().await?;
        let budget = self.queue_depth().await?.min(MAX_JOBS_PER_TICK);

        let mut handled = 0;
        while handled < budget {
            match self.process_next().await? {
                Some(_) => handled += 1,
                None => break,
            }
        }

        if let Ok(depth) = self.queue_depth().await {
            metrics::set_write_queue_depth(depth);
        }
        Ok(handled)
    }

    /// Run until `shutdown` flips, then drain what is due.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(queue = %self.queue_key, interval = ?self.poll_interval, "Write-behind worker started");
            let mut tick = tokio::time::interval(self.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => break,

                    _ = tick.tick() => {
                        if let Err(e) = self.drain_once().await {
                            debug!(error = %e, "Write-behind tick skipped");
                        }
                    }
                }
            }

            self.drain_on_shutdown().await;
        })
    }

    async fn drain_on_shutdown(&self) {
        match tokio::time::timeout(self.drain_timeout, self.drain_once()).await {
            Ok(Ok(handled)) => info!(handled, "Write-behind queue drained"),
            Ok(Err(e)) => warn!(error = %e, "Write-behind drain stopped early"),
            Err(_) => warn!(timeout = ?self.drain_timeout, "Write-behind drain timed out"),
        }

        let stranded = self.stranded_len();
        if stranded > 0 {
            error!(stranded, "Write-behind jobs could not be returned to the queue and will be lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{InMemoryOrigin, Record};
    use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::CacheStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn connection(store: Arc<InMemoryStore>) -> CacheConnection {
        CacheConnection::new(
            store,
            Arc::new(CircuitBreaker::new("cache", CircuitConfig::lenient())),
            Duration::from_secs(5),
        )
    }

    fn config() -> CacheEngineConfig {
        CacheEngineConfig {
            write_behind_max_attempts: 3,
            write_behind_backoff_initial_ms: 1000,
            write_behind_backoff_max_ms: 4000,
            ..Default::default()
        }
    }

    async fn enqueue(store: &InMemoryStore, id: &str, payload: Record) {
        let raw = WriteJob::new(id, payload).encode().unwrap();
        store.push("wb:queue", &raw).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_job_reaches_origin() {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(InMemoryOrigin::new());
        let worker = WriteBehindWorker::new(connection(store.clone()), origin.clone(), &config());
        enqueue(&store, "1", json!({"name": "a"})).await;

        assert_eq!(worker.process_next().await.unwrap(), Some(JobOutcome::Written));
        assert_eq!(origin.record("1"), Some(json!({"name": "a"})));
        assert_eq!(worker.process_next().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_then_dead_letter() {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(InMemoryOrigin::new());
        origin.set_fail_saves(true);
        let worker = WriteBehindWorker::new(connection(store.clone()), origin.clone(), &config());
        enqueue(&store, "1", json!({})).await;

        let Some(JobOutcome::Retried { attempt: 1, delay }) = worker.process_next().await.unwrap() else {
            panic!("expected first retry");
        };
        // Not due yet: put back untouched
        assert_eq!(worker.process_next().await.unwrap(), Some(JobOutcome::Deferred));

        tokio::time::advance(delay).await;
        assert!(matches!(
            worker.process_next().await.unwrap(),
            Some(JobOutcome::Retried { attempt: 2, .. })
        ));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(worker.process_next().await.unwrap(), Some(JobOutcome::DeadLettered));
        assert_eq!(worker.queue_depth().await.unwrap(), 0);
        assert_eq!(worker.dead_letters().await.unwrap(), 1);

        let dead = WriteJob::decode(&store.pop("wb:dead").await.unwrap().unwrap()).unwrap();
        assert_eq!(dead.attempt_count, 3);
        assert!(dead.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_job_never_overwrites_newer_write() {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(InMemoryOrigin::new());
        let worker = WriteBehindWorker::new(connection(store.clone()), origin.clone(), &config());
        for (sequence, v) in [(1, 1), (2, 2)] {
            let raw = WriteJob::new("1", json!({ "v": v })).with_sequence(sequence).encode().unwrap();
            store.push("wb:queue", &raw).await.unwrap();
        }

        // v1 fails once and is requeued behind v2
        origin.set_fail_saves(true);
        assert!(matches!(
            worker.process_next().await.unwrap(),
            Some(JobOutcome::Retried { attempt: 1, .. })
        ));
        origin.set_fail_saves(false);

        assert_eq!(worker.process_next().await.unwrap(), Some(JobOutcome::Written));
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(worker.process_next().await.unwrap(), Some(JobOutcome::Superseded));

        assert_eq!(origin.record("1"), Some(json!({"v": 2})));
        // One failed attempt plus v2; the stale retry never reached the origin
        assert_eq!(origin.save_count(), 2);
        assert_eq!(worker.queue_depth().await.unwrap(), 0);
        assert_eq!(store.get("wb:saved:1").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_malformed_job_is_dead_lettered() {
        let store = Arc::new(InMemoryStore::new());
        let worker = WriteBehindWorker::new(
            connection(store.clone()),
            Arc::new(InMemoryOrigin::new()),
            &config(),
        );
        store.push("wb:queue", b"garbage").await.unwrap();

        assert_eq!(worker.process_next().await.unwrap(), Some(JobOutcome::DeadLettered));
        assert_eq!(store.pop("wb:dead").await.unwrap(), Some(b"garbage".to_vec()));
    }

    /// Origin whose failing save also takes the cache cluster down.
    struct OutageOrigin {
        store: Arc<InMemoryStore>,
    }

    #[async_trait]
    impl OriginStore for OutageOrigin {
        async fn get(&self, _: &str) -> Result<Option<Record>, OriginError> {
            Ok(None)
        }
        async fn save(&self, _: &str, _: &Record) -> Result<(), OriginError> {
            self.store.set_unavailable(true);
            Err(OriginError::Unavailable("network partition".into()))
        }
    }

    #[tokio::test]
    async fn test_unpushable_job_is_held_and_pushed_back_first() {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(OutageOrigin { store: store.clone() });
        let worker = WriteBehindWorker::new(connection(store.clone()), origin, &config());
        enqueue(&store, "1", json!({})).await;

        assert!(matches!(
            worker.process_next().await.unwrap(),
            Some(JobOutcome::Retried { .. })
        ));
        assert_eq!(worker.stranded_len(), 1);

        // Still down: the next tick fails without losing the job
        assert!(worker.process_next().await.is_err());
        assert_eq!(worker.stranded_len(), 1);

        store.set_unavailable(false);
        worker.flush_stranded().await.unwrap();
        assert_eq!(worker.stranded_len(), 0);
        assert_eq!(worker.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_once_handles_every_due_job() {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(InMemoryOrigin::new());
        let worker = WriteBehindWorker::new(connection(store.clone()), origin.clone(), &config());
        for i in 0..10 {
            enqueue(&store, &i.to_string(), json!({ "n": i })).await;
        }

        assert_eq!(worker.drain_once().await.unwrap(), 10);
        assert_eq!(origin.save_count(), 10);
        assert_eq!(worker.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_worker_drains_and_stops() {
        let store = Arc::new(InMemoryStore::new());
        let origin = Arc::new(InMemoryOrigin::new());
        let worker = Arc::new(WriteBehindWorker::new(connection(store.clone()), origin.clone(), &config()));
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&worker).spawn(rx);

        enqueue(&store, "1", json!({})).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(origin.save_count(), 1);

        enqueue(&store, "2", json!({})).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(origin.save_count(), 2);
    }
}
