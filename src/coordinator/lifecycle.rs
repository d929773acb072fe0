// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: connect, start, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CacheEngineConfig;
use crate::error::CacheError;
use crate::metrics;
use crate::origin::OriginStore;
use crate::storage::redis::RedisStore;

use super::{CacheEngine, EngineState};

/// Extra time allowed past the drain timeout before tasks are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

impl CacheEngine {
    /// Validate `config`, connect to Redis and build an engine.
    ///
    /// Uses the writer endpoint for everything except entry reads, which go
    /// to `redis_reader_url` when one is set.
    #[tracing::instrument(skip(config, origin))]
    pub async fn connect(config: CacheEngineConfig, origin: Arc<dyn OriginStore>) -> Result<Self, CacheError> {
        config.validate()?;
        let Some(writer_url) = config.redis_url.as_deref() else {
            return Err(CacheError::Config("redis_url is required to connect".into()));
        };

        let store = RedisStore::connect(
            writer_url,
            config.redis_reader_url.as_deref(),
            config.key_prefix.as_deref(),
        )
        .await?;
        info!(
            reader = store.has_reader(),
            prefix = ?config.key_prefix,
            "Connected to cache cluster"
        );

        Ok(Self::new(config, Arc::new(store), origin))
    }

    /// Start background tasks: write-behind drain and version sync.
    ///
    /// Adopts the cluster's cache version first so a fresh instance never
    /// serves keys another instance has already orphaned.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), CacheError> {
        match self.state() {
            EngineState::Created => {}
            EngineState::Running => return Ok(()),
            state => return Err(CacheError::Config(format!("cannot start engine in state {state}"))),
        }

        match self.invalidation.sync_version().await {
            Ok(version) => metrics::set_cache_version(version),
            Err(e) => warn!(error = %e, "Could not read cluster cache version, using local"),
        }

        let worker = Arc::clone(&self.worker).spawn(self.shutdown_tx.subscribe());
        let sync = self.spawn_version_sync();
        self.tasks.lock().extend([worker, sync]);

        self.set_state(EngineState::Running);
        info!(version = self.keys.version(), "Cache engine running");
        Ok(())
    }

    fn spawn_version_sync(&self) -> tokio::task::JoinHandle<()> {
        let invalidation = Arc::clone(&self.invalidation);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(self.config.version_sync_interval_secs.max(1));

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => break,

                    _ = tick.tick() => {
                        if let Err(e) = invalidation.sync_version().await {
                            debug!(error = %e, "Version sync skipped");
                        }
                    }
                }
            }
            debug!("Version sync stopped");
        })
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops the background tasks, letting the write-behind worker drain due
    /// jobs and the SWR refresher finish in-flight refreshes, each bounded by
    /// the drain timeout.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let shutdown_start = tokio::time::Instant::now();
        info!("Initiating cache engine shutdown...");
        self.set_state(EngineState::ShuttingDown);
        self.shutdown_tx.send_replace(true);

        let deadline = Duration::from_millis(self.config.shutdown_drain_timeout_ms) + SHUTDOWN_GRACE;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                warn!(timeout = ?deadline, "Background task did not stop in time, aborting");
                task.abort();
            }
        }

        self.strategies.shutdown().await;

        self.set_state(EngineState::Stopped);
        info!(elapsed = ?shutdown_start.elapsed(), "Cache engine shutdown complete");
    }
}
