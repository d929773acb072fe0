// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache engine facade.

use serde::Serialize;

use crate::origin::Record;
use crate::resilience::circuit_breaker::CircuitHealth;
use crate::write::WriteOutcome;

/// Engine lifecycle state.
///
/// Use [`super::CacheEngine::state()`] to check the current state or
/// [`super::CacheEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Built, background tasks not running. Reads and writes already work.
    Created,
    /// Write-behind worker, version sync and refresher active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Background tasks stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot returned by [`super::CacheEngine::stats()`].
///
/// Fields that need the cluster are `None` when it cannot answer.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// The cluster answered a ping
    pub reachable: bool,
    pub circuit: CircuitHealth,
    pub key_count: Option<u64>,
    pub memory_used_bytes: Option<u64>,
    pub write_queue_depth: Option<u64>,
    pub dead_letters: Option<u64>,
    /// Write-behind jobs held in memory until the cluster takes them back
    pub stranded_writes: usize,
    pub cache_version: u64,
    pub state: EngineState,
}

/// Result of [`super::CacheEngine::recompute()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeOutcome<T> {
    Completed(T),
    /// Another instance holds the recompute lock
    AlreadyRunning,
}

impl<T> RecomputeOutcome<T> {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Result of [`super::CacheEngine::patch()`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    /// The merged record as written
    pub record: Record,
    pub write: WriteOutcome,
}
