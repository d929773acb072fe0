// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cache-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get, set, delete, push, pop, ...
//! - `strategy`: cache_aside, singleflight, swr, negative
//! - `status` / `outcome`: success, error, rejected, hit, miss, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION - cache cluster calls
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache cluster call outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "cache_engine_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "cache_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a timeout against the cluster
pub fn record_timeout(operation: &str) {
    counter!(
        "cache_engine_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(healthy: bool) {
    gauge!("cache_engine_backend_healthy").set(if healthy { 1.0 } else { 0.0 });
}

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "cache_engine_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "cache_engine_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// READS - strategy outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a read outcome (hit, miss, stale, negative, bypass)
pub fn record_read(strategy: &str, outcome: &str) {
    counter!(
        "cache_engine_reads_total",
        "strategy" => strategy.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an origin fetch issued by a read strategy
pub fn record_origin_fetch(strategy: &str, status: &str) {
    counter!(
        "cache_engine_origin_fetches_total",
        "strategy" => strategy.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record origin fetch latency
pub fn record_origin_latency(duration: Duration) {
    histogram!("cache_engine_origin_fetch_seconds").record(duration.as_secs_f64());
}

/// Record a cached value that failed to decode
pub fn record_malformed_entry() {
    counter!("cache_engine_malformed_entries_total").increment(1);
}

/// Record how a singleflight loser finished waiting
pub fn record_singleflight_wait(outcome: &str, polls: u32) {
    counter!(
        "cache_engine_singleflight_waits_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("cache_engine_singleflight_polls").record(polls as f64);
}

/// Record a background refresh event (scheduled, coalesced, completed, failed, dropped)
pub fn record_swr_refresh(outcome: &str) {
    counter!(
        "cache_engine_swr_refreshes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITES - write-through / write-behind
// ═══════════════════════════════════════════════════════════════════════════

/// Record a write request
pub fn record_write(mode: &str, status: &str) {
    counter!(
        "cache_engine_writes_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a write-behind job outcome (written, retried, dead_lettered, superseded, malformed)
pub fn record_write_behind_job(outcome: &str) {
    counter!(
        "cache_engine_write_behind_jobs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set write-behind queue depth
pub fn set_write_queue_depth(depth: u64) {
    gauge!("cache_engine_write_queue_depth").set(depth as f64);
}

/// Set backpressure level (0 = Normal, 1 = Elevated, 2 = Critical, 3 = Full)
pub fn set_backpressure_level(level: u8) {
    gauge!("cache_engine_backpressure_level").set(level as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATION - locks, rate limiting, invalidation
// ═══════════════════════════════════════════════════════════════════════════

/// Record a distributed lock event (acquired, contended, released, lost)
pub fn record_lock(outcome: &str) {
    counter!(
        "cache_engine_lock_events_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a rate limiter decision (allowed, rejected, fail_open, fail_closed)
pub fn record_rate_limit(outcome: &str) {
    counter!(
        "cache_engine_rate_limit_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record keys removed by invalidation
pub fn record_invalidation(kind: &str, keys: u64) {
    counter!(
        "cache_engine_invalidations_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(
        "cache_engine_invalidated_keys_total",
        "kind" => kind.to_string()
    )
    .increment(keys);
}

/// Set the active cache version
pub fn set_cache_version(version: u64) {
    gauge!("cache_engine_cache_version").set(version as f64);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "cache_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}
