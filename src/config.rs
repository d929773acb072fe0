// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache engine.
//!
//! # Example
//!
//! ```
//! use cache_engine::CacheEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheEngineConfig::default();
//! assert_eq!(config.default_ttl_secs, 900);
//! assert_eq!(config.write_behind_queue_key, "wb:queue");
//!
//! // Full config
//! let config = CacheEngineConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     redis_reader_url: Some("redis://localhost:6380".into()),
//!     rate_max_tokens: 50,
//!     rate_limit_fail_open: false,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Loading
//!
//! [`CacheEngineConfig::load`] layers an optional TOML file under
//! `CACHE_ENGINE__*` environment variables, e.g.
//! `CACHE_ENGINE__DEFAULT_TTL_SECS=300`.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::CacheError;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;
use crate::strategy::ReadStrategy;
use crate::write::WriteMode;

/// Configuration for the cache engine.
///
/// All fields have defaults matching a single-region deployment. At minimum,
/// set `redis_url` for production use.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheEngineConfig {
    /// Writer endpoint (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Reader endpoint for entry reads; falls back to the writer
    #[serde(default)]
    pub redis_reader_url: Option<String>,

    /// Prefix applied to every key in the cluster
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Namespace used by the id-based facade calls (`v1:{namespace}:{id}`)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Starting cache version; the cluster counter wins if higher
    #[serde(default = "default_cache_version")]
    pub cache_version: u64,
    #[serde(default = "default_version_counter_key")]
    pub version_counter_key: String,
    /// How often to pick up version bumps made by other instances (0 = never)
    #[serde(default = "default_version_sync_interval_secs")]
    pub version_sync_interval_secs: u64,

    /// Bound on every cache cluster call
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Read settings
    #[serde(default = "default_strategy")]
    pub default_strategy: ReadStrategy,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_stale_grace_secs")]
    pub default_stale_grace_secs: u64,
    /// TTL jitter as a fraction (0.15 = ±15%)
    #[serde(default = "default_jitter_range")]
    pub jitter_range: f64,
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_origin_timeout_ms")]
    pub origin_timeout_ms: u64,

    /// Coalescing locks
    #[serde(default = "default_rebuild_lock_ttl_secs")]
    pub rebuild_lock_ttl_secs: u64,
    #[serde(default = "default_swr_lock_ttl_secs")]
    pub swr_lock_ttl_secs: u64,
    #[serde(default = "default_recompute_lock_ttl_secs")]
    pub recompute_lock_ttl_secs: u64,

    /// Singleflight losers: first poll delay and poll budget
    #[serde(default = "default_singleflight_wait_ms")]
    pub singleflight_wait_ms: u64,
    #[serde(default = "default_singleflight_max_polls")]
    pub singleflight_max_polls: usize,

    /// Background refresher for stale-while-revalidate
    #[serde(default = "default_swr_refresh_queue")]
    pub swr_refresh_queue: usize,
    #[serde(default = "default_swr_refresh_concurrency")]
    pub swr_refresh_concurrency: usize,

    /// Token bucket per caller identity
    #[serde(default = "default_rate_max_tokens")]
    pub rate_max_tokens: u32,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    /// Admit callers when the cluster cannot answer
    #[serde(default = "default_rate_limit_fail_open")]
    pub rate_limit_fail_open: bool,

    /// Circuit breaker around the cluster connection
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_timeout_secs")]
    pub circuit_recovery_timeout_secs: u64,

    /// Write-behind queue
    #[serde(default = "default_write_mode")]
    pub default_write_mode: WriteMode,
    #[serde(default = "default_write_behind_queue_key")]
    pub write_behind_queue_key: String,
    #[serde(default = "default_dead_letter_key")]
    pub dead_letter_key: String,
    #[serde(default = "default_write_behind_max_attempts")]
    pub write_behind_max_attempts: u32,
    /// Maximum queue depth before new jobs are rejected (0 = unbounded)
    #[serde(default = "default_write_behind_max_depth")]
    pub write_behind_max_depth: u64,
    /// Idle poll interval for the worker
    #[serde(default = "default_write_behind_poll_ms")]
    pub write_behind_poll_ms: u64,
    #[serde(default = "default_write_behind_backoff_initial_ms")]
    pub write_behind_backoff_initial_ms: u64,
    #[serde(default = "default_write_behind_backoff_max_ms")]
    pub write_behind_backoff_max_ms: u64,
    /// How long shutdown may spend draining due jobs
    #[serde(default = "default_shutdown_drain_timeout_ms")]
    pub shutdown_drain_timeout_ms: u64,

    /// Dependency tracking
    #[serde(default = "default_dependency_ttl_secs")]
    pub dependency_ttl_secs: u64,
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,
    #[serde(default = "default_max_cascade_keys")]
    pub max_cascade_keys: usize,
}

fn default_namespace() -> String { "record".to_string() }
fn default_cache_version() -> u64 { 1 }
fn default_version_counter_key() -> String { "cache:version".to_string() }
fn default_version_sync_interval_secs() -> u64 { 5 }
fn default_socket_timeout_ms() -> u64 { 5_000 }
fn default_strategy() -> ReadStrategy { ReadStrategy::Singleflight }
fn default_ttl_secs() -> u64 { 900 }
fn default_stale_grace_secs() -> u64 { 30 }
fn default_jitter_range() -> f64 { 0.15 }
fn default_negative_ttl_secs() -> u64 { 30 }
fn default_origin_timeout_ms() -> u64 { 3_000 }
fn default_rebuild_lock_ttl_secs() -> u64 { 5 }
fn default_swr_lock_ttl_secs() -> u64 { 5 }
fn default_recompute_lock_ttl_secs() -> u64 { 10 }
fn default_singleflight_wait_ms() -> u64 { 150 }
fn default_singleflight_max_polls() -> usize { 5 }
fn default_swr_refresh_queue() -> usize { 256 }
fn default_swr_refresh_concurrency() -> usize { 8 }
fn default_rate_max_tokens() -> u32 { 100 }
fn default_rate_window_secs() -> u64 { 60 }
fn default_rate_limit_fail_open() -> bool { true }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_recovery_timeout_secs() -> u64 { 60 }
fn default_write_mode() -> WriteMode { WriteMode::WriteThrough }
fn default_write_behind_queue_key() -> String { "wb:queue".to_string() }
fn default_dead_letter_key() -> String { "wb:dead".to_string() }
fn default_write_behind_max_attempts() -> u32 { 5 }
fn default_write_behind_max_depth() -> u64 { 10_000 }
fn default_write_behind_poll_ms() -> u64 { 100 }
fn default_write_behind_backoff_initial_ms() -> u64 { 1_000 }
fn default_write_behind_backoff_max_ms() -> u64 { 60_000 }
fn default_shutdown_drain_timeout_ms() -> u64 { 2_000 }
fn default_dependency_ttl_secs() -> u64 { 1_200 }
fn default_max_cascade_depth() -> usize { 8 }
fn default_max_cascade_keys() -> usize { 10_000 }

impl Default for CacheEngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_reader_url: None,
            key_prefix: None,
            namespace: default_namespace(),
            cache_version: default_cache_version(),
            version_counter_key: default_version_counter_key(),
            version_sync_interval_secs: default_version_sync_interval_secs(),
            socket_timeout_ms: default_socket_timeout_ms(),
            default_strategy: default_strategy(),
            default_ttl_secs: default_ttl_secs(),
            default_stale_grace_secs: default_stale_grace_secs(),
            jitter_range: default_jitter_range(),
            negative_ttl_secs: default_negative_ttl_secs(),
            origin_timeout_ms: default_origin_timeout_ms(),
            rebuild_lock_ttl_secs: default_rebuild_lock_ttl_secs(),
            swr_lock_ttl_secs: default_swr_lock_ttl_secs(),
            recompute_lock_ttl_secs: default_recompute_lock_ttl_secs(),
            singleflight_wait_ms: default_singleflight_wait_ms(),
            singleflight_max_polls: default_singleflight_max_polls(),
            swr_refresh_queue: default_swr_refresh_queue(),
            swr_refresh_concurrency: default_swr_refresh_concurrency(),
            rate_max_tokens: default_rate_max_tokens(),
            rate_window_secs: default_rate_window_secs(),
            rate_limit_fail_open: default_rate_limit_fail_open(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_timeout_secs: default_circuit_recovery_timeout_secs(),
            default_write_mode: default_write_mode(),
            write_behind_queue_key: default_write_behind_queue_key(),
            dead_letter_key: default_dead_letter_key(),
            write_behind_max_attempts: default_write_behind_max_attempts(),
            write_behind_max_depth: default_write_behind_max_depth(),
            write_behind_poll_ms: default_write_behind_poll_ms(),
            write_behind_backoff_initial_ms: default_write_behind_backoff_initial_ms(),
            write_behind_backoff_max_ms: default_write_behind_backoff_max_ms(),
            shutdown_drain_timeout_ms: default_shutdown_drain_timeout_ms(),
            dependency_ttl_secs: default_dependency_ttl_secs(),
            max_cascade_depth: default_max_cascade_depth(),
            max_cascade_keys: default_max_cascade_keys(),
        }
    }
}

impl CacheEngineConfig {
    /// Load from an optional TOML file, then `CACHE_ENGINE__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, CacheError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("CACHE_ENGINE")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: Self = builder
            .build()
            .map_err(|e| CacheError::Config(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| CacheError::Config(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Reject settings that would break an invariant at runtime.
    pub fn validate(&self) -> Result<(), CacheError> {
        let fail = |msg: &str| Err(CacheError::Config(msg.to_string()));
        if !(0.0..1.0).contains(&self.jitter_range) {
            return fail("jitter_range must be in [0, 1)");
        }
        if self.default_ttl_secs == 0 {
            return fail("default_ttl_secs must be positive");
        }
        if self.negative_ttl_secs == 0 {
            return fail("negative_ttl_secs must be positive");
        }
        if self.rate_max_tokens == 0 || self.rate_window_secs == 0 {
            return fail("rate limiter needs positive max tokens and window");
        }
        if self.circuit_failure_threshold == 0 {
            return fail("circuit_failure_threshold must be positive");
        }
        if self.rebuild_lock_ttl_secs == 0 || self.swr_lock_ttl_secs == 0 || self.recompute_lock_ttl_secs == 0 {
            return fail("lock TTLs must be positive");
        }
        if self.socket_timeout_ms == 0 || self.origin_timeout_ms == 0 {
            return fail("timeouts must be positive");
        }
        if self.write_behind_max_attempts == 0 {
            return fail("write_behind_max_attempts must be positive");
        }
        if self.swr_refresh_queue == 0 || self.swr_refresh_concurrency == 0 {
            return fail("swr refresher needs a positive queue and concurrency");
        }
        if self.write_behind_queue_key == self.dead_letter_key {
            return fail("write-behind queue and dead-letter list must differ");
        }
        Ok(())
    }

    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn default_stale_grace(&self) -> Duration {
        Duration::from_secs(self.default_stale_grace_secs)
    }

    #[must_use]
    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    #[must_use]
    pub fn origin_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_timeout_ms)
    }

    #[must_use]
    pub fn rebuild_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.rebuild_lock_ttl_secs)
    }

    #[must_use]
    pub fn swr_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.swr_lock_ttl_secs)
    }

    #[must_use]
    pub fn recompute_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.recompute_lock_ttl_secs)
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    #[must_use]
    pub fn dependency_ttl(&self) -> Duration {
        Duration::from_secs(self.dependency_ttl_secs)
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_recovery_timeout_secs),
        }
    }

    /// Polling schedule for singleflight losers.
    #[must_use]
    pub fn singleflight_poll(&self) -> RetryConfig {
        RetryConfig::poll(
            Duration::from_millis(self.singleflight_wait_ms),
            self.singleflight_max_polls,
        )
    }

    /// Requeue backoff for failed write-behind jobs.
    #[must_use]
    pub fn write_behind_backoff(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.write_behind_backoff_initial_ms),
            max_delay: Duration::from_millis(self.write_behind_backoff_max_ms),
            max_retries: Some(self.write_behind_max_attempts as usize),
            ..RetryConfig::write_behind()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_mirror_service_settings() {
        let config = CacheEngineConfig::default();
        assert_eq!(config.default_ttl(), Duration::from_secs(900));
        assert_eq!(config.default_stale_grace(), Duration::from_secs(30));
        assert_eq!(config.negative_ttl(), Duration::from_secs(30));
        assert_eq!(config.rebuild_lock_ttl(), Duration::from_secs(5));
        assert_eq!(config.recompute_lock_ttl(), Duration::from_secs(10));
        assert_eq!(config.rate_max_tokens, 100);
        assert_eq!(config.rate_window(), Duration::from_secs(60));
        assert!(config.rate_limit_fail_open);
        assert_eq!(config.circuit_config().failure_threshold, 5);
        assert_eq!(config.dependency_ttl(), Duration::from_secs(1200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        let config = CacheEngineConfig {
            jitter_range: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_shared_queue_keys() {
        let config = CacheEngineConfig {
            dead_letter_key: "wb:queue".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: CacheEngineConfig =
            serde_json::from_str(r#"{"rate_max_tokens": 10, "default_strategy": "swr"}"#).unwrap();
        assert_eq!(config.rate_max_tokens, 10);
        assert_eq!(config.default_strategy, ReadStrategy::StaleWhileRevalidate);
        assert_eq!(config.default_ttl_secs, 900);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("cache-engine-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "namespace = \"user\"\nnegative_ttl_secs = 12\ndefault_write_mode = \"write-behind\"").unwrap();

        let config = CacheEngineConfig::load(path.to_str()).unwrap();
        assert_eq!(config.namespace, "user");
        assert_eq!(config.negative_ttl_secs, 12);
        assert_eq!(config.default_write_mode, WriteMode::WriteBehind);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_behind_backoff_follows_settings() {
        let config = CacheEngineConfig {
            write_behind_backoff_initial_ms: 10,
            write_behind_backoff_max_ms: 40,
            write_behind_max_attempts: 3,
            ..Default::default()
        };
        let backoff = config.write_behind_backoff();
        assert_eq!(backoff.initial_delay, Duration::from_millis(10));
        assert_eq!(backoff.max_delay, Duration::from_millis(40));
        assert_eq!(backoff.max_retries, Some(3));
    }
}
