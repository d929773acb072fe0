// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Cache Engine
//!
//! Caching middleware between request handlers, a shared Redis cluster and a
//! slower origin store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CacheEngine facade                      │
//! │  • get / get_many / set / patch / invalidate / recompute   │
//! │  • Per-identity token buckets (RateLimiter)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                    ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │  Read strategies │ │ WriteCoordinator │ │   Invalidation   │
//! │  • cache-aside   │ │ • write-through  │ │ • dependency sets│
//! │  • singleflight  │ │ • write-behind   │ │ • bounded cascade│
//! │  • swr           │ │   queue + worker │ │ • version bumps  │
//! │  • negative      │ │ • dead letters   │ │                  │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!          │                   │                    │
//!          └───────────────────┼────────────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CacheConnection                        │
//! │  • Circuit breaker (closed → open → half-open)             │
//! │  • Socket timeout on every call                            │
//! │  • DistributedLock on top (token-checked release)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CacheStore: RedisStore | InMemoryStore         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! When the cluster is unreachable every read falls back to the origin, the
//! rate limiter admits (unless configured to fail closed) and writes that need
//! the cluster to be durable are refused.
//!
//! ## Quick Start
//!
//! ```rust
//! use cache_engine::{BackpressureLevel, CacheEngineConfig, RetryConfig};
//! use std::time::Duration;
//!
//! let config = CacheEngineConfig::default();
//! assert!(config.validate().is_ok());
//!
//! // Write-behind refuses new jobs once the queue is 90% full
//! let level = BackpressureLevel::from_depth(9_500, config.write_behind_max_depth);
//! assert!(!level.should_accept_writes());
//!
//! let retry = RetryConfig::write_behind();
//! assert!(retry.delay_for_attempt(10) <= Duration::from_secs(66));
//! ```
//!
//! See [`coordinator`] for a full engine example.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`CacheEngine`] facade and its lifecycle
//! - [`strategy`]: Read strategies behind the [`strategy::ReadPolicy`] trait
//! - [`write`]: Write-through and write-behind paths
//! - [`invalidation`]: Dependency cascades and cache versioning
//! - [`connection`]: Breaker-guarded cluster access
//! - [`resilience`]: Circuit breaker and retry/backoff
//! - [`storage`]: Redis and in-memory backends

pub mod backpressure;
pub mod cache_entry;
pub mod clock;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod invalidation;
pub mod lock;
pub mod metrics;
pub mod origin;
pub mod rate_limiter;
pub mod resilience;
pub mod storage;
pub mod strategy;
pub mod write;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use backpressure::BackpressureLevel;
pub use cache_entry::{CacheEntry, Freshness};
pub use config::CacheEngineConfig;
pub use coordinator::{CacheEngine, CacheStats, EngineState, PatchOutcome, RecomputeOutcome};
pub use error::CacheError;
pub use invalidation::{InvalidationManager, InvalidationReport};
pub use lock::{DistributedLock, LockGuard};
pub use origin::{InMemoryOrigin, OriginError, OriginStore, Record};
pub use rate_limiter::RateLimiter;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use resilience::retry::RetryConfig;
pub use storage::memory::InMemoryStore;
pub use storage::redis::RedisStore;
pub use storage::traits::{CacheStore, StorageError};
pub use strategy::{ReadOptions, ReadStrategy};
pub use write::{WriteMode, WriteOutcome};
