// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Token-bucket rate limiting per caller identity.
//!
//! Bucket state lives in the cache cluster so every instance shares it.
//! The refill-then-take step runs atomically on the cluster (a Lua script
//! on Redis), so two instances can never spend the same token.
//!
//! Refill is lazy: `tokens = min(capacity, tokens + elapsed / window * capacity)`.
//! A request is rejected when fewer than one token remains after refill.
//!
//! When the cluster cannot answer, `fail_open` decides: admit the caller
//! (default) or reject with [`CacheError::Unavailable`].

use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::now_ms;
use crate::config::CacheEngineConfig;
use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::metrics;

/// Bucket state for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitBucket {
    pub identity: String,
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl RateLimitBucket {
    /// A bucket that has never been used starts full.
    pub fn full(identity: impl Into<String>, capacity: f64, now_ms: u64) -> Self {
        Self {
            identity: identity.into(),
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Credit tokens for the time since the last refill. Never moves backwards.
    pub fn refill(&mut self, capacity: f64, window: Duration, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let window_ms = window.as_millis().max(1) as f64;
        let elapsed = (now_ms - self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed / window_ms * capacity).min(capacity);
        self.last_refill_ms = now_ms;
    }

    /// Spend one token if available.
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Time until a bucket holding `tokens` has one whole token again.
#[must_use]
pub fn time_until_token(tokens: f64, capacity: f64, window: Duration) -> Duration {
    if tokens >= 1.0 || capacity <= 0.0 {
        return Duration::ZERO;
    }
    window.mul_f64(((1.0 - tokens) / capacity).clamp(0.0, 1.0))
}

pub struct RateLimiter {
    conn: CacheConnection,
    capacity: f64,
    window: Duration,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(conn: CacheConnection, max_tokens: u32, window: Duration, fail_open: bool) -> Self {
        Self {
            conn,
            capacity: f64::from(max_tokens),
            window,
            fail_open,
        }
    }

    pub fn from_config(conn: CacheConnection, config: &CacheEngineConfig) -> Self {
        Self::new(
            conn,
            config.rate_max_tokens,
            config.rate_window(),
            config.rate_limit_fail_open,
        )
    }

    fn key(identity: &str) -> String {
        format!("ratelimit:{}", identity)
    }

    /// True if the caller may proceed. Consumes a token when it does.
    pub async fn allow(&self, identity: &str) -> bool {
        self.check(identity).await.is_ok()
    }

    /// Like [`allow`](Self::allow) but says why a caller was turned away.
    pub async fn check(&self, identity: &str) -> Result<(), CacheError> {
        let key = Self::key(identity);
        match self
            .conn
            .take_token(&key, self.capacity, self.window, now_ms())
            .await
        {
            Ok(grant) if grant.allowed => {
                metrics::record_rate_limit("allowed");
                Ok(())
            }
            Ok(grant) => {
                metrics::record_rate_limit("rejected");
                debug!(identity, remaining = grant.remaining, "Rate limit exceeded");
                Err(CacheError::RateLimited {
                    identity: identity.to_string(),
                    retry_after: time_until_token(grant.remaining, self.capacity, self.window),
                })
            }
            Err(e) if self.fail_open => {
                metrics::record_rate_limit("fail_open");
                warn!(identity, error = %e, "Rate limiter unavailable, admitting request");
                Ok(())
            }
            Err(e) => {
                metrics::record_rate_limit("fail_closed");
                warn!(identity, error = %e, "Rate limiter unavailable, rejecting request");
                Err(e)
            }
        }
    }
}
