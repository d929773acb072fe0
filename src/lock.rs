// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-TTL mutual exclusion in the cache cluster.
//!
//! `acquire` is a set-if-not-exists of a random owner token with an expiry;
//! `release` deletes the key only if it still holds that token, so a holder
//! whose lock already expired can never release someone else's.
//!
//! Contention is not an error: `acquire` returns `Ok(None)`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::connection::CacheConnection;
use crate::error::CacheError;
use crate::metrics;

/// Random owner token proving who holds a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    conn: CacheConnection,
}

impl DistributedLock {
    pub fn new(conn: CacheConnection) -> Self {
        Self { conn }
    }

    /// Try once to take `key` for `ttl`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, CacheError> {
        let token = LockToken::generate();
        let acquired = self
            .conn
            .set_if_not_exists(key, token.as_str().as_bytes(), ttl)
            .await?;

        if !acquired {
            metrics::record_lock("contended");
            return Ok(None);
        }

        metrics::record_lock("acquired");
        debug!(key, ttl = ?ttl, "Lock acquired");
        Ok(Some(LockGuard {
            conn: self.conn.clone(),
            key: key.to_string(),
            token,
            ttl,
            acquired_at: Instant::now(),
            released: false,
        }))
    }

    /// Release `key` if it is still held by `token`. A mismatch is a no-op.
    pub async fn release(&self, key: &str, token: &LockToken) -> Result<bool, CacheError> {
        let released = self
            .conn
            .delete_if_equals(key, token.as_str().as_bytes())
            .await?;
        metrics::record_lock(if released { "released" } else { "lost" });
        Ok(released)
    }
}

/// A held lock. Released explicitly with [`LockGuard::release`], or on drop
/// by a best-effort release spawned onto the current runtime.
pub struct LockGuard {
    conn: CacheConnection,
    key: String,
    token: LockToken,
    ttl: Duration,
    acquired_at: Instant,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time left before the lock expires on its own.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }

    /// Returns false if the lock had already expired or changed hands.
    pub async fn release(mut self) -> Result<bool, CacheError> {
        self.released = true;
        let released = self
            .conn
            .delete_if_equals(&self.key, self.token.as_str().as_bytes())
            .await?;
        metrics::record_lock(if released { "released" } else { "lost" });
        if !released {
            debug!(key = %self.key, "Lock expired before release");
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Expiry reclaims it.
            return;
        };
        let conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        handle.spawn(async move {
            match conn.delete_if_equals(&key, token.as_str().as_bytes()).await {
                Ok(released) => metrics::record_lock(if released { "released" } else { "lost" }),
                Err(e) => debug!(key = %key, error = %e, "Release on drop failed, lock will expire"),
            }
        });
    }
}
