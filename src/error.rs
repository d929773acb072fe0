// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy surfaced to the request layer.
//!
//! `NotFound` is not an error: lookups return `Ok(None)`. Lock contention is
//! not an error either: [`crate::lock::DistributedLock::acquire`] returns
//! `Ok(None)`.

use std::time::Duration;

use thiserror::Error;

use crate::backpressure::BackpressureLevel;
use crate::origin::OriginError;
use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Circuit open, transport failure or timeout talking to the cluster.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Caller exhausted its token bucket. Never retried internally.
    #[error("rate limit exceeded for '{identity}'")]
    RateLimited {
        identity: String,
        retry_after: Duration,
    },

    /// The origin failed. Always propagated; the cache is not authoritative.
    #[error(transparent)]
    Origin(#[from] OriginError),

    /// Write-behind queue is past its rejection threshold.
    #[error("write-behind queue full: {depth}/{max} ({level})")]
    QueueFull {
        depth: u64,
        max: u64,
        level: BackpressureLevel,
    },

    /// A record could not be serialized or deserialized.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// True for outcomes that a read path degrades around by going to the origin.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Suggested HTTP status for the request layer.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::Unavailable(_) => 503,
            Self::RateLimited { .. } => 429,
            Self::Origin(_) => 502,
            Self::QueueFull { level, .. } => level.http_status_code().unwrap_or(503),
            Self::Codec(_) | Self::Config(_) => 500,
        }
    }

    /// Suggested Retry-After header value (seconds).
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(retry_after.as_secs().max(1)),
            Self::QueueFull { level, .. } => level.retry_after_secs(),
            _ => None,
        }
    }
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

impl From<CircuitError<StorageError>> for CacheError {
    fn from(err: CircuitError<StorageError>) -> Self {
        match err {
            CircuitError::Rejected => CacheError::Unavailable("circuit breaker open".into()),
            CircuitError::Inner(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Codec(err.to_string())
    }
}
