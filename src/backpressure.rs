// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure for the write-behind queue.
//!
//! The queue lives in the cache cluster and is drained by a single worker,
//! so its depth is the signal: once it is close to the configured maximum,
//! new write-behind jobs are rejected with an explicit error instead of
//! growing without bound.
//!
//! # Example
//!
//! ```
//! use cache_engine::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_depth(50, 100);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_accept_writes());
//!
//! let level = BackpressureLevel::from_depth(80, 100);
//! assert_eq!(level, BackpressureLevel::Elevated);
//! assert!(level.should_accept_writes());
//!
//! let level = BackpressureLevel::from_depth(95, 100);
//! assert_eq!(level, BackpressureLevel::Critical);
//! assert!(!level.should_accept_writes());
//! ```

/// Queue pressure level.
///
/// - **Normal** (< 70%): accept all jobs
/// - **Elevated** (70-90%): accept, emit warnings
/// - **Critical** (90-100%): reject new jobs (HTTP 503)
/// - **Full** (>= 100%): reject new jobs, queue at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Elevated = 1,
    Critical = 2,
    Full = 3,
}

impl BackpressureLevel {
    /// Level from a fill ratio (0.0 → 1.0+).
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.90 => Self::Elevated,
            p if p < 1.0 => Self::Critical,
            _ => Self::Full,
        }
    }

    /// Level from a queue depth against its maximum. A zero maximum disables the check.
    #[must_use]
    pub fn from_depth(depth: u64, max: u64) -> Self {
        if max == 0 {
            return Self::Normal;
        }
        Self::from_pressure(depth as f64 / max as f64)
    }

    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        matches!(self, Self::Normal | Self::Elevated)
    }

    /// Suggested HTTP status code for this level
    #[must_use]
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            Self::Normal | Self::Elevated => None,
            Self::Critical | Self::Full => Some(503),
        }
    }

    /// Suggested Retry-After header value (seconds)
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Critical => Some(5),
            Self::Full => Some(30),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Elevated => "Elevated - queue filling up",
            Self::Critical => "Critical - write-behind jobs rejected",
            Self::Full => "Full - queue at capacity",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
