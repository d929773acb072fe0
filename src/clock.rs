// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Monotonic wall-clock timestamps.
//!
//! Entry timestamps (`stored_at`, `stale_at`) and rate-limit refills are
//! compared across instances, so they are epoch milliseconds. They are read
//! through a single anchor pairing `SystemTime` with `tokio::time::Instant`:
//! the value never goes backwards within a process and follows tokio's
//! paused clock under `#[tokio::test(start_paused = true)]`.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct Anchor {
    wall_ms: u64,
    instant: std::time::Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| {
        let now = std::time::Instant::now();
        // Backdate so runtimes created before the first call still read forward.
        let backdate = [Duration::from_secs(3600), Duration::from_secs(60)]
            .into_iter()
            .find_map(|d| now.checked_sub(d).map(|instant| (instant, d)));
        let (instant, backdate) = backdate.unwrap_or((now, Duration::ZERO));
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_sub(backdate)
            .as_millis() as u64;
        Anchor { wall_ms, instant }
    })
}

/// Current time as epoch milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    let anchor = anchor();
    let elapsed = tokio::time::Instant::now()
        .into_std()
        .saturating_duration_since(anchor.instant);
    anchor.wall_ms + elapsed.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_close_to_system_time() {
        let system = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let ours = now_ms();
        assert!(ours.abs_diff(system) < 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_paused_clock() {
        let before = now_ms();
        tokio::time::advance(Duration::from_secs(10)).await;
        let after = now_ms();
        assert!(after - before >= 10_000);
    }
}
