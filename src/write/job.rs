// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind jobs as they sit on the cluster list.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::now_ms;
use crate::error::CacheError;
use crate::origin::Record;

/// A pending origin write.
///
/// Serialized as JSON so an operator can inspect the queue and the
/// dead-letter list with plain `LRANGE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteJob {
    pub entity_id: String,
    pub payload: Record,
    pub enqueued_at_ms: u64,
    #[serde(default)]
    pub attempt_count: u32,
    /// Not retried before this time. Zero means due immediately.
    #[serde(default)]
    pub next_attempt_at_ms: u64,
    /// Last origin error, kept for dead-letter triage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Per-entity enqueue order. Zero means unsequenced and never superseded.
    #[serde(default)]
    pub sequence: u64,
}

/// Per-entity counter handing out [`WriteJob::sequence`].
pub fn sequence_key(entity_id: &str) -> String {
    format!("wb:seq:{}", entity_id)
}

/// Highest sequence already saved to the origin for an entity.
pub fn saved_sequence_key(entity_id: &str) -> String {
    format!("wb:saved:{}", entity_id)
}

impl WriteJob {
    #[must_use]
    pub fn new(entity_id: impl Into<String>, payload: Record) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload,
            enqueued_at_ms: now_ms(),
            attempt_count: 0,
            next_attempt_at_ms: 0,
            last_error: None,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// True if a save at `saved` already covers this job.
    #[must_use]
    pub fn is_superseded_by(&self, saved: u64) -> bool {
        self.sequence > 0 && self.sequence <= saved
    }

    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at_ms <= now_ms
    }

    /// Record a failed attempt and push the next one out by `delay`.
    pub fn record_failure(&mut self, error: impl ToString, delay: Duration, now_ms: u64) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_attempt_at_ms = now_ms.saturating_add(delay.as_millis() as u64);
        self.last_error = Some(error.to_string());
    }

    /// Time spent in the queue so far.
    #[must_use]
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.enqueued_at_ms))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_is_due() {
        let job = WriteJob::new("42", json!({"name": "a"}));
        assert_eq!(job.attempt_count, 0);
        assert!(job.is_due(now_ms()));
    }

    #[test]
    fn test_record_failure_gates_next_attempt() {
        let mut job = WriteJob::new("42", json!({}));
        job.record_failure("db down", Duration::from_secs(2), 10_000);

        assert_eq!(job.attempt_count, 1);
        assert!(!job.is_due(11_999));
        assert!(job.is_due(12_000));
        assert_eq!(job.last_error.as_deref(), Some("db down"));
    }

    #[test]
    fn test_record_failure_saturates_far_future() {
        let mut job = WriteJob::new("42", json!({}));
        job.record_failure("db down", Duration::from_millis(u64::MAX), u64::MAX - 10);

        assert_eq!(job.next_attempt_at_ms, u64::MAX);
        assert!(!job.is_due(u64::MAX - 1));
    }

    #[test]
    fn test_superseded_only_by_equal_or_newer_save() {
        let job = WriteJob::new("42", json!({})).with_sequence(3);
        assert!(!job.is_superseded_by(0));
        assert!(!job.is_superseded_by(2));
        assert!(job.is_superseded_by(3));
        assert!(job.is_superseded_by(9));

        // Unsequenced jobs always run
        assert!(!WriteJob::new("42", json!({})).is_superseded_by(9));
    }

    #[test]
    fn test_decodes_minimal_legacy_job() {
        let raw = br#"{"entity_id":"7","payload":{"x":1},"enqueued_at_ms":5}"#;
        let job = WriteJob::decode(raw).unwrap();
        assert_eq!(job.entity_id, "7");
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.sequence, 0);
        assert!(job.is_due(0));
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        let err = WriteJob::decode(b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Codec(_)));
    }
}
