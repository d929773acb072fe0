// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entries, their wire framing, and versioned keys.
//!
//! # Wire format
//!
//! ```text
//! CE1\n
//! {"stored_at_ms":1767084657058,"ttl_ms":900000,"kind":"swr","stale_at_ms":1767084687058}\n
//! <raw value bytes>
//! ```
//!
//! The header is a single JSON line; the value follows verbatim. Anything
//! that does not start with the magic line (a legacy plain-JSON value, a
//! truncated write, another application's key) fails to decode and is
//! treated by every read path as a miss.
//!
//! # Keys
//!
//! Entry keys are `v{version}:{namespace}:{id}`. Bumping the version makes
//! every older key unreachable; the old keys age out through their TTLs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::now_ms;
use crate::error::CacheError;
use crate::resilience::retry::apply_jitter;

/// Leading line of every framed entry.
pub const ENTRY_MAGIC: &[u8] = b"CE1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Plain cached value
    Normal,
    /// Origin reported NotFound; the value is empty
    Negative,
    /// Value with a stale-while-revalidate grace window
    Swr,
}

/// Where an entry sits on its lifetime at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `expires_at`
    Fresh,
    /// SWR only: past `expires_at` but before `stale_at`
    Stale,
    /// Past every window
    Expired,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing entry magic")]
    MissingMagic,
    #[error("missing header terminator")]
    MissingHeader,
    #[error("invalid header: {0}")]
    Header(String),
    #[error("inconsistent entry: {0}")]
    Inconsistent(&'static str),
}

#[derive(Serialize, Deserialize)]
struct Header {
    stored_at_ms: u64,
    ttl_ms: u64,
    kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stale_at_ms: Option<u64>,
}

/// A value as it lives in the cache cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub stored_at_ms: u64,
    pub ttl: Duration,
    pub kind: EntryKind,
    /// Set for SWR entries, always `>= expires_at_ms()`
    pub stale_at_ms: Option<u64>,
}

impl CacheEntry {
    #[must_use]
    pub fn normal(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            stored_at_ms: now_ms(),
            ttl,
            kind: EntryKind::Normal,
            stale_at_ms: None,
        }
    }

    #[must_use]
    pub fn negative(ttl: Duration) -> Self {
        Self {
            value: Vec::new(),
            stored_at_ms: now_ms(),
            ttl,
            kind: EntryKind::Negative,
            stale_at_ms: None,
        }
    }

    /// Fresh for `ttl`, then servable-while-refreshing for `stale_grace`.
    #[must_use]
    pub fn swr(value: Vec<u8>, ttl: Duration, stale_grace: Duration) -> Self {
        let stored_at_ms = now_ms();
        let stale_at_ms = stored_at_ms
            .saturating_add(ttl.as_millis() as u64)
            .saturating_add(stale_grace.as_millis() as u64);
        Self {
            value,
            stored_at_ms,
            ttl,
            kind: EntryKind::Swr,
            stale_at_ms: Some(stale_at_ms),
        }
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.stored_at_ms.saturating_add(self.ttl.as_millis() as u64)
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.kind == EntryKind::Negative
    }

    #[must_use]
    pub fn freshness(&self, now_ms: u64) -> Freshness {
        if now_ms < self.expires_at_ms() {
            return Freshness::Fresh;
        }
        match (self.kind, self.stale_at_ms) {
            (EntryKind::Swr, Some(stale_at)) if now_ms < stale_at => Freshness::Stale,
            _ => Freshness::Expired,
        }
    }

    /// How long the key should physically live in the cluster.
    #[must_use]
    pub fn physical_ttl(&self) -> Duration {
        match self.stale_at_ms {
            Some(stale_at) => Duration::from_millis(stale_at.saturating_sub(self.stored_at_ms)),
            None => self.ttl,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let header = Header {
            stored_at_ms: self.stored_at_ms,
            ttl_ms: self.ttl.as_millis() as u64,
            kind: self.kind,
            stale_at_ms: self.stale_at_ms,
        };
        let header = serde_json::to_vec(&header)?;
        let mut out = Vec::with_capacity(ENTRY_MAGIC.len() + header.len() + 1 + self.value.len());
        out.extend_from_slice(ENTRY_MAGIC);
        out.extend_from_slice(&header);
        out.push(b'\n');
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let rest = bytes
            .strip_prefix(ENTRY_MAGIC)
            .ok_or(DecodeError::MissingMagic)?;
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(DecodeError::MissingHeader)?;
        let header: Header = serde_json::from_slice(&rest[..newline])
            .map_err(|e| DecodeError::Header(e.to_string()))?;
        let value = rest[newline + 1..].to_vec();

        let entry = Self {
            value,
            stored_at_ms: header.stored_at_ms,
            ttl: Duration::from_millis(header.ttl_ms),
            kind: header.kind,
            stale_at_ms: header.stale_at_ms,
        };

        match (entry.kind, entry.stale_at_ms) {
            (EntryKind::Swr, None) => return Err(DecodeError::Inconsistent("swr entry without stale_at")),
            (EntryKind::Swr, Some(stale_at)) if stale_at < entry.expires_at_ms() => {
                return Err(DecodeError::Inconsistent("stale_at before expires_at"));
            }
            (EntryKind::Negative, _) if !entry.value.is_empty() => {
                return Err(DecodeError::Inconsistent("negative entry with a value"));
            }
            _ => {}
        }
        Ok(entry)
    }
}

/// `ttl` spread by `±range`, never below one millisecond.
#[must_use]
pub fn jittered_ttl(ttl: Duration, range: f64) -> Duration {
    apply_jitter(ttl, range).max(Duration::from_millis(1))
}

/// Set holding the keys that depend on `parent`.
#[must_use]
pub fn dependency_key(parent: &str) -> String {
    format!("deps:{}", parent)
}

/// Logical identity of a cached record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub version: u64,
    pub namespace: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(version: u64, namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            version,
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}:{}", self.version, self.namespace, self.id)
    }
}

/// Renders keys under the current cache version.
///
/// The version only moves forward. It is bumped locally by
/// [`crate::invalidation::InvalidationManager::bump_version`] and raised to
/// the cluster's counter by `sync_version`.
#[derive(Debug)]
pub struct KeySpace {
    version: AtomicU64,
    version_counter_key: String,
}

impl KeySpace {
    pub fn new(initial_version: u64, version_counter_key: impl Into<String>) -> Self {
        Self {
            version: AtomicU64::new(initial_version.max(1)),
            version_counter_key: version_counter_key.into(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Raise the version to `version`; lower values are ignored. Returns the active version.
    pub fn advance_to(&self, version: u64) -> u64 {
        let previous = self.version.fetch_max(version, Ordering::AcqRel);
        previous.max(version)
    }

    #[must_use]
    pub fn version_counter_key(&self) -> &str {
        &self.version_counter_key
    }

    #[must_use]
    pub fn key(&self, namespace: &str, id: &str) -> CacheKey {
        CacheKey::new(self.version(), namespace, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_preserves_entry() {
        let entry = CacheEntry::swr(b"{\"id\":\"1\"}".to_vec(), Duration::from_secs(900), Duration::from_secs(30));
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_value_may_contain_newlines() {
        let entry = CacheEntry::normal(b"line1\nline2\n".to_vec(), Duration::from_secs(1));
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded.value, b"line1\nline2\n");
    }

    #[test]
    fn test_legacy_json_is_malformed() {
        let err = CacheEntry::decode(br#"{"id":"1","name":"Ada"}"#).unwrap_err();
        assert_eq!(err, DecodeError::MissingMagic);
        assert_eq!(CacheEntry::decode(b"__nil__").unwrap_err(), DecodeError::MissingMagic);
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        assert_eq!(
            CacheEntry::decode(b"CE1\n{\"stored_at_ms\":1").unwrap_err(),
            DecodeError::MissingHeader
        );
        assert!(matches!(
            CacheEntry::decode(b"CE1\n{not json}\nvalue").unwrap_err(),
            DecodeError::Header(_)
        ));
    }

    #[test]
    fn test_swr_stale_before_expiry_is_rejected() {
        let raw = b"CE1\n{\"stored_at_ms\":1000,\"ttl_ms\":500,\"kind\":\"swr\",\"stale_at_ms\":1200}\nx";
        assert!(matches!(
            CacheEntry::decode(raw).unwrap_err(),
            DecodeError::Inconsistent(_)
        ));
    }

    #[test]
    fn test_freshness_windows() {
        let entry = CacheEntry {
            value: b"x".to_vec(),
            stored_at_ms: 1_000,
            ttl: Duration::from_millis(500),
            kind: EntryKind::Swr,
            stale_at_ms: Some(2_000),
        };
        assert_eq!(entry.freshness(1_499), Freshness::Fresh);
        assert_eq!(entry.freshness(1_500), Freshness::Stale);
        assert_eq!(entry.freshness(1_999), Freshness::Stale);
        assert_eq!(entry.freshness(2_000), Freshness::Expired);
        assert_eq!(entry.physical_ttl(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_normal_entry_never_stale() {
        let entry = CacheEntry {
            value: b"x".to_vec(),
            stored_at_ms: 1_000,
            ttl: Duration::from_millis(500),
            kind: EntryKind::Normal,
            stale_at_ms: None,
        };
        assert_eq!(entry.freshness(1_500), Freshness::Expired);
        assert_eq!(entry.physical_ttl(), Duration::from_millis(500));
    }

    #[test]
    fn test_swr_with_huge_ttl_saturates() {
        let entry = CacheEntry::swr(b"x".to_vec(), Duration::from_millis(u64::MAX), Duration::from_secs(30));
        assert_eq!(entry.stale_at_ms, Some(u64::MAX));
        assert_eq!(entry.freshness(entry.stored_at_ms), Freshness::Fresh);
    }

    #[test]
    fn test_negative_entry_is_empty() {
        let entry = CacheEntry::negative(Duration::from_secs(30));
        assert!(entry.is_negative());
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert!(decoded.is_negative());
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn test_key_rendering() {
        assert_eq!(CacheKey::new(1, "user", "1").render(), "v1:user:1");
        assert_eq!(dependency_key("v1:user:1"), "deps:v1:user:1");
    }

    #[test]
    fn test_keyspace_version_only_moves_forward() {
        let keys = KeySpace::new(1, "cache:version");
        assert_eq!(keys.key("user", "1").render(), "v1:user:1");

        assert_eq!(keys.advance_to(3), 3);
        assert_eq!(keys.advance_to(2), 3);
        assert_eq!(keys.key("user", "1").render(), "v3:user:1");
    }

    #[test]
    fn test_jittered_ttl_bounds() {
        let ttl = Duration::from_secs(900);
        for _ in 0..100 {
            let j = jittered_ttl(ttl, 0.15);
            assert!(j >= Duration::from_secs(764) && j <= Duration::from_secs(1036));
        }
        assert_eq!(jittered_ttl(Duration::ZERO, 0.15), Duration::from_millis(1));
    }
}
