//! Sharded Storage Engine
//!
//! The engine is the collaborator commands execute against. Keys are spread
//! over a fixed number of shards, each an independent `RwLock<HashMap>`, so
//! workers touching different keys rarely contend.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐            │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │            │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │            │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │            │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Expired keys are removed lazily on access and actively by the
//! [`ExpirySweeper`](crate::storage::ExpirySweeper).

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of shards. 64 keeps contention low without much memory overhead.
const NUM_SHARDS: usize = 64;

/// Faults reported by storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("value is not an integer or out of range")]
    NotInteger,

    #[error("increment or decrement would overflow")]
    Overflow,
}

/// Condition attached to a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    /// Only when the key does not exist (NX)
    IfAbsent,
    /// Only when the key already exists (XX)
    IfPresent,
}

/// Deadline for a TTL starting at `now`. A deadline past what `Instant` can
/// represent means the key never expires.
#[inline]
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

type Shard = RwLock<HashMap<Bytes, Entry>>;

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: u64,
    pub expired: u64,
}

/// Thread-safe key-value store with TTL support.
///
/// # Example
///
/// ```
/// use sparkkv::storage::{SetCondition, StorageEngine};
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"), None, SetCondition::Always);
/// assert_eq!(engine.get(b"name"), Some(Bytes::from("Ariz")));
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,
    key_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("keys", &self.key_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            key_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Writes `value` under `key` if `condition` holds.
    ///
    /// A `ttl` of `None` clears any previous expiry. Returns true when written.
    pub fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> bool {
        let now = Instant::now();
        let mut data = self.shard(&key).write();

        let live = data.get(&key).is_some_and(|e| !e.is_expired(now));
        let allowed = match condition {
            SetCondition::Always => true,
            SetCondition::IfAbsent => !live,
            SetCondition::IfPresent => live,
        };
        if !allowed {
            return false;
        }

        let entry = Entry {
            value,
            expires_at: ttl.and_then(|d| deadline(now, d)),
        };
        if data.insert(key, entry).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Returns the value of `key` unless missing or expired.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = Instant::now();
        {
            let data = self.shard(key).read();
            match data.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.remove_if_expired(key, now);
        None
    }

    /// Deletes each key; returns how many existed.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        let now = Instant::now();
        keys.iter()
            .filter(|key| match self.shard(key).write().remove(&key[..]) {
                Some(entry) => {
                    self.key_count.fetch_sub(1, Ordering::Relaxed);
                    !entry.is_expired(now)
                }
                None => false,
            })
            .count() as u64
    }

    /// Counts how many of `keys` exist. Duplicates count once per occurrence.
    pub fn exists_many(&self, keys: &[Bytes]) -> u64 {
        let now = Instant::now();
        keys.iter()
            .filter(|key| {
                self.shard(key)
                    .read()
                    .get(&key[..])
                    .is_some_and(|e| !e.is_expired(now))
            })
            .count() as u64
    }

    /// Adds `delta` to the integer stored at `key`, treating a missing key as 0.
    ///
    /// The existing expiry is kept.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StorageError> {
        let now = Instant::now();
        let mut data = self.shard(key).write();

        let (current, expires_at) = match data.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let n = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(StorageError::NotInteger)?;
                (n, entry.expires_at)
            }
            _ => (0, None),
        };

        let updated = current.checked_add(delta).ok_or(StorageError::Overflow)?;
        let entry = Entry {
            value: Bytes::from(updated.to_string()),
            expires_at,
        };
        if data.insert(Bytes::copy_from_slice(key), entry).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(updated)
    }

    /// Appends `value` to the string at `key`; returns the new length.
    pub fn append(&self, key: &[u8], value: &[u8]) -> usize {
        let now = Instant::now();
        let mut data = self.shard(key).write();

        match data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                let mut joined = BytesMut::with_capacity(entry.value.len() + value.len());
                joined.extend_from_slice(&entry.value);
                joined.extend_from_slice(value);
                entry.value = joined.freeze();
                entry.value.len()
            }
            _ => {
                let entry = Entry {
                    value: Bytes::copy_from_slice(value),
                    expires_at: None,
                };
                if data.insert(Bytes::copy_from_slice(key), entry).is_none() {
                    self.key_count.fetch_add(1, Ordering::Relaxed);
                }
                value.len()
            }
        }
    }

    pub fn strlen(&self, key: &[u8]) -> usize {
        self.get(key).map_or(0, |v| v.len())
    }

    /// Sets a TTL on an existing key. Returns false if the key is missing.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let now = Instant::now();
        let mut data = self.shard(key).write();
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = deadline(now, ttl);
                true
            }
            _ => false,
        }
    }

    /// Remaining TTL in seconds: `None` if missing, `Some(-1)` if persistent.
    pub fn ttl(&self, key: &[u8]) -> Option<i64> {
        let now = Instant::now();
        let data = self.shard(key).read();
        let entry = data.get(key).filter(|e| !e.is_expired(now))?;
        Some(match entry.expires_at {
            Some(exp) => exp.saturating_duration_since(now).as_secs() as i64,
            None => -1,
        })
    }

    /// Returns all live keys matching a glob pattern (`*`, `?`, `[...]`, `\`).
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let now = Instant::now();
        let mut out = Vec::new();
        for shard in &self.shards {
            let data = shard.read();
            out.extend(
                data.iter()
                    .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
                    .map(|(key, _)| key.clone()),
            );
        }
        out
    }

    pub fn flush(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
        self.key_count.store(0, Ordering::Relaxed);
    }

    /// Approximate key count (expired-but-unswept keys included).
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes every expired key; returns how many were removed.
    pub fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut data = shard.write();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired(now));
            removed += (before - data.len()) as u64;
        }
        if removed > 0 {
            self.key_count.fetch_sub(removed, Ordering::Relaxed);
            self.expired_count.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    fn remove_if_expired(&self, key: &[u8], now: Instant) {
        let mut data = self.shard(key).write();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Byte-wise glob matching as used by `KEYS`.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let Some((&first, rest)) = pattern.split_first() else {
        return text.is_empty();
    };

    match first {
        b'*' => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        b'?' => !text.is_empty() && glob_match(rest, &text[1..]),
        b'[' => {
            let Some((&c, text_rest)) = text.split_first() else {
                return false;
            };
            let negate = rest.first() == Some(&b'^');
            let mut i = usize::from(negate);
            let mut matched = false;
            while i < rest.len() && rest[i] != b']' {
                if i + 2 < rest.len() && rest[i + 1] == b'-' && rest[i + 2] != b']' {
                    matched |= (rest[i]..=rest[i + 2]).contains(&c);
                    i += 3;
                } else {
                    matched |= rest[i] == c;
                    i += 1;
                }
            }
            // Unterminated class never matches.
            i < rest.len() && matched != negate && glob_match(&rest[i + 1..], text_rest)
        }
        b'\\' if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        c => text.first() == Some(&c) && glob_match(rest, &text[1..]),
    }
}
