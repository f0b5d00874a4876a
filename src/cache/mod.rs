//! In-memory key/value cache with per-entry expiry and a bounded size.
//!
//! The HTTP dispatch path uses a [`TtlCache<Response>`](crate::http::Response)
//! keyed by `METHOD:path`. Entries expire after their TTL; an expired entry is
//! removed lazily when it is read, or eagerly by [`TtlCache::evict`]. When the
//! cache is full, [`TtlCache::set`] first evicts expired entries and then, if
//! needed, the oldest surviving insertion.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default lifetime for entries stored without an explicit TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default number of entries before eviction kicks in.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
    // Insertion order, used to pick the oldest entry.
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    next_seq: u64,
}

/// A thread-safe TTL cache.
///
/// ```
/// use std::time::Duration;
/// use socketry::cache::TtlCache;
///
/// let cache = TtlCache::new(2, Duration::from_secs(60));
/// cache.set("a", 1, None);
/// cache.set("b", 2, None);
/// cache.set("c", 3, None); // full: the oldest entry ("a") goes
///
/// assert_eq!(cache.get("a"), None);
/// assert_eq!(cache.get("c"), Some(3));
/// assert_eq!(cache.size(), 2);
/// ```
#[derive(Debug)]
pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity,
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a clone of the live value for `key`.
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let expired = inner.entries.get(key)?.is_expired(Instant::now());
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Stores `value` for `ttl` (or the default TTL), evicting first when full.
    ///
    /// Overwriting an existing key keeps its original insertion position.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        let mut inner = self.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            self.evict_locked(&mut inner);
        }

        let seq = match inner.entries.get(&key) {
            Some(existing) => existing.seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    /// Replaces the value of an existing entry and resets its TTL to the default.
    /// Returns `false` (and stores nothing) when the key is absent.
    pub fn update(&self, key: &str, value: V) -> bool {
        let expires_at = Instant::now() + self.default_ttl;
        match self.lock().entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Whether an entry is stored for `key`, expired or not.
    pub fn exists(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Removes every expired entry, then the oldest one if still full.
    pub fn evict(&self) {
        let mut inner = self.lock();
        self.evict_locked(&mut inner);
    }

    fn evict_locked(&self, inner: &mut Inner<V>) {
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before - inner.entries.len();

        if inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                inner.entries.remove(&key);
                tracing::trace!(%key, "evicted oldest cache entry");
            }
        }
        if expired > 0 {
            tracing::trace!(expired, "evicted expired cache entries");
        }
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
