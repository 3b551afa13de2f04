use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::{DedupeKey, RawResponse, time};

#[derive(Debug, Clone)]
struct CacheEntry {
    response: RawResponse,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Successful responses keyed by [`DedupeKey`], each with its own TTL.
///
/// Expired entries are never returned. When the store is full, expired
/// entries are purged first, then the entry closest to expiry is evicted.
#[derive(Debug)]
pub struct CacheStore {
    entries: DashMap<DedupeKey, CacheEntry>,
    max_entries: usize,
}

impl CacheStore {
    /// Create a store holding at most `max_entries` responses.
    /// A limit of zero disables caching.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Get a fresh response for `key`, dropping it if it has expired
    #[must_use]
    pub fn get(&self, key: &DedupeKey) -> Option<RawResponse> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key)
            && !entry.is_expired(now)
        {
            return Some(entry.response.clone());
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store a response for `ttl`. A zero TTL stores nothing.
    pub fn put(&self, key: DedupeKey, response: RawResponse, ttl: Duration) {
        if ttl.is_zero() || self.max_entries == 0 {
            return;
        }

        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room(now);
        }

        self.entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: time::after(now, ttl),
            },
        );
    }

    /// Remove the entry for `key`
    pub fn invalidate(&self, key: &DedupeKey) {
        self.entries.remove(key);
    }

    /// Number of stored entries, including ones that expired but were not
    /// looked up since
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
        if self.entries.len() < self.max_entries {
            return;
        }

        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = soonest {
            log::trace!("Evicting cached response for {key}");
            self.entries.remove(&key);
        }
    }
}
