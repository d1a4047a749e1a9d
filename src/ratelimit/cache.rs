//! Bounded, idle-expiring cache of per-client token buckets.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::{Quota, TokenBucket};
use super::key::ClientKey;

/// Default number of independently locked shards.
pub const DEFAULT_SHARDS: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(v) => v,
    None => unreachable!(),
};

/// A cached limiter and its access bookkeeping.
struct CacheEntry {
    limiter: Arc<TokenBucket>,
    last_access: Instant,
    /// Cache-wide access sequence number, used to find the LRU entry
    last_used: u64,
    /// Per-entry TTL, overriding the cache default
    ttl: Option<Duration>,
}

impl CacheEntry {
    fn is_expired(&self, default_ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > self.ttl.unwrap_or(default_ttl)
    }
}

type Shard = Mutex<LruCache<ClientKey, CacheEntry>>;

/// Maps client keys to their token buckets.
///
/// The cache holds at most `max_keys` limiters. Keys are spread over shards by
/// hash; each shard is an unbounded LRU behind its own mutex, so lookups for
/// unrelated clients rarely contend. Only inserting a new key into a full
/// cache evicts, and the victim is the least-recently-used entry across all
/// shards.
///
/// Lookups of existing keys take only their shard's lock. Creating a limiter
/// also takes a cache-wide insert lock and re-checks the key under it, so
/// concurrent first requests for an unseen key share one limiter and the
/// size bound holds at every instant.
pub struct LimiterCache {
    shards: Box<[Shard]>,
    hasher: RandomState,
    insert_lock: Mutex<()>,
    len: AtomicUsize,
    clock: AtomicU64,
    ttl: Duration,
    max_keys: NonZeroUsize,
}

impl LimiterCache {
    /// Create a cache with the default shard count.
    pub fn new(max_keys: NonZeroUsize, ttl: Duration) -> Self {
        Self::with_shards(max_keys, ttl, DEFAULT_SHARDS)
    }

    /// Create a cache split into `shards` partitions.
    pub fn with_shards(max_keys: NonZeroUsize, ttl: Duration, shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();

        Self {
            shards,
            hasher: RandomState::new(),
            insert_lock: Mutex::new(()),
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            ttl,
            max_keys,
        }
    }

    /// Return the limiter for `key`, creating a full one from `quota` if the
    /// key is absent or expired.
    ///
    /// An existing limiter is returned unchanged; `quota` only applies on
    /// creation.
    pub fn get_or_create(&self, key: &ClientKey, quota: &Quota) -> Arc<TokenBucket> {
        self.get_or_create_at(key, quota, None, Instant::now())
    }

    /// Like [`get_or_create`](Self::get_or_create), giving a newly created
    /// entry its own idle TTL instead of the cache default.
    pub fn get_or_create_with_ttl(
        &self,
        key: &ClientKey,
        quota: &Quota,
        ttl: Option<Duration>,
    ) -> Arc<TokenBucket> {
        self.get_or_create_at(key, quota, ttl, Instant::now())
    }

    pub(crate) fn get_or_create_at(
        &self,
        key: &ClientKey,
        quota: &Quota,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Arc<TokenBucket> {
        if let Some(limiter) = self.get_at(key, now) {
            return limiter;
        }

        let _insert = self.insert_lock.lock();

        // Another caller may have created it while we waited
        if let Some(limiter) = self.get_at(key, now) {
            return limiter;
        }

        while self.len.load(Ordering::Relaxed) >= self.max_keys.get() {
            if !self.evict_lru() {
                break;
            }
        }

        debug!(
            key = %key,
            rate = quota.rate(),
            burst = quota.burst(),
            "Creating new limiter"
        );
        let limiter = Arc::new(TokenBucket::new_at(quota, now));

        let mut shard = self.shard_for(key).lock();
        let entry = CacheEntry {
            limiter: Arc::clone(&limiter),
            last_access: now,
            last_used: self.tick(),
            ttl,
        };
        if shard.put(key.clone(), entry).is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }

        limiter
    }

    /// Look up the limiter for `key` without creating one.
    ///
    /// Expired entries are purged and reported as absent.
    pub fn get(&self, key: &ClientKey) -> Option<Arc<TokenBucket>> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &ClientKey, now: Instant) -> Option<Arc<TokenBucket>> {
        let mut shard = self.shard_for(key).lock();

        let expired = match shard.get_mut(key) {
            Some(entry) if !entry.is_expired(self.ttl, now) => {
                entry.last_access = now;
                entry.last_used = self.tick();
                return Some(Arc::clone(&entry.limiter));
            }
            Some(_) => true,
            None => false,
        };

        if expired && shard.pop(key).is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            trace!(key = %key, "Limiter expired, resetting");
        }
        None
    }

    /// Remove the limiter for `key`. Returns whether an entry was present.
    pub fn remove(&self, key: &ClientKey) -> bool {
        let removed = self.shard_for(key).lock().pop(key).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every expired entry. Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let mut purged = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let expired: Vec<ClientKey> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(self.ttl, now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in &expired {
                shard.pop(key);
            }
            self.len.fetch_sub(expired.len(), Ordering::Relaxed);
            purged += expired.len();
        }

        if purged > 0 {
            trace!(purged, "Purged expired limiters");
        }
        purged
    }

    /// Get the number of cached limiters, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the cache holds no limiters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all limiters.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            self.len.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }

    /// Maximum number of limiters held at once.
    pub fn capacity(&self) -> usize {
        self.max_keys.get()
    }

    /// Default idle TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Evict the entry used least recently across all shards.
    ///
    /// Returns `false` when there was nothing to evict. Shards are locked one
    /// at a time; if the chosen entry is touched before it can be removed, no
    /// entry is evicted and the caller checks again.
    fn evict_lru(&self) -> bool {
        let oldest = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(index, shard)| {
                shard
                    .lock()
                    .peek_lru()
                    .map(|(_, entry)| (entry.last_used, index))
            })
            .min();

        let Some((last_used, index)) = oldest else {
            return false;
        };

        let mut shard = self.shards[index].lock();
        let unchanged = shard
            .peek_lru()
            .is_some_and(|(_, entry)| entry.last_used == last_used);
        if unchanged {
            if let Some((key, _)) = shard.pop_lru() {
                self.len.fetch_sub(1, Ordering::Relaxed);
                debug!(key = %key, "Evicted least-recently-used limiter");
            }
        }
        true
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn shard_for(&self, key: &ClientKey) -> &Shard {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }
}
