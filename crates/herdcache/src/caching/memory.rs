//! The in-memory (local) cache tier.

use std::future::ready;
use std::time::{Duration, Instant, SystemTime};

use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;

use super::{CacheKey, CacheName, time};

/// An item saved in the in-memory cache.
#[derive(Clone, Debug)]
pub struct CacheItem<T> {
    /// The cached value.
    pub value: T,
    /// When this value was written into the cache.
    pub created_at: SystemTime,
    /// The point in time from which on this item is no longer fresh.
    pub expires_at: SystemTime,
    /// When the deadline of this item was last extended by an access.
    ///
    /// Only sliding expiration records accesses, otherwise this is the same as `created_at`.
    pub last_accessed_at: SystemTime,
    /// When the computation that produced this value was started.
    pub(crate) started_at: SystemTime,
    /// Until when this item is kept for stale serving.
    pub(crate) retain_until: SystemTime,
}

impl<T> CacheItem<T> {
    /// Creates a new item that is fresh until `expires_at`, and retained for stale serving
    /// for another `stale_retention`.
    pub fn new(
        value: T,
        started_at: SystemTime,
        created_at: SystemTime,
        expires_at: SystemTime,
        stale_retention: Duration,
    ) -> Self {
        Self {
            value,
            created_at,
            expires_at,
            last_accessed_at: created_at,
            started_at,
            retain_until: expires_at + stale_retention,
        }
    }

    /// Whether this item and `other` were written by the same computation.
    fn same_attempt(&self, other: &Self) -> bool {
        self.started_at == other.started_at && self.created_at == other.created_at
    }
}

/// The result of a lookup in a cache tier.
#[derive(Debug)]
pub enum Lookup<T> {
    /// The item has not expired yet.
    Fresh(CacheItem<T>),
    /// The item is expired, but still retained for stale serving.
    Stale(CacheItem<T>),
    /// There is no usable item.
    Absent,
}

impl<T> Lookup<T> {
    pub(crate) fn classify(item: CacheItem<T>, now: SystemTime) -> Self {
        if now < item.expires_at {
            Lookup::Fresh(item)
        } else if now < item.retain_until {
            Lookup::Stale(item)
        } else {
            Lookup::Absent
        }
    }
}

/// A struct implementing [`moka::Expiry`] that keeps every item until its `retain_until` time.
struct CacheExpiration;

/// Returns the duration until `target_time`, or [`Duration::ZERO`] if that is in the past.
fn saturating_duration_until(target_time: SystemTime) -> Option<Duration> {
    Some(target_time.duration_since(time::now()).unwrap_or_default())
}

impl<T> moka::Expiry<CacheKey, CacheItem<T>> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheItem<T>,
        _current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_until(value.retain_until)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheItem<T>,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_until(value.retain_until)
    }
}

type InMemoryCache<T> = moka::future::Cache<CacheKey, CacheItem<T>>;

/// A bounded in-memory cache tier.
///
/// Once `capacity` entries are stored, the least recently used entries are evicted. Eviction
/// happens silently in the background.
#[derive(Clone)]
pub struct LocalTier<T> {
    cache: InMemoryCache<T>,
}

impl<T> std::fmt::Debug for LocalTier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTier")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> LocalTier<T> {
    pub fn new(name: &CacheName, capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .name(name.as_ref())
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(CacheExpiration)
            .build();

        Self { cache }
    }

    /// Looks up the item for `key`.
    pub async fn get(&self, key: &CacheKey) -> Lookup<T> {
        match self.cache.get(key).await {
            Some(item) => Lookup::classify(item, time::now()),
            None => Lookup::Absent,
        }
    }

    /// Stores `item` under `key`.
    ///
    /// Any existing item is replaced, unless it was produced by a computation that started later
    /// than the one that produced `item`. Returns `true` if the item was stored.
    pub async fn set(&self, key: &CacheKey, item: CacheItem<T>) -> bool {
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(existing) if existing.value().started_at > item.started_at => Op::Nop,
                    _ => Op::Put(item),
                };
                ready(op)
            })
            .await;

        matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        )
    }

    /// Extends the deadline of `item` to `ttl` from now.
    ///
    /// Nothing happens if the stored item has been replaced in the meantime.
    pub async fn touch(&self, key: &CacheKey, item: &CacheItem<T>, ttl: Duration) {
        self.cache
            .entry_by_ref(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(existing) if existing.value().same_attempt(item) => {
                        let mut touched = existing.into_value();
                        let retention = touched
                            .retain_until
                            .duration_since(touched.expires_at)
                            .unwrap_or_default();
                        let now = time::now();

                        touched.last_accessed_at = now;
                        touched.expires_at = now + ttl;
                        touched.retain_until = touched.expires_at + retention;
                        Op::Put(touched)
                    }
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;
    }

    /// Removes the item for `key`, if there is one.
    pub async fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    /// Removes all items.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// The approximate number of stored items.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs all pending maintenance, like evicting items over capacity.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}
