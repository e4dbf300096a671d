//! # Caching infrastructure
//!
//! This module implements a cache-aside cache: callers ask for a key and hand in a computation
//! that produces the value on a miss. The cache makes sure that expensive computations happen as
//! rarely as possible, even when many callers ask for the same key at the same time.
//!
//! ## Cache Layers
//!
//! Each [`Cacher`] is made up of the following layers:
//!
//! - A bounded in-memory layer that evicts the least recently used entries once full.
//! - An optional shared cache layer, reached through the [`SharedCacheBackend`] interface. It can
//!   be shared by different caches and processes, and usually keeps entries for longer.
//! - The request-coalescing layer, which makes sure that at most one computation is running per
//!   key at any time.
//!
//! A cache request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it will try the shared cache next, if enabled. A hit is copied into the in-memory
//!   layer.
//! - On miss, it will finally compute a fresh value, deduplicated with all concurrent requests.
//!   The freshly computed value is stored in the shared cache first, then in the in-memory layer,
//!   and then handed to everyone waiting for it.
//!
//! Computations are spawned as separate tasks. A caller that stops waiting, for example because
//! its request was cancelled, does not cancel the computation.
//!
//! Errors are never cached. All callers waiting for a failed computation receive the same
//! [`CacheError`], and the next request starts a new computation.
//!
//! ### Metrics
//!
//! We collect a couple of metrics, each of those is tagged with a `cache` field that corresponds to
//! the [`CacheName`]. Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.memory.stale`: Accesses that found an expired entry in the in-memory layer.
//! - `caches.shared.hit`: Accesses served by the shared-cache layer.
//! - `caches.computation`: Actual computations being run, and not served by any of the caching
//!   layers.
//! - `caches.computation.error`: Failed computations, tagged by `reason`.
//! - `caches.channel.hit` / `caches.channel.miss`: Whether a computation was joined or started.
//! - `caches.stale_served`: Expired values handed out, tagged by `reason`.
//! - `caches.refresh`: Completed background refreshes, tagged by `status`.
//! - `caches.lazy_limit_hit`: Background refreshes skipped because of `max_lazy_refreshes`.
//!
//! The shared cache additionally reports `services.shared_cache.{fetch,store,remove}`.
//!
//! ## [`Policy`]
//!
//! Every cache has a [`Policy`] that defines how long entries are fresh in either layer, and how
//! the cache behaves when a computation fails:
//!
//! - `local_ttl` / `shared_ttl`: The time-to-live in the in-memory and the shared layer.
//! - `expiration`: With `sliding` expiration every in-memory hit extends the entry by another
//!   `local_ttl`. With `absolute` expiration the deadline is fixed when the entry is written.
//! - `stale_retention`: Expired entries are kept for this long to be used by the following two.
//!   Defaults to one day as soon as either of them is enabled.
//! - `allow_stale_on_failure`: Hand out an expired value instead of a computation error.
//! - `background_refresh`: Hand out an expired value right away, and refresh it in a deduplicated
//!   background task.
//! - `compute_timeout`: Computations running longer than this fail with [`CacheError::Timeout`].
//! - `eager_refresh_threshold`: Refresh entries in the background once they have lived for this
//!   fraction of their `local_ttl`, so hot entries never expire.
//! - `ttl_jitter`: Add a random duration to each time-to-live, so entries written at the same
//!   time do not all expire at the same time.
//!
//! The number of concurrently running background refreshes is limited by `max_lazy_refreshes`.
//!
//! ## Ordering of writes
//!
//! Every in-memory entry remembers when the computation that produced it was started. An entry is
//! never replaced by the result of a computation that was started earlier, so a slow computation
//! can not overwrite a fresher value. The shared cache is an opaque store where the last write
//! wins.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicIsize;

use crate::config::{CacheConfig, Config};

mod cache_error;
mod cache_key;
mod computation;
mod engine;
mod memory;
mod policy;
mod shared_cache;
pub mod time;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheName};
pub use computation::Computations;
pub use engine::{CacheValue, Cacher};
pub use memory::{CacheItem, LocalTier, Lookup};
pub use policy::{Expiration, Policy};
pub use shared_cache::config::{
    FilesystemSharedCacheConfig, MemorySharedCacheConfig, SharedCacheBackendConfig,
};
pub use shared_cache::{
    FilesystemSharedCache, InMemorySharedCache, SharedCacheBackend, SharedCacheConfig,
    SharedCacheError, SharedCacheRef, SharedCacheService,
};

/// The configuration of a single named cache.
#[derive(Debug, Clone)]
pub struct Cache {
    name: CacheName,

    policy: Policy,

    /// The maximum number of entries in the in-memory cache.
    pub(crate) in_memory_capacity: u64,

    use_shared_cache: bool,

    /// The number of background refreshes that can still be started.
    max_lazy_refreshes: Arc<AtomicIsize>,
}

impl Cache {
    pub fn from_config(name: impl Into<CacheName>, config: &CacheConfig) -> Self {
        let name = name.into();
        if let Some(threshold) = config.policy.eager_refresh_threshold {
            if !Policy::is_valid_threshold(threshold) {
                tracing::warn!(
                    threshold,
                    "Ignoring eager refresh threshold of {name} cache, it must be between 0 and 1",
                );
            }
        }

        Self {
            name,
            policy: config.policy.clone(),
            in_memory_capacity: config.in_memory_capacity,
            use_shared_cache: config.use_shared_cache,
            max_lazy_refreshes: Arc::new(AtomicIsize::new(config.max_lazy_refreshes)),
        }
    }

    pub fn name(&self) -> &CacheName {
        &self.name
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn in_memory_capacity(&self) -> u64 {
        self.in_memory_capacity
    }

    pub fn use_shared_cache(&self) -> bool {
        self.use_shared_cache
    }

    pub fn max_lazy_refreshes(&self) -> Arc<AtomicIsize> {
        self.max_lazy_refreshes.clone()
    }
}

/// All the caches defined in the [`Config`].
#[derive(Debug, Clone, Default)]
pub struct Caches {
    caches: BTreeMap<CacheName, Cache>,
}

impl Caches {
    pub fn from_config(config: &Config) -> Self {
        let caches = config
            .caches
            .iter()
            .map(|(name, cache_config)| {
                let name = CacheName::from(name.as_str());
                let cache = Cache::from_config(name.clone(), cache_config);
                (name, cache)
            })
            .collect();
        Self { caches }
    }

    /// Returns the cache with the given name.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Creates a [`Cacher`] for the cache with the given name.
    pub fn cacher<T: CacheValue>(&self, name: &str, shared_cache: SharedCacheRef) -> Option<Cacher<T>> {
        let cache = self.get(name)?;
        Some(Cacher::new(cache.clone(), shared_cache))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cache> {
        self.caches.values()
    }
}
