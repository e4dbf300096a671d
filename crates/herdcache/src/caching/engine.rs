use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;

use super::computation::Computations;
use super::memory::{CacheItem, LocalTier, Lookup};
use super::policy::{Expiration, Policy};
use super::shared_cache::{SharedCacheRef, SharedCacheService};
use super::{Cache, CacheEntry, CacheError, CacheKey, time};

/// A value that can be stored in a [`Cacher`].
///
/// Values are cloned out of the in-memory cache, and serialized into the shared cache.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The envelope that values are stored in inside the shared cache.
#[derive(Debug, Serialize, Deserialize)]
struct SharedEntry<V> {
    value: V,
    started_at: SystemTime,
    created_at: SystemTime,
    expires_at: SystemTime,
}

/// A cache-aside cache for values of type `T`.
///
/// Values are looked up in the in-memory cache first, then in the shared cache, and are finally
/// computed by the computation passed to [`get_or_create`](Self::get_or_create). Concurrent
/// requests for the same key share a single computation.
///
/// Cloning a `Cacher` is cheap, all clones share the same state.
pub struct Cacher<T> {
    config: Cache,

    /// The in-memory cache tier.
    local: LocalTier<T>,

    /// The currently running computations.
    computations: Computations<T>,

    /// A service used to communicate with the shared cache.
    shared_cache: SharedCacheRef,

    /// All the computations spawned by this cache.
    tasks: TaskTracker,

    shutting_down: Arc<AtomicBool>,
}

impl<T> std::fmt::Debug for Cacher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("config", &self.config)
            .field("local", &self.local)
            .field("computations", &self.computations)
            .field("shared_cache", &self.shared_cache)
            .finish()
    }
}

impl<T: Clone> Clone for Cacher<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Cacher {
            config: self.config.clone(),
            local: self.local.clone(),
            computations: self.computations.clone(),
            shared_cache: Arc::clone(&self.shared_cache),
            tasks: self.tasks.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }
}

impl<T: CacheValue> Cacher<T> {
    pub fn new(config: Cache, shared_cache: SharedCacheRef) -> Self {
        let local = LocalTier::new(config.name(), config.in_memory_capacity);
        let tasks = TaskTracker::new();
        let computations =
            Computations::new(config.name().clone(), tasks.clone(), config.max_lazy_refreshes());

        Cacher {
            config,
            local,
            computations,
            shared_cache,
            tasks,
            shutting_down: Default::default(),
        }
    }

    /// The configuration of this cache.
    pub fn config(&self) -> &Cache {
        &self.config
    }

    /// The number of computations that are currently running.
    pub fn in_flight(&self) -> usize {
        self.computations.in_flight()
    }

    /// Returns the value for `key`, computing it with `compute` if it is not cached.
    ///
    /// Uses the [`Policy`] configured for this cache.
    pub async fn get_or_create<F, Fut, E>(&self, key: impl Into<CacheKey>, compute: F) -> CacheEntry<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.get_or_create_with_policy(key, self.config.policy(), compute)
            .await
    }

    /// Returns the value for `key`, computing it with `compute` if it is not cached.
    ///
    /// This tries the following things in order:
    /// 1. Looks the value up in the in-memory cache, returning it if it is fresh.
    /// 2. Looks the value up in the shared cache, returning it if it is fresh.
    /// 3. Serves an expired value while refreshing it in the background, if the policy allows.
    /// 4. Computes the value, deduplicated with all concurrent requests for `key`.
    ///
    /// The computation is spawned as its own task. It keeps running when the caller gives up
    /// waiting for it, and its result is still written to the cache.
    ///
    /// # Errors
    ///
    /// Errors of the computation are returned to every caller waiting for it, unless the policy
    /// allows falling back to an expired value. Errors are never cached, the next call for the
    /// same key will start a new computation.
    pub async fn get_or_create_with_policy<F, Fut, E>(
        &self,
        key: impl Into<CacheKey>,
        policy: &Policy,
        compute: F,
    ) -> CacheEntry<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let key = key.into();
        let name = self.config.name();
        metric!(counter("caches.access") += 1, "cache" => name.as_ref());

        let mut stale = None;
        match self.local.get(&key).await {
            Lookup::Fresh(item) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name.as_ref());
                self.on_fresh_hit(&key, policy, &item, compute).await;
                return Ok(item.value);
            }
            Lookup::Stale(item) => {
                metric!(counter("caches.memory.stale") += 1, "cache" => name.as_ref());
                stale = Some(item.value);
            }
            Lookup::Absent => {}
        }

        if let Some(item) = self.load_from_shared_cache(&key, policy).await {
            match Lookup::classify(item, time::now()) {
                Lookup::Fresh(item) => {
                    metric!(counter("caches.shared.hit") += 1, "cache" => name.as_ref());
                    let value = item.value.clone();
                    self.write_through(&key, policy, item).await;
                    return Ok(value);
                }
                Lookup::Stale(item) if stale.is_none() => {
                    stale = Some(item.value);
                }
                Lookup::Stale(_) => {}
                Lookup::Absent => {}
            }
        }

        if let Some(stale) = stale.as_ref().filter(|_| policy.background_refresh) {
            self.spawn_refresh(&key, policy, compute);
            metric!(
                counter("caches.stale_served") += 1,
                "cache" => name.as_ref(),
                "reason" => "refresh",
            );
            return Ok(stale.clone());
        }

        match self.compute_memoized(&key, policy, compute).await {
            Err(err) if policy.allow_stale_on_failure => match stale {
                Some(stale) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Serving stale {name} entry {key}",
                    );
                    metric!(
                        counter("caches.stale_served") += 1,
                        "cache" => name.as_ref(),
                        "reason" => err.metrics_tag(),
                    );
                    Ok(stale)
                }
                None => Err(err),
            },
            result => result,
        }
    }

    /// Removes `key` from the in-memory and the shared cache.
    ///
    /// A computation that is currently running for `key` is not cancelled, and its result will
    /// still be written to the cache once it completes.
    pub async fn invalidate(&self, key: impl Into<CacheKey>) {
        let key = key.into();
        self.local.remove(&key).await;
        if let Some(shared_cache) = self.shared_cache() {
            shared_cache.remove(self.config.name(), &key).await;
        }
    }

    /// Shuts this cache down.
    ///
    /// No new background refreshes are started after this. Waits for all running computations to
    /// complete, and then drops all in-memory entries.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.tasks.close();
        self.tasks.wait().await;
        self.local.clear();
        tracing::debug!("Shut down {} cache", self.config.name());
    }

    /// Handles the optional effects of a fresh in-memory hit.
    async fn on_fresh_hit<F, Fut, E>(
        &self,
        key: &CacheKey,
        policy: &Policy,
        item: &CacheItem<T>,
        compute: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        if policy.expiration == Expiration::Sliding {
            self.local.touch(key, item, policy.local_ttl).await;
        }

        if let Some(refresh_at) = policy.eager_refresh_at(item.created_at, item.expires_at) {
            if time::now() >= refresh_at {
                self.spawn_refresh(key, policy, compute);
            }
        }
    }

    fn shared_cache(&self) -> Option<&SharedCacheService> {
        self.config
            .use_shared_cache()
            .then(|| self.shared_cache.get())
            .flatten()
    }

    /// Loads an entry from the shared cache.
    ///
    /// Returns `None` if the shared cache is not enabled for this cache, or the entry is not found
    /// there.
    async fn load_from_shared_cache(&self, key: &CacheKey, policy: &Policy) -> Option<CacheItem<T>> {
        let name = self.config.name();
        let shared_cache = self.shared_cache()?;
        let content = shared_cache.fetch(name, key).await?;

        match serde_json::from_slice::<SharedEntry<T>>(&content) {
            Ok(entry) => Some(CacheItem::new(
                entry.value,
                entry.started_at,
                entry.created_at,
                entry.expires_at,
                policy.effective_stale_retention(),
            )),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Discarding undecodable {name} shared cache entry {key}",
                );
                None
            }
        }
    }

    /// Copies a fresh shared cache entry into the in-memory cache.
    ///
    /// The in-memory copy never outlives the shared one.
    async fn write_through(&self, key: &CacheKey, policy: &Policy, shared: CacheItem<T>) {
        let now = time::now();
        let expires_at = policy.local_expiry(now).min(shared.expires_at);
        let item = CacheItem::new(
            shared.value,
            shared.started_at,
            now,
            expires_at,
            policy.effective_stale_retention(),
        );
        self.local.set(key, item).await;
    }

    /// Stores a freshly computed value in the shared cache.
    async fn store_in_shared_cache(
        &self,
        key: &CacheKey,
        policy: &Policy,
        value: &T,
        started_at: SystemTime,
        created_at: SystemTime,
    ) {
        let name = self.config.name();
        let Some(shared_cache) = self.shared_cache() else {
            return;
        };

        let expires_at = policy.shared_expiry(created_at);
        let entry = SharedEntry {
            value,
            started_at,
            created_at,
            expires_at,
        };
        let content = match serde_json::to_vec(&entry) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to serialize {name} entry {key}",
                );
                return;
            }
        };

        let retain_for = expires_at.duration_since(created_at).unwrap_or_default()
            + policy.effective_stale_retention();
        shared_cache
            .store(name, key, content.into(), retain_for)
            .await;
    }

    /// Computes a value and writes it to the shared and the in-memory cache.
    ///
    /// This method does not take care of ensuring the computation only happens once even
    /// for concurrent requests, see [`Computations`] for this.
    async fn compute<F, Fut, E>(
        self,
        key: CacheKey,
        policy: Policy,
        compute: F,
        is_refresh: bool,
    ) -> CacheEntry<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let name = self.config.name();

        // Another computation might have finished in between our lookup and the point where
        // this one was registered.
        if !is_refresh {
            if let Lookup::Fresh(item) = self.local.get(&key).await {
                return Ok(item.value);
            }
        }

        metric!(
            counter("caches.computation") += 1,
            "cache" => name.as_ref(),
            "is_refresh" => &is_refresh.to_string(),
        );

        let started_at = time::now();
        let start = tokio::time::Instant::now();
        let computation = async move { compute().await.map_err(CacheError::from_compute_error) };
        let result = match policy.compute_timeout {
            Some(timeout) => tokio::time::timeout(timeout, computation)
                .await
                .unwrap_or(Err(CacheError::Timeout(timeout))),
            None => computation.await,
        };
        metric!(
            timer("caches.computation.duration") = start.elapsed(),
            "cache" => name.as_ref(),
            "is_refresh" => &is_refresh.to_string(),
        );

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                metric!(
                    counter("caches.computation.error") += 1,
                    "cache" => name.as_ref(),
                    "reason" => err.metrics_tag(),
                );
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "Failed to compute {name} entry {key}",
                );
                return Err(err);
            }
        };

        let created_at = time::now();
        self.store_in_shared_cache(&key, &policy, &value, started_at, created_at)
            .await;

        let item = CacheItem::new(
            value.clone(),
            started_at,
            created_at,
            policy.local_expiry(created_at),
            policy.effective_stale_retention(),
        );
        if !self.local.set(&key, item).await {
            tracing::trace!("Not replacing newer {name} entry {key}");
        }

        Ok(value)
    }

    /// Computes `key`, deduplicated with all concurrent computations of it.
    fn compute_memoized<F, Fut, E>(
        &self,
        key: &CacheKey,
        policy: &Policy,
        compute: F,
    ) -> BoxFuture<'static, CacheEntry<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let this = self.clone();
        let policy = policy.clone();
        let owned_key = key.clone();
        self.computations
            .run_exclusive(key, move || this.compute(owned_key, policy, compute, false))
    }

    /// Refreshes `key` in the background, unless it is already being computed.
    fn spawn_refresh<F, Fut, E>(&self, key: &CacheKey, policy: &Policy, compute: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        if self.shutting_down.load(Ordering::Relaxed) {
            return false;
        }

        let this = self.clone();
        let policy = policy.clone();
        let owned_key = key.clone();
        self.computations
            .spawn_refresh(key, move || this.compute(owned_key, policy, compute, true))
    }
}
