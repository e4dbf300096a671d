use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use herdcache::caching::{
    Cache, Cacher, InMemorySharedCache, Policy, SharedCacheBackend, SharedCacheError,
    SharedCacheRef, SharedCacheService,
};
use herdcache::config::CacheConfig;

/// A shared cache backend that counts how often it is used, and that can be switched off.
#[derive(Debug, Default)]
pub struct CountingSharedCache {
    inner: InMemorySharedCache,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
    stores: AtomicUsize,
    removes: AtomicUsize,
}

impl CountingSharedCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following operation fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn check(&self) -> Result<(), SharedCacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection refused").into());
        }
        Ok(())
    }
}

impl SharedCacheBackend for CountingSharedCache {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, SharedCacheError>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.check() {
            Ok(()) => self.inner.fetch(key),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn store<'a>(
        &'a self,
        key: &'a str,
        content: Bytes,
        retain_for: Duration,
    ) -> BoxFuture<'a, Result<u64, SharedCacheError>> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        match self.check() {
            Ok(()) => self.inner.store(key, content, retain_for),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), SharedCacheError>> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        match self.check() {
            Ok(()) => self.inner.remove(key),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }
}

/// Wraps `backend` into an initialised shared cache.
pub fn shared_cache(backend: Arc<dyn SharedCacheBackend>) -> SharedCacheRef {
    SharedCacheService::with_backend(backend).into_ref()
}

/// Creates a cache named `name` using `shared_cache`.
pub fn cacher(name: &str, policy: Policy, shared_cache: SharedCacheRef) -> Cacher<String> {
    let config = CacheConfig {
        policy,
        ..Default::default()
    };
    Cacher::new(Cache::from_config(name, &config), shared_cache)
}

/// Waits for a shared cache configured with [`SharedCacheService::new`] to be initialised.
pub async fn wait_init(shared_cache: &SharedCacheRef) -> &SharedCacheService {
    const MAX_DELAY: Duration = Duration::from_secs(3);
    let start = Instant::now();
    loop {
        if start.elapsed() > MAX_DELAY {
            panic!("shared cache not ready");
        }
        if let Some(service) = shared_cache.get() {
            return service;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
