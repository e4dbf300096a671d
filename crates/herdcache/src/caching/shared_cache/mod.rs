//! A cache tier that lives outside of the in-memory cache.
//!
//! The goal of this tier is to share computed entries between different caches or processes, and
//! to keep them around for longer than the in-memory cache does. It is reached through the narrow
//! [`SharedCacheBackend`] interface.
//!
//! The shared cache is never critical for operation: any error talking to it is logged and
//! reported as a metric, and otherwise treated as a miss.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use bytes::Bytes;
use futures::future::BoxFuture;
use sentry::Hub;
use sentry::protocol::Context;
use tokio::sync::OnceCell;

use super::{CacheKey, CacheName};

pub mod config;
mod fs;
mod memory;

pub use config::SharedCacheConfig;
use config::SharedCacheBackendConfig;
pub use fs::FilesystemSharedCache;
pub use memory::InMemorySharedCache;

/// Errors using the cache backend.
#[derive(thiserror::Error, Debug)]
pub enum SharedCacheError {
    #[error("timeout talking to cache service")]
    Timeout,
    #[error(transparent)]
    Other(#[from] Error),
}

impl SharedCacheError {
    fn errdetails(&self) -> &'static str {
        match self {
            SharedCacheError::Timeout => "timeout",
            SharedCacheError::Other(_) => "other",
        }
    }
}

/// The storage backing a [`SharedCacheService`].
///
/// Backends only move opaque bytes around. Keys are relative paths as produced by
/// [`CacheKey::shared_path`].
pub trait SharedCacheBackend: fmt::Debug + Send + Sync + 'static {
    /// The name of the backend, used for logging and metrics.
    fn name(&self) -> &'static str;

    /// Fetches the contents stored under `key`, if there are any.
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, SharedCacheError>>;

    /// Stores `content` under `key`, replacing any existing contents.
    ///
    /// Backends may drop the entry once `retain_for` has elapsed. Returns the number of bytes
    /// written.
    fn store<'a>(
        &'a self,
        key: &'a str,
        content: Bytes,
        retain_for: Duration,
    ) -> BoxFuture<'a, Result<u64, SharedCacheError>>;

    /// Removes the contents stored under `key`. Removing a missing key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), SharedCacheError>>;
}

/// Creates the backend.
///
/// If the backend can not be created the error will already be reported.
async fn create_backend(cfg: SharedCacheBackendConfig) -> Option<Arc<dyn SharedCacheBackend>> {
    match cfg {
        SharedCacheBackendConfig::Memory(_) => Some(Arc::new(InMemorySharedCache::new())),
        SharedCacheBackendConfig::Filesystem(cfg) => {
            match FilesystemSharedCache::new(cfg.path).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(err) => {
                    let err = err.context("Failed to initialise filesystem backend for shared cache");
                    sentry::capture_error(&*err);
                    None
                }
            }
        }
    }
}

pub type SharedCacheRef = Arc<OnceCell<SharedCacheService>>;

/// A shared cache service.
///
/// Initialising is asynchronous since it may take some time. Until it is initialised, the
/// [`SharedCacheRef`] is empty and the shared cache is skipped.
#[derive(Debug, Clone)]
pub struct SharedCacheService {
    backend: Arc<dyn SharedCacheBackend>,
    fetch_timeout: Duration,
    store_timeout: Duration,
}

impl SharedCacheService {
    pub fn new(
        config: Option<SharedCacheConfig>,
        runtime: tokio::runtime::Handle,
    ) -> SharedCacheRef {
        let cache = SharedCacheRef::default();
        if let Some(config) = config {
            runtime.spawn(Self::init(cache.clone(), config));
        }
        cache
    }

    async fn init(cache: SharedCacheRef, config: SharedCacheConfig) {
        if let Some(backend) = create_backend(config.backend).await {
            tracing::info!("Using {} shared cache", backend.name());
            let _ = cache.set(SharedCacheService {
                backend,
                fetch_timeout: config.fetch_timeout,
                store_timeout: config.store_timeout,
            });
        }
    }

    /// Creates a service around an existing backend, using the default timeouts.
    pub fn with_backend(backend: Arc<dyn SharedCacheBackend>) -> Self {
        Self {
            backend,
            fetch_timeout: config::default_fetch_timeout(),
            store_timeout: config::default_store_timeout(),
        }
    }

    pub fn with_timeouts(mut self, fetch_timeout: Duration, store_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self.store_timeout = store_timeout;
        self
    }

    /// Wraps this already initialised service in a [`SharedCacheRef`].
    pub fn into_ref(self) -> SharedCacheRef {
        Arc::new(OnceCell::new_with(Some(self)))
    }

    /// Returns the name of the backend configured.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn configure_scope(&self, cache: &CacheName, path: &str) {
        sentry::configure_scope(|scope| {
            let mut map = BTreeMap::new();
            map.insert("backend".to_string(), self.backend_name().into());
            map.insert("cache".to_string(), cache.as_ref().into());
            map.insert("path".to_string(), path.into());
            scope.set_context("Shared Cache", Context::Other(map));
        });
    }

    /// Retrieves an entry from the shared cache.
    ///
    /// Errors are transparently hidden, either a cache item is available or it is not.
    #[tracing::instrument(name = "fetch_shared_cache", skip(self))]
    pub async fn fetch(&self, cache: &CacheName, key: &CacheKey) -> Option<Bytes> {
        let _guard = Hub::current().push_scope();
        let path = key.shared_path(cache);
        self.configure_scope(cache, &path);

        let res = tokio::time::timeout(self.fetch_timeout, self.backend.fetch(&path))
            .await
            .unwrap_or(Err(SharedCacheError::Timeout));

        match res {
            Ok(Some(bytes)) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "cache" => cache.as_ref(),
                    "hit" => "true",
                    "status" => "ok",
                );
                let len: i64 = bytes.len().try_into().unwrap_or(i64::MAX);
                metric!(
                    counter("services.shared_cache.fetch.bytes") += len,
                    "cache" => cache.as_ref(),
                );
                Some(bytes)
            }
            Ok(None) => {
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "cache" => cache.as_ref(),
                    "hit" => "false",
                    "status" => "ok",
                );
                None
            }
            Err(outer_err) => {
                let errdetails = outer_err.errdetails();
                match outer_err {
                    SharedCacheError::Other(err) => {
                        let stderr: &dyn std::error::Error = &*err;
                        tracing::error!(stderr, "Error fetching from {} shared cache", self.backend_name());
                    }
                    SharedCacheError::Timeout => {
                        tracing::warn!("Timeout fetching from {} shared cache", self.backend_name());
                    }
                }
                metric!(
                    counter("services.shared_cache.fetch") += 1,
                    "cache" => cache.as_ref(),
                    "status" => "error",
                    "errdetails" => errdetails,
                );
                None
            }
        }
    }

    /// Places an entry in the shared cache, replacing any previous entry.
    ///
    /// Errors are transparently hidden, this service handles any errors itself.
    /// Returns `true` if the entry was stored.
    #[tracing::instrument(name = "store_shared_cache", skip(self, content))]
    pub async fn store(
        &self,
        cache: &CacheName,
        key: &CacheKey,
        content: Bytes,
        retain_for: Duration,
    ) -> bool {
        let _guard = Hub::current().push_scope();
        let path = key.shared_path(cache);
        self.configure_scope(cache, &path);

        let res = tokio::time::timeout(
            self.store_timeout,
            self.backend.store(&path, content, retain_for),
        )
        .await
        .unwrap_or(Err(SharedCacheError::Timeout));

        match res {
            Ok(bytes) => {
                metric!(
                    counter("services.shared_cache.store") += 1,
                    "cache" => cache.as_ref(),
                    "status" => "ok",
                );
                let bytes: i64 = bytes.try_into().unwrap_or(i64::MAX);
                metric!(
                    counter("services.shared_cache.store.bytes") += bytes,
                    "cache" => cache.as_ref(),
                );
                true
            }
            Err(outer_err) => {
                let errdetails = outer_err.errdetails();
                if let SharedCacheError::Other(err) = outer_err {
                    let stderr: &dyn std::error::Error = &*err;
                    tracing::error!(stderr, "Error storing entry on {} shared cache", self.backend_name());
                }
                metric!(
                    counter("services.shared_cache.store") += 1,
                    "cache" => cache.as_ref(),
                    "status" => "error",
                    "errdetails" => errdetails,
                );
                false
            }
        }
    }

    /// Removes an entry from the shared cache.
    ///
    /// Errors are transparently hidden, this service handles any errors itself.
    pub async fn remove(&self, cache: &CacheName, key: &CacheKey) {
        let path = key.shared_path(cache);

        let res = tokio::time::timeout(self.store_timeout, self.backend.remove(&path))
            .await
            .unwrap_or(Err(SharedCacheError::Timeout));

        let status = match res {
            Ok(()) => "ok",
            Err(outer_err) => {
                if let SharedCacheError::Other(ref err) = outer_err {
                    let stderr: &dyn std::error::Error = &**err;
                    tracing::error!(stderr, "Error removing entry from {} shared cache", self.backend_name());
                }
                outer_err.errdetails()
            }
        };
        metric!(
            counter("services.shared_cache.remove") += 1,
            "cache" => cache.as_ref(),
            "status" => status,
        );
    }
}
