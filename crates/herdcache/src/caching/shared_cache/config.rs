use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySharedCacheConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemSharedCacheConfig {
    pub path: PathBuf,
}

/// The backend to use for the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedCacheBackendConfig {
    Memory(MemorySharedCacheConfig),
    Filesystem(FilesystemSharedCacheConfig),
}

/// A cache that lives outside of the in-memory cache, and can possibly be shared between multiple
/// processes.
///
/// Entries missing from the in-memory cache will be looked up from here before they are computed.
/// Freshly computed entries are stored here as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheConfig {
    /// The maximum time to wait for a lookup in the shared cache.
    ///
    /// A lookup that takes longer is treated as a miss.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// The maximum time to wait for storing an entry in the shared cache.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,

    /// The backend to use for the shared cache.
    #[serde(flatten)]
    pub backend: SharedCacheBackendConfig,
}

impl SharedCacheConfig {
    pub fn new(backend: SharedCacheBackendConfig) -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            store_timeout: default_store_timeout(),
            backend,
        }
    }
}

pub(super) fn default_fetch_timeout() -> Duration {
    Duration::from_millis(500)
}

pub(super) fn default_store_timeout() -> Duration {
    Duration::from_secs(60)
}
