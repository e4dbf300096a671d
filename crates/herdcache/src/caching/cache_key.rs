use std::borrow::Borrow;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The key of a single cache entry.
///
/// Keys are opaque strings, compared byte for byte. No normalization happens, so `"K"` and `"k"`
/// are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the path of this key inside the shared cache.
    ///
    /// The path is namespaced by the cache name, followed by the sha-256 hash of the key
    /// hex-formatted like so: `$cache/aa/bbccdd/eeff...`
    pub fn shared_path(&self, cache: &CacheName) -> String {
        let hash = Sha256::digest(self.0.as_bytes());

        let mut path = format!("{cache}/{:02x}/", hash[0]);
        for b in &hash[1..4] {
            // writing into a `String` never fails
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

/// The name of a cache.
///
/// Every [`Cacher`](super::Cacher) has a name, which is used to tag metrics and to namespace its
/// entries in the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheName(Arc<str>);

impl CacheName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CacheName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
