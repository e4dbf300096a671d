use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};

use super::{SharedCacheBackend, SharedCacheError};
use crate::caching::time;

/// A shared cache backend that keeps all entries in a process-local map.
///
/// This makes it possible to share entries between multiple caches within the same process,
/// and is used in tests.
#[derive(Debug, Default)]
pub struct InMemorySharedCache {
    entries: Mutex<HashMap<String, (Bytes, SystemTime)>>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries, including the ones that are past their retention.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fetch_sync(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (content, retain_until) = entries.get(key)?;
        if *retain_until <= time::now() {
            entries.remove(key);
            return None;
        }
        Some(content.clone())
    }
}

impl SharedCacheBackend for InMemorySharedCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, SharedCacheError>> {
        future::ready(Ok(self.fetch_sync(key))).boxed()
    }

    fn store<'a>(
        &'a self,
        key: &'a str,
        content: Bytes,
        retain_for: Duration,
    ) -> BoxFuture<'a, Result<u64, SharedCacheError>> {
        let bytes = content.len() as u64;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), (content, time::now() + retain_for));
        future::ready(Ok(bytes)).boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), SharedCacheError>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        future::ready(Ok(())).boxed()
    }
}
