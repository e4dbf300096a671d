use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use herdcache::caching::{Policy, SharedCacheBackend, SharedCacheError, SharedCacheService};
use herdcache_test::{self as test, Calls};
use tokio::time;

use crate::{CountingSharedCache, cacher, shared_cache};

#[tokio::test(start_paused = true)]
async fn test_unavailable_shared_cache() {
    test::setup();
    let backend = CountingSharedCache::new();
    let first = cacher("hybrid-cache", Policy::default(), shared_cache(backend.clone()));
    let second = cacher("hybrid-cache", Policy::default(), shared_cache(backend.clone()));
    let calls = Calls::new();

    backend.set_unavailable(true);

    // failures talking to the shared cache are treated as misses
    let result = first
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v1".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));
    assert_eq!(backend.fetches(), 1);
    assert_eq!(backend.stores(), 1);
    assert_eq!(backend.len(), 0);

    // the in-memory tier keeps working
    let result = first
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v2".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));

    // nothing was shared
    let result = second
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v2".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v2"));
    assert_eq!(calls.count(), 2);

    first.invalidate("k").await;
    assert_eq!(backend.removes(), 1);

    // once the shared cache is back, it is used again
    backend.set_unavailable(false);
    time::advance(Duration::from_secs(2)).await;
    first
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v3".to_owned()))
        .await
        .unwrap();
    assert_eq!(backend.len(), 1);
}

/// A backend that takes a long time to answer.
#[derive(Debug)]
struct SlowBackend;

impl SharedCacheBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, SharedCacheError>> {
        async {
            time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        .boxed()
    }

    fn store<'a>(
        &'a self,
        _key: &'a str,
        content: Bytes,
        _retain_for: Duration,
    ) -> BoxFuture<'a, Result<u64, SharedCacheError>> {
        async move {
            time::sleep(Duration::from_secs(60)).await;
            Ok(content.len() as u64)
        }
        .boxed()
    }

    fn remove<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), SharedCacheError>> {
        future::ready(Ok(())).boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_shared_cache() {
    test::setup();
    let shared_cache = SharedCacheService::with_backend(Arc::new(SlowBackend))
        .with_timeouts(Duration::from_millis(100), Duration::from_millis(500))
        .into_ref();
    let cache = cacher("hybrid-cache", Policy::default(), shared_cache);
    let calls = Calls::new();

    let start = time::Instant::now();
    let result = cache
        .get_or_create("k", test::slow_value(&calls, Duration::from_secs(1), "v".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v"));
    assert_eq!(calls.count(), 1);

    // the fetch and store timeouts bound the time spent on the shared cache
    assert_eq!(start.elapsed(), Duration::from_millis(1600));
}
