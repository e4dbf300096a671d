use std::time::Duration;

use herdcache::caching::Policy;
use herdcache_test::{self as test, Calls};
use tokio::time;

use crate::{CountingSharedCache, cacher, shared_cache};

fn policy() -> Policy {
    Policy {
        local_ttl: Duration::from_secs(1),
        shared_ttl: Duration::from_secs(60),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_tier_precedence() {
    test::setup();
    let backend = CountingSharedCache::new();
    let cache = cacher("hybrid-cache", policy(), shared_cache(backend.clone()));
    let calls = Calls::new();

    let result = cache
        .get_or_create("k", test::slow_value(&calls, Duration::from_secs(3), "v1".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));
    assert_eq!(backend.fetches(), 1);
    assert_eq!(backend.stores(), 1);

    // in-memory hits never reach the shared cache
    for _ in 0..10 {
        let result = cache
            .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v2".to_owned()))
            .await;
        assert_eq!(result.as_deref(), Ok("v1"));
    }
    assert_eq!(backend.fetches(), 1);

    // once the in-memory entry expired, the shared cache is asked before computing
    time::advance(Duration::from_secs(2)).await;
    let result = cache
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v2".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));
    assert_eq!(backend.fetches(), 2);
    assert_eq!(backend.stores(), 1);
    assert_eq!(calls.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_between_caches() {
    test::setup();
    let backend = CountingSharedCache::new();
    let first = cacher("hybrid-cache", policy(), shared_cache(backend.clone()));
    let second = cacher("hybrid-cache", policy(), shared_cache(backend.clone()));
    let other = cacher("fusion-cache", policy(), shared_cache(backend.clone()));
    let calls = Calls::new();

    let result = first
        .get_or_create("k", test::slow_value(&calls, Duration::from_secs(3), "v1".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));

    let result = second
        .get_or_create("k", test::slow_value(&calls, Duration::from_secs(3), "v2".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));
    assert_eq!(calls.count(), 1);

    // entries are namespaced by the cache name
    let result = other
        .get_or_create("k", test::slow_value(&calls, Duration::from_secs(3), "v3".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v3"));
    assert_eq!(calls.count(), 2);
    assert_eq!(backend.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_removes_from_both_tiers() {
    test::setup();
    let backend = CountingSharedCache::new();
    let first = cacher("hybrid-cache", policy(), shared_cache(backend.clone()));
    let second = cacher("hybrid-cache", policy(), shared_cache(backend.clone()));
    let calls = Calls::new();

    first
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v1".to_owned()))
        .await
        .unwrap();
    first.invalidate("k").await;
    assert_eq!(backend.removes(), 1);
    assert_eq!(backend.len(), 0);

    let result = second
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v2".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v2"));
    assert_eq!(calls.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_from_shared_cache() {
    test::setup();
    let backend = CountingSharedCache::new();
    let policy = Policy {
        shared_ttl: Duration::from_secs(5),
        stale_retention: Duration::from_secs(60),
        allow_stale_on_failure: true,
        ..policy()
    };
    let first = cacher("hybrid-cache", policy.clone(), shared_cache(backend.clone()));
    let second = cacher("hybrid-cache", policy, shared_cache(backend.clone()));
    let calls = Calls::new();

    first
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v1".to_owned()))
        .await
        .unwrap();

    // the second cache never saw the entry, but falls back to the expired shared one
    time::advance(Duration::from_secs(10)).await;
    let result = second
        .get_or_create("k", test::failing::<String>(&calls, Duration::ZERO, "db down"))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));
    assert_eq!(calls.count(), 2);
}
