use std::time::Duration;

use herdcache::caching::{
    CacheKey, FilesystemSharedCacheConfig, Policy, SharedCacheBackendConfig, SharedCacheConfig,
    SharedCacheService,
};
use herdcache_test::{self as test, Calls};

use crate::{cacher, wait_init};

#[tokio::test]
async fn test_filesystem_shared_cache() {
    test::setup();
    let cache_dir = test::tempdir();

    let config = SharedCacheConfig::new(SharedCacheBackendConfig::Filesystem(
        FilesystemSharedCacheConfig {
            path: cache_dir.path().join("shared"),
        },
    ));
    let shared_cache = SharedCacheService::new(Some(config), tokio::runtime::Handle::current());
    assert_eq!(wait_init(&shared_cache).await.backend_name(), "filesystem");

    let first = cacher("hybrid-cache", Policy::default(), shared_cache.clone());
    let second = cacher("hybrid-cache", Policy::default(), shared_cache);
    let calls = Calls::new();

    let result = first
        .get_or_create("k", test::slow_value(&calls, Duration::from_millis(10), "v1".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));

    // the entry is written as a JSON envelope below the hashed path
    let path = cache_dir
        .path()
        .join("shared")
        .join(CacheKey::from("k").shared_path(&"hybrid-cache".into()));
    let content: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(content["value"], "v1");
    assert!(content.get("started_at").is_some());
    assert!(content.get("created_at").is_some());
    assert!(content.get("expires_at").is_some());

    let result = second
        .get_or_create("k", test::slow_value(&calls, Duration::from_millis(10), "v2".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v1"));
    assert_eq!(calls.count(), 1);

    second.invalidate("k").await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_filesystem_init_failure() {
    test::setup();
    let cache_dir = test::tempdir();

    // the root directory can not be created below a file
    let file = cache_dir.path().join("file");
    std::fs::write(&file, b"not a directory").unwrap();

    let config = SharedCacheConfig::new(SharedCacheBackendConfig::Filesystem(
        FilesystemSharedCacheConfig {
            path: file.join("shared"),
        },
    ));
    let shared_cache = SharedCacheService::new(Some(config), tokio::runtime::Handle::current());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(shared_cache.get().is_none());

    // without a shared cache, everything is computed and kept in memory
    let cache = cacher("hybrid-cache", Policy::default(), shared_cache);
    let calls = Calls::new();
    let result = cache
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "v".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("v"));
}
