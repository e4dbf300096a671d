use std::time::Duration;

use herdcache::caching::{Caches, Expiration, SharedCacheService};
use herdcache::config::Config;
use herdcache_test::{self as test, Calls};

use crate::wait_init;

const CONFIG: &str = r#"
logging:
  level: warn
metrics:
  statsd: null
shared_cache:
  memory: {}
caches:
  memory-cache:
    use_shared_cache: false
    policy:
      local_ttl: 100ms
      expiration: sliding
  hybrid-cache:
    policy:
      local_ttl: 100ms
      shared_ttl: 1m
      allow_stale_on_failure: true
      stale_retention: 10m
"#;

#[tokio::test]
async fn test_caches_from_config_file() {
    test::setup();
    let dir = test::tempdir();
    let path = dir.path().join("config.yml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = Config::get(Some(&path)).unwrap();
    assert!(config.metrics.statsd.is_none());

    let caches = Caches::from_config(&config);
    assert_eq!(caches.iter().count(), 2);
    assert_eq!(
        caches.get("memory-cache").unwrap().policy().expiration,
        Expiration::Sliding
    );

    let shared_cache =
        SharedCacheService::new(config.shared_cache.clone(), tokio::runtime::Handle::current());
    assert_eq!(wait_init(&shared_cache).await.backend_name(), "memory");

    let hybrid_a = caches
        .cacher::<String>("hybrid-cache", shared_cache.clone())
        .unwrap();
    let hybrid_b = caches
        .cacher::<String>("hybrid-cache", shared_cache.clone())
        .unwrap();
    let memory_a = caches
        .cacher::<String>("memory-cache", shared_cache.clone())
        .unwrap();
    let memory_b = caches
        .cacher::<String>("memory-cache", shared_cache)
        .unwrap();
    let calls = Calls::new();

    for cache in [&hybrid_a, &memory_a] {
        let result = cache
            .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "a".to_owned()))
            .await;
        assert_eq!(result.as_deref(), Ok("a"));
    }

    // only the hybrid cache shares its entries
    let result = hybrid_b
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "b".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("a"));
    let result = memory_b
        .get_or_create("k", test::slow_value(&calls, Duration::ZERO, "b".to_owned()))
        .await;
    assert_eq!(result.as_deref(), Ok("b"));
    assert_eq!(calls.count(), 3);
}

#[test]
fn test_missing_config_file() {
    let dir = test::tempdir();
    let result = Config::get(Some(&dir.path().join("missing.yml")));
    assert!(result.is_err());

    let config = Config::get(None).unwrap();
    assert_eq!(config.caches.len(), 3);
}
