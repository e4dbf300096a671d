use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{Expiration, Policy, SharedCacheConfig};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

impl Logging {
    /// The log filter used when `RUST_LOG` is not set.
    ///
    /// Debug and trace output is limited to this project's crates, everything else logs at
    /// `INFO` at most.
    pub fn default_filter(&self) -> &'static str {
        match self.level {
            LevelFilter::OFF => "",
            LevelFilter::ERROR => "ERROR",
            LevelFilter::WARN => "WARN",
            LevelFilter::INFO => "INFO",
            LevelFilter::DEBUG => "INFO,herdcache=DEBUG,herdcache_stress=DEBUG",
            LevelFilter::TRACE => "INFO,herdcache=TRACE,herdcache_stress=TRACE",
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "herdcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The configuration of a single named cache.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The maximum number of entries kept in memory.
    ///
    /// Defaults to `10_000`.
    pub in_memory_capacity: u64,

    /// Whether this cache uses the shared cache, if one is configured.
    ///
    /// Defaults to `true`.
    pub use_shared_cache: bool,

    /// Maximum number of concurrent background refreshes.
    ///
    /// Defaults to `20`.
    pub max_lazy_refreshes: isize,

    /// Expiration and failure handling of this cache.
    pub policy: Policy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            in_memory_capacity: 10_000,
            use_shared_cache: true,
            max_lazy_refreshes: 20,
            policy: Policy::default(),
        }
    }
}

/// The default caches.
///
/// - `memory-cache`: An in-memory only cache with a sliding expiration.
/// - `hybrid-cache`: A two-tier cache keeping entries in memory shortly, and in the shared cache
///   for longer.
/// - `fusion-cache`: An in-memory cache with a fixed expiration.
fn default_caches() -> BTreeMap<String, CacheConfig> {
    let second = Duration::from_secs(1);

    let memory = CacheConfig {
        use_shared_cache: false,
        policy: Policy {
            local_ttl: second,
            expiration: Expiration::Sliding,
            ..Default::default()
        },
        ..Default::default()
    };
    let hybrid = CacheConfig {
        policy: Policy {
            local_ttl: second,
            shared_ttl: Duration::from_secs(5 * 60),
            ..Default::default()
        },
        ..Default::default()
    };
    let fusion = CacheConfig {
        use_shared_cache: false,
        policy: Policy {
            local_ttl: second,
            expiration: Expiration::Absolute,
            ..Default::default()
        },
        ..Default::default()
    };

    BTreeMap::from([
        ("memory-cache".to_owned(), memory),
        ("hybrid-cache".to_owned(), hybrid),
        ("fusion-cache".to_owned(), fusion),
    ])
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The sample rate for Sentry traces.
    ///
    /// Defaults to `0.05`.
    pub traces_sample_rate: f32,

    /// An optional shared cache.
    ///
    /// If configured, this cache is queried whenever an entry is not found in the in-memory
    /// cache. Only if the shared cache does not have the entry either will it be computed, after
    /// which it will be stored in the shared cache.
    pub shared_cache: Option<SharedCacheConfig>,

    /// All named caches.
    pub caches: BTreeMap<String, CacheConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            traces_sample_rate: 0.05,
            shared_cache: None,
            caches: default_caches(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use crate::caching::SharedCacheBackendConfig;

    use super::*;

    #[test]
    fn test_default_caches() {
        let cfg = Config::default();

        assert_eq!(
            cfg.caches.keys().collect::<Vec<_>>(),
            ["fusion-cache", "hybrid-cache", "memory-cache"]
        );

        let memory = &cfg.caches["memory-cache"];
        assert!(!memory.use_shared_cache);
        assert_eq!(memory.policy.expiration, Expiration::Sliding);
        assert_eq!(memory.policy.local_ttl, Duration::from_secs(1));

        let hybrid = &cfg.caches["hybrid-cache"];
        assert!(hybrid.use_shared_cache);
        assert_eq!(hybrid.policy.local_ttl, Duration::from_secs(1));
        assert_eq!(hybrid.policy.shared_ttl, Duration::from_secs(300));

        let fusion = &cfg.caches["fusion-cache"];
        assert!(!fusion.use_shared_cache);
        assert_eq!(fusion.policy.expiration, Expiration::Absolute);
    }

    #[test]
    fn test_cache_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            shared_cache:
              filesystem:
                path: /var/cache/herdcache
              store_timeout: 10s
            caches:
              fusion-cache:
                in_memory_capacity: 500
                max_lazy_refreshes: 5
                policy:
                  local_ttl: 2s
                  background_refresh: true
                  stale_retention: 1m
                  eager_refresh_threshold: 0.9
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.traces_sample_rate, 0.05);

        let shared_cache = cfg.shared_cache.unwrap();
        assert_eq!(shared_cache.store_timeout, Duration::from_secs(10));
        assert!(matches!(
            shared_cache.backend,
            SharedCacheBackendConfig::Filesystem(_)
        ));

        // configuring caches replaces the default ones
        assert_eq!(cfg.caches.len(), 1);
        let fusion = &cfg.caches["fusion-cache"];
        assert_eq!(fusion.in_memory_capacity, 500);
        assert!(fusion.use_shared_cache);
        assert_eq!(fusion.max_lazy_refreshes, 5);
        assert_eq!(fusion.policy.local_ttl, Duration::from_secs(2));
        assert!(fusion.policy.background_refresh);
        assert_eq!(fusion.policy.stale_retention, Duration::from_secs(60));
        assert_eq!(fusion.policy.eager_refresh_threshold, Some(0.9));
    }

    #[test]
    fn test_default_filter() {
        let mut logging = Logging::default();
        assert_eq!(logging.default_filter(), "INFO");

        logging.level = LevelFilter::DEBUG;
        assert_eq!(
            logging.default_filter(),
            "INFO,herdcache=DEBUG,herdcache_stress=DEBUG"
        );

        logging.level = LevelFilter::OFF;
        assert_eq!(logging.default_filter(), "");
    }

    #[test]
    fn test_invalid_level() {
        let result = Config::from_reader("logging:\n  level: loud".as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              memory-cache:
                max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
