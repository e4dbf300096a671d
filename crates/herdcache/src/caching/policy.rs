use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Deserialize;

/// The stale retention used when stale values are enabled without configuring one.
const DEFAULT_STALE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How the deadline of a local cache entry moves over time.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Expiration {
    /// The entry expires a fixed time after it was written.
    #[default]
    Absolute,
    /// Every fresh hit pushes the deadline out by another `local_ttl`.
    Sliding,
}

/// The expiration and failure policy of a cache.
///
/// Every cache has a configured policy, which can be overridden for single accesses with
/// [`Cacher::get_or_create_with_policy`](super::Cacher::get_or_create_with_policy).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Policy {
    /// Time-to-live of entries in the in-memory cache.
    ///
    /// Defaults to `1s`.
    #[serde(with = "humantime_serde")]
    pub local_ttl: Duration,

    /// Time-to-live of entries in the shared cache.
    ///
    /// Defaults to `5m`.
    #[serde(with = "humantime_serde")]
    pub shared_ttl: Duration,

    /// Whether the in-memory deadline is fixed at write time or extended on access.
    pub expiration: Expiration,

    /// Serve an expired entry instead of failing when the computation fails.
    pub allow_stale_on_failure: bool,

    /// Serve an expired entry right away and refresh it in the background.
    pub background_refresh: bool,

    /// For how long expired entries are kept around to be served as stale values.
    ///
    /// Defaults to `0s`, meaning entries are dropped as soon as they expire. When
    /// `allow_stale_on_failure` or `background_refresh` is set, a zero retention means one day
    /// instead.
    #[serde(with = "humantime_serde")]
    pub stale_retention: Duration,

    /// Maximum duration of a single computation.
    #[serde(with = "humantime_serde")]
    pub compute_timeout: Option<Duration>,

    /// Fraction of `local_ttl` after which a fresh hit triggers a background refresh.
    ///
    /// Only values between `0.0` and `1.0` (both exclusive) are honored.
    pub eager_refresh_threshold: Option<f64>,

    /// Upper bound of a random duration added to every time-to-live.
    #[serde(with = "humantime_serde")]
    pub ttl_jitter: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            local_ttl: Duration::from_secs(1),
            shared_ttl: Duration::from_secs(5 * 60),
            expiration: Expiration::Absolute,
            allow_stale_on_failure: false,
            background_refresh: false,
            stale_retention: Duration::ZERO,
            compute_timeout: None,
            eager_refresh_threshold: None,
            ttl_jitter: None,
        }
    }
}

impl Policy {
    /// Returns `true` if the given eager refresh threshold can be used.
    pub fn is_valid_threshold(threshold: f64) -> bool {
        threshold > 0.0 && threshold < 1.0
    }

    /// For how long expired entries are retained for stale serving.
    pub fn effective_stale_retention(&self) -> Duration {
        let serves_stale = self.allow_stale_on_failure || self.background_refresh;
        if serves_stale && self.stale_retention.is_zero() {
            DEFAULT_STALE_RETENTION
        } else {
            self.stale_retention
        }
    }

    /// The deadline of a new in-memory entry written at `now`.
    pub fn local_expiry(&self, now: SystemTime) -> SystemTime {
        now + self.jittered(self.local_ttl)
    }

    /// The deadline of a new shared cache entry written at `now`.
    pub fn shared_expiry(&self, now: SystemTime) -> SystemTime {
        now + self.jittered(self.shared_ttl)
    }

    /// The point in time after which a fresh entry should be refreshed eagerly.
    pub fn eager_refresh_at(&self, created_at: SystemTime, expires_at: SystemTime) -> Option<SystemTime> {
        let threshold = self
            .eager_refresh_threshold
            .filter(|t| Self::is_valid_threshold(*t))?;
        let ttl = expires_at.duration_since(created_at).ok()?;
        Some(created_at + ttl.mul_f64(threshold))
    }

    fn jittered(&self, ttl: Duration) -> Duration {
        match self.ttl_jitter {
            Some(jitter) if !jitter.is_zero() => {
                ttl + rand::thread_rng().gen_range(Duration::ZERO..=jitter)
            }
            _ => ttl,
        }
    }
}
