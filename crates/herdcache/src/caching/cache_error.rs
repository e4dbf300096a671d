use std::time::Duration;

use thiserror::Error;

/// An error that happens when computing a value for the cache.
///
/// Errors are never cached. They are handed out to every caller that was waiting on the failed
/// computation, which is why this type is cheaply [`Clone`]able.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backing computation returned an error.
    ///
    /// The attached string contains the full error chain of the computation.
    #[error("computation failed: {0}")]
    ComputeFailed(String),
    /// The backing computation did not finish within the configured `compute_timeout`.
    #[error("computation timed out after {0:?}")]
    Timeout(Duration),
    /// The computation task went away without producing a result, most likely due to a panic.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Wraps an error returned by a backing computation.
    pub fn from_compute_error<E: Into<anyhow::Error>>(err: E) -> Self {
        let err = err.into();
        Self::ComputeFailed(format!("{err:#}"))
    }

    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::ComputeFailed(_) => "failed",
            CacheError::Timeout(_) => "timeout",
            CacheError::InternalError => "internal",
        }
    }
}

/// The outcome of a cache access, containing either `Ok(T)` or the [`CacheError`] of the
/// computation that should have produced it.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
