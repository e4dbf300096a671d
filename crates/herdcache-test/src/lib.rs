//! Helpers for testing caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Most tests run with a paused tokio clock (`tokio::time::pause`). Computations built with
//!    [`slow_value`] and [`failing`] sleep on that clock, so advancing it is what makes them
//!    complete.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, for example `let cache_dir = test::tempdir();`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The future returned by the computations in this module.
pub type ComputeFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `herdcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("herdcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts how often computations were started.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of computations started so far.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A computation that takes `delay` to produce `value`.
///
/// The start of the computation is recorded in `calls`.
pub fn slow_value<T>(
    calls: &Calls,
    delay: Duration,
    value: T,
) -> impl FnOnce() -> ComputeFuture<T> + Send + 'static
where
    T: Send + 'static,
{
    let calls = calls.clone();
    move || {
        Box::pin(async move {
            calls.record();
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }
}

/// A computation that fails with `message` after `delay`.
///
/// The start of the computation is recorded in `calls`.
pub fn failing<T>(
    calls: &Calls,
    delay: Duration,
    message: &'static str,
) -> impl FnOnce() -> ComputeFuture<T> + Send + 'static
where
    T: Send + 'static,
{
    let calls = calls.clone();
    move || {
        Box::pin(async move {
            calls.record();
            tokio::time::sleep(delay).await;
            Err(anyhow::anyhow!(message))
        })
    }
}
