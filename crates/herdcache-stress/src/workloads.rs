use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use herdcache::caching::{CacheEntry, Cacher};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// The name of the cache to use.
    pub cache: String,
    /// The number of concurrent clients.
    pub concurrency: usize,
    /// The key all clients are asking for.
    #[serde(default = "default_key")]
    pub key: String,
    /// How long a single computation takes.
    #[serde(default = "default_compute_delay", with = "humantime_serde")]
    pub compute_delay: Duration,
    /// How long each client waits between two requests.
    #[serde(default, with = "humantime_serde")]
    pub think_time: Duration,
}

fn default_key() -> String {
    "k".into()
}

fn default_compute_delay() -> Duration {
    Duration::from_secs(3)
}

/// A simulated slow computation, counting how often it runs.
fn slow_computation(
    delay: Duration,
    computations: Arc<AtomicUsize>,
) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<String>> + Send + 'static {
    move || {
        async move {
            let computation = computations.fetch_add(1, Ordering::Relaxed) + 1;
            tokio::time::sleep(delay).await;
            Ok(format!("computation #{computation}"))
        }
        .boxed()
    }
}

/// Sends a single request of `workload` to `cacher`.
pub async fn process_request(
    cacher: &Cacher<String>,
    workload: &Workload,
    computations: &Arc<AtomicUsize>,
) -> CacheEntry<String> {
    let compute = slow_computation(workload.compute_delay, Arc::clone(computations));
    cacher.get_or_create(workload.key.as_str(), compute).await
}
