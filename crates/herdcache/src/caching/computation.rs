//! Request coalescing for concurrent computations of the same key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use sentry::{Hub, SentryFutureExt};
use tokio_util::task::TaskTracker;

use super::{CacheEntry, CacheError, CacheKey, CacheName};
use crate::utils::futures::CallOnDrop;

type ComputationChannel<T> = Shared<oneshot::Receiver<CacheEntry<T>>>;

type ComputationMap<T> = Arc<Mutex<HashMap<CacheKey, ComputationChannel<T>>>>;

/// Keeps track of all the computations currently running for a cache.
///
/// At most one computation runs per key at any time. Concurrent requests for the same key attach
/// to the running computation and all receive its result.
///
/// Computations are spawned as independent tasks. Dropping the future returned by
/// [`run_exclusive`](Self::run_exclusive) only stops waiting, it never cancels the computation
/// itself.
pub struct Computations<T> {
    name: CacheName,
    current: ComputationMap<T>,
    tasks: TaskTracker,
    max_lazy_refreshes: Arc<AtomicIsize>,
}

impl<T> Clone for Computations<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            current: Arc::clone(&self.current),
            tasks: self.tasks.clone(),
            max_lazy_refreshes: Arc::clone(&self.max_lazy_refreshes),
        }
    }
}

impl<T> std::fmt::Debug for Computations<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computations")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<T> Computations<T> {
    /// The number of computations that are currently running.
    pub fn in_flight(&self) -> usize {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether a computation for `key` is currently running.
    #[cfg(test)]
    pub(crate) fn is_running(&self, key: &CacheKey) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

fn report_in_flight(name: &CacheName, in_flight: usize) {
    metric!(
        gauge("caches.computation.in_flight") = in_flight as u64,
        "cache" => name.as_ref(),
    );
}

impl<T: Clone + Send + Sync + 'static> Computations<T> {
    /// Creates a new set of computations.
    ///
    /// Every computation is spawned on `tasks`. At most `max_lazy_refreshes` refreshes can run
    /// concurrently, shared by everyone holding the same counter.
    pub fn new(name: CacheName, tasks: TaskTracker, max_lazy_refreshes: Arc<AtomicIsize>) -> Self {
        Self {
            name,
            current: Default::default(),
            tasks,
            max_lazy_refreshes,
        }
    }

    /// Runs the computation built by `make_computation`, unless one is already running for `key`.
    ///
    /// `make_computation` is only invoked if no computation for `key` is running. In either case,
    /// the returned future resolves to the result of the running computation.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the computation
    /// on an executor, even if you don't explicitly `await` its results.
    pub fn run_exclusive<F, Fut>(
        &self,
        key: &CacheKey,
        make_computation: F,
    ) -> BoxFuture<'static, CacheEntry<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let channel = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(channel) = current.get(key) {
                // A concurrent cache lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1, "cache" => self.name.as_ref());
                channel.clone()
            } else {
                // A concurrent cache lookup is considered new. This does not imply a cache miss.
                metric!(counter("caches.channel.miss") += 1, "cache" => self.name.as_ref());

                let channel = self.create_channel(key.clone(), make_computation(), None);
                current.insert(key.clone(), channel.clone());
                report_in_flight(&self.name, current.len());
                channel
            }
        };

        let name = self.name.clone();
        channel
            .unwrap_or_else(move |_cancelled| {
                tracing::error!("{name} computation channel dropped");
                Err(CacheError::InternalError)
            })
            .boxed()
    }

    /// Spawns a background refresh of `key`, unless a computation for it is already running.
    ///
    /// Refreshes are not awaited by anyone. Failures are logged, and otherwise dropped.
    /// Returns `true` if a new refresh was started.
    pub fn spawn_refresh<F, Fut>(&self, key: &CacheKey, make_computation: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.contains_key(key) {
            return false;
        }

        // We count down towards zero, and if we reach or surpass it, we will stop here.
        if self.max_lazy_refreshes.fetch_sub(1, Ordering::Relaxed) <= 0 {
            self.max_lazy_refreshes.fetch_add(1, Ordering::Relaxed);

            metric!(counter("caches.lazy_limit_hit") += 1, "cache" => self.name.as_ref());
            return false;
        }

        tracing::trace!("Spawning deduplicated {} refresh for key {:?}", self.name, key);

        let max_lazy_refreshes = Arc::clone(&self.max_lazy_refreshes);
        let channel = self.create_channel(key.clone(), make_computation(), Some(max_lazy_refreshes));
        current.insert(key.clone(), channel);
        report_in_flight(&self.name, current.len());
        true
    }

    /// Creates a shareable channel that runs the computation on a spawned task.
    ///
    /// In case `lazy_limit` is set, this is a background refresh that gives back its slot in the
    /// limit once it is done.
    fn create_channel<Fut>(
        &self,
        key: CacheKey,
        computation: Fut,
        lazy_limit: Option<Arc<AtomicIsize>>,
    ) -> ComputationChannel<T>
    where
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let is_refresh = lazy_limit.is_some();

        let current = Arc::clone(&self.current);
        let remove_computation_token = {
            let key = key.clone();
            let name = self.name.clone();
            CallOnDrop::new(move || {
                if let Some(lazy_limit) = lazy_limit {
                    lazy_limit.fetch_add(1, Ordering::Relaxed);
                }
                let mut current = current.lock().unwrap_or_else(PoisonError::into_inner);
                current.remove(&key);
                report_in_flight(&name, current.len());
            })
        };

        let name = self.name.clone();
        let channel = async move {
            // only start an independent transaction if this is a "background" task,
            // otherwise it will not "outlive" its parent span, so attach it to the parent transaction.
            let transaction = if is_refresh {
                let span = sentry::configure_scope(|scope| scope.get_span());
                let ctx = sentry::TransactionContext::continue_from_span(
                    "Lazy Cache Computation",
                    "spawn_computation",
                    span,
                );
                let transaction = sentry::start_transaction(ctx);
                sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));
                Some(transaction)
            } else {
                None
            };

            let result = computation.await;

            if is_refresh {
                let status = match &result {
                    Ok(_) => "ok",
                    Err(err) => {
                        tracing::error!(
                            error = err as &dyn std::error::Error,
                            "Failed to refresh {name} entry {key}",
                        );
                        err.metrics_tag()
                    }
                };
                metric!(
                    counter("caches.refresh") += 1,
                    "cache" => name.as_ref(),
                    "status" => status,
                );
            }

            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            if let Some(transaction) = transaction {
                transaction.finish();
            }
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        self.tasks.spawn(channel);

        receiver.shared()
    }
}
