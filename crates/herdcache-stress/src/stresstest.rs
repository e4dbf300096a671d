use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use herdcache::caching::{Cacher, Caches, SharedCacheService};
use herdcache::config::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, process_request};

/// The results of running a single workload.
struct WorkloadResult {
    concurrency: usize,
    cache: String,
    task_durations: DDSketch,
    errors: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let shared_cache = SharedCacheService::new(config.shared_cache.clone(), runtime);
    let caches = Caches::from_config(&config);

    // workloads using the same cache share one instance of it
    let mut cachers: BTreeMap<String, Cacher<String>> = BTreeMap::new();
    for workload in &workloads.workloads {
        if !cachers.contains_key(&workload.cache) {
            let cacher = caches
                .cacher(&workload.cache, Arc::clone(&shared_cache))
                .with_context(|| format!("cache `{}` is not configured", workload.cache))?;
            cachers.insert(workload.cache.clone(), cacher);
        }
    }

    let computations: BTreeMap<String, Arc<AtomicUsize>> = cachers
        .keys()
        .map(|name| (name.clone(), Arc::default()))
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for workload in workloads.workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cacher = cachers[&workload.cache].clone();
        let computations = Arc::clone(&computations[&workload.cache]);
        let workload = Arc::new(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cacher = cacher.clone();
                        let computations = Arc::clone(&computations);
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if let Err(err) = process_request(&cacher, &workload, &computations).await {
                                tracing::warn!(error = &err as &dyn std::error::Error, "Request failed");
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            tokio::time::sleep(workload.think_time).await;
                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *task_durations)
            };

            WorkloadResult {
                concurrency,
                cache: workload.cache.clone(),
                task_durations,
                errors: errors.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let WorkloadResult {
            concurrency,
            cache,
            task_durations,
            errors,
        } = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({cache}, concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    for (name, cacher) in &cachers {
        let computations = computations[name].load(Ordering::Relaxed);
        println!("Cache {name}: {computations} computations");
        cacher.shutdown().await;
    }

    Ok(())
}
