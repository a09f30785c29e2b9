// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic job triggers.
//!
//! The engine only needs "run this every interval" for reclaim sweeps and
//! scheduled backfill. [`Scheduler`] is the seam for plugging in an external
//! (e.g. leader-elected) scheduler; [`IntervalScheduler`] runs jobs on tokio
//! timers in this process.
//!
//! A job never overlaps itself: each job has one task that awaits the run
//! before waiting for the next tick, and ticks missed while running are
//! skipped.

use crate::error::{RelayError, Result};
use crate::messaging::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

/// A job body. Called once per tick.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a job.
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, ()>)
}

/// Runs named jobs periodically.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `job` every `every`, first after one full interval.
    fn schedule(&self, name: &str, every: Duration, job: JobFn) -> Result<()>;

    /// Names of scheduled jobs.
    fn jobs(&self) -> Vec<String>;

    /// Stop all jobs, letting a running one finish within `timeout`.
    fn shutdown<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ()>;
}

/// In-process [`Scheduler`] on tokio intervals.
pub struct IntervalScheduler {
    shutdown_tx: watch::Sender<bool>,
    jobs: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for IntervalScheduler {
    fn default() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            jobs: Mutex::new(Vec::new()),
        }
    }
}

impl IntervalScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Scheduler for IntervalScheduler {
    fn schedule(&self, name: &str, every: Duration, job: JobFn) -> Result<()> {
        if every.is_zero() {
            return Err(RelayError::Config(format!("job {} has a zero interval", name)));
        }
        if *self.shutdown_tx.borrow() {
            return Err(RelayError::Shutdown);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let span = info_span!("job", job = %name);
        let handle = tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(every);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately.
                timer.tick().await;
                info!(interval_ms = every.as_millis() as u64, "Job scheduled");

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        _ = timer.tick() => {
                            let started = Instant::now();
                            match job().await {
                                Ok(()) => debug!(duration_ms = started.elapsed().as_millis() as u64, "Job run complete"),
                                Err(e) => warn!(error = %e, duration_ms = started.elapsed().as_millis() as u64, "Job run failed"),
                            }
                        }
                    }
                }
                debug!("Job stopped");
            }
            .instrument(span),
        );

        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.to_string(), handle));
        Ok(())
    }

    fn jobs(&self) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn shutdown<'a>(&'a self, timeout: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.shutdown_tx.send(true);
            let jobs: Vec<_> = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

            for (name, handle) in jobs {
                let abort = handle.abort_handle();
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(())) => debug!(job = %name, "Job completed gracefully"),
                    Ok(Err(e)) => warn!(job = %name, error = %e, "Job panicked during shutdown"),
                    Err(_) => {
                        warn!(job = %name, "Job timed out during shutdown, aborting");
                        abort.abort();
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_job_runs_periodically() {
        let scheduler = IntervalScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        scheduler
            .schedule(
                "count",
                Duration::from_millis(20),
                job_fn(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown(Duration::from_secs(1)).await.unwrap();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 runs, got {}", seen);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_running() {
        let scheduler = IntervalScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        scheduler
            .schedule(
                "flaky",
                Duration::from_millis(10),
                job_fn(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(RelayError::broker_msg("XPENDING", "connection reset"))
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_input() {
        let scheduler = IntervalScheduler::new();
        let noop = job_fn(|| async { Ok(()) });

        assert!(matches!(
            scheduler.schedule("zero", Duration::ZERO, Arc::clone(&noop)),
            Err(RelayError::Config(_))
        ));

        scheduler.shutdown(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(
            scheduler.schedule("late", Duration::from_secs(1), noop),
            Err(RelayError::Shutdown)
        ));
        assert!(scheduler.jobs().is_empty());
    }
}
