//! Named recurring and one-shot jobs, dispatched onto a bounded worker
//! pool, with a `stop()` that cancels every job's cooperative cancel flag
//! and blocks until all in-flight job futures have returned.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Cooperative cancellation flag passed to every job; hot loops inside a
/// job should check it before each unit of work.
pub type CancelFlag = Arc<AtomicBool>;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct RecurringJob {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

struct OneShotSlot {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// Worker pool + recurring-job registry. Clone-and-share via `Arc` since
/// jobs are dispatched from several call sites (rotation checks, config
/// reloads, `RebuildMissingIndexes`).
pub struct Scheduler {
    recurring: Mutex<HashMap<String, RecurringJob>>,
    one_shot: Mutex<Vec<OneShotSlot>>,
    descriptions: Mutex<HashMap<String, String>>,
    semaphore: Mutex<Arc<Semaphore>>,
    max_concurrent: AtomicUsize,
}

impl Scheduler {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            recurring: Mutex::new(HashMap::new()),
            one_shot: Mutex::new(Vec::new()),
            descriptions: Mutex::new(HashMap::new()),
            semaphore: Mutex::new(Arc::new(Semaphore::new(max_concurrent_jobs.max(1)))),
            max_concurrent: AtomicUsize::new(max_concurrent_jobs.max(1)),
        }
    }

    /// Takes effect for subsequent dispatches; jobs already holding a
    /// permit from the old semaphore are unaffected.
    pub fn update_max_concurrent_jobs(&self, n: usize) {
        let n = n.max(1);
        self.max_concurrent.store(n, Ordering::Relaxed);
        *self.semaphore.lock() = Arc::new(Semaphore::new(n));
    }

    pub fn describe(&self, name: &str, text: &str) {
        self.descriptions.lock().insert(name.to_string(), text.to_string());
    }

    /// Schedules `job` to run every `period`. A duplicate name cancels and
    /// replaces the previous job under that name (fire-and-forget; does
    /// not wait for the old instance's current tick to finish).
    pub fn run<F>(&self, name: &str, period: std::time::Duration, job: F)
    where
        F: Fn(CancelFlag) -> BoxFuture + Send + Sync + 'static,
    {
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let cancel_for_task = cancel.clone();
        let job = Arc::new(job);
        let name_owned = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if cancel_for_task.load(Ordering::Relaxed) {
                    break;
                }
                job(cancel_for_task.clone()).await;
                if cancel_for_task.load(Ordering::Relaxed) {
                    break;
                }
            }
            info!("recurring job '{}' stopped", name_owned);
        });

        let mut recurring = self.recurring.lock();
        if let Some(old) = recurring.insert(name.to_string(), RecurringJob { cancel, handle }) {
            old.cancel.store(true, Ordering::Relaxed);
            old.handle.abort();
        }
    }

    /// Enqueues a one-shot job onto the bounded worker pool. Blocks (async)
    /// until a slot is free, matching "scheduler dispatch blocks when all
    /// worker slots are busy".
    pub async fn run_once<F>(&self, name: &str, job: F)
    where
        F: FnOnce(CancelFlag) -> BoxFuture + Send + 'static,
    {
        let semaphore = self.semaphore.lock().clone();
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed during shutdown
        };

        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let cancel_for_task = cancel.clone();
        let name_owned = name.to_string();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            job(cancel_for_task).await;
        });

        self.one_shot.lock().push(OneShotSlot { cancel, handle });
        let _ = name_owned;
    }

    /// Cancels every running job's cancel flag, then awaits every handle.
    /// Idempotent: a second call finds nothing left to stop.
    pub async fn stop(&self) {
        let recurring: Vec<_> = self.recurring.lock().drain().collect();
        for (_, job) in &recurring {
            job.cancel.store(true, Ordering::Relaxed);
        }
        for (name, job) in recurring {
            job.handle.abort();
            if let Err(e) = job.handle.await {
                if !e.is_cancelled() {
                    error!("recurring job '{}' panicked: {}", name, e);
                }
            }
        }

        let one_shot: Vec<_> = self.one_shot.lock().drain(..).collect();
        for slot in &one_shot {
            slot.cancel.store(true, Ordering::Relaxed);
        }
        for slot in one_shot {
            if let Err(e) = slot.handle.await {
                if !e.is_cancelled() {
                    error!("one-shot job panicked: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn run_once_respects_max_concurrency() {
        let scheduler = Scheduler::new(1);
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            scheduler
                .run_once("job", move |_cancel| {
                    Box::pin(async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .await;
        }
        scheduler.stop().await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_jobs() {
        let scheduler = Scheduler::new(4);
        let done = Arc::new(AtomicBool::new(false));
        let done_for_job = done.clone();
        scheduler
            .run_once("slow", move |_cancel| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    done_for_job.store(true, Ordering::SeqCst);
                })
            })
            .await;
        scheduler.stop().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn duplicate_recurring_name_replaces_previous() {
        let scheduler = Scheduler::new(4);
        let first_ticks = Arc::new(AtomicU32::new(0));
        let second_ticks = Arc::new(AtomicU32::new(0));

        let f1 = first_ticks.clone();
        scheduler.run("tick", Duration::from_millis(5), move |_cancel| {
            let f1 = f1.clone();
            Box::pin(async move {
                f1.fetch_add(1, Ordering::SeqCst);
            })
        });

        let f2 = second_ticks.clone();
        scheduler.run("tick", Duration::from_millis(5), move |_cancel| {
            let f2 = f2.clone();
            Box::pin(async move {
                f2.fetch_add(1, Ordering::SeqCst);
            })
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.stop().await;
        assert_eq!(first_ticks.load(Ordering::SeqCst), 0);
        assert!(second_ticks.load(Ordering::SeqCst) > 0);
    }
}
