//! Named periodic jobs driven by an injectable clock
//!
//! `tick(now)` runs whatever is due and is all the tests need; `run` just
//! calls it from a tokio interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::clock::{Clock, after};

/// A periodic job body; receives the tick time
pub type JobFn = Arc<dyn Fn(DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    name: String,
    every: Duration,
    next_due: DateTime<Utc>,
    runs: u64,
    job: JobFn,
}

/// Per-job status
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobStatus {
    /// Job name
    pub name: String,
    /// Period
    pub every_ms: u64,
    /// Next due time
    pub next_due: DateTime<Utc>,
    /// Completed runs
    pub runs: u64,
}

/// Periodic job registry
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    jobs: Mutex<Vec<Entry>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.lock().len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Register `job` to run every `every`, first at the next tick.
    ///
    /// Registering an existing name replaces that job.
    pub fn register(&self, name: impl Into<String>, every: Duration, job: JobFn) {
        let name = name.into();
        let entry = Entry {
            name: name.clone(),
            every,
            next_due: self.clock.now(),
            runs: 0,
            job,
        };
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.iter_mut().find(|e| e.name == name) {
            debug!(job = %name, "Replacing scheduled job");
            *existing = entry;
        } else {
            debug!(job = %name, every_ms = every.as_millis(), "Scheduled job");
            jobs.push(entry);
        }
    }

    /// Remove a job
    pub fn unregister(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|e| e.name != name);
        jobs.len() != before
    }

    /// Run every job due at `now`; returns their names in registration order.
    ///
    /// A job that fell several periods behind runs once, then resumes its
    /// cadence from `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<(String, JobFn)> = {
            let mut jobs = self.jobs.lock();
            jobs.iter_mut()
                .filter(|e| e.next_due <= now)
                .map(|e| {
                    e.next_due = after(now, e.every);
                    e.runs += 1;
                    (e.name.clone(), Arc::clone(&e.job))
                })
                .collect()
        };

        for (name, job) in &due {
            trace!(job = %name, "Running job");
            job(now).await;
        }
        due.into_iter().map(|(name, _)| name).collect()
    }

    /// Job status, in registration order
    #[must_use]
    pub fn jobs(&self) -> Vec<JobStatus> {
        self.jobs
            .lock()
            .iter()
            .map(|e| JobStatus {
                name: e.name.clone(),
                every_ms: u64::try_from(e.every.as_millis()).unwrap_or(u64::MAX),
                next_due: e.next_due,
                runs: e.runs,
            })
            .collect()
    }

    /// Drive `tick` every `resolution` until `shutdown` fires
    pub async fn run(&self, resolution: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(resolution);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(self.clock.now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Scheduler stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn counting(counter: &Arc<AtomicU32>) -> JobFn {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn jobs_run_on_their_cadence() {
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Scheduler::new(clock.clone());
        let fast = Arc::new(AtomicU32::new(0));
        let slow = Arc::new(AtomicU32::new(0));
        scheduler.register("watchdog", Duration::from_secs(1), counting(&fast));
        scheduler.register("health_poll", Duration::from_secs(15), counting(&slow));

        assert_eq!(scheduler.tick(t0()).await, vec!["watchdog", "health_poll"]);
        for s in 1..=15 {
            scheduler.tick(t0() + chrono::Duration::seconds(s)).await;
        }

        assert_eq!(fast.load(Ordering::SeqCst), 16);
        assert_eq!(slow.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn re_registering_replaces() {
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Scheduler::new(clock);
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        scheduler.register("health_poll", Duration::from_secs(1), counting(&first));
        scheduler.register("health_poll", Duration::from_secs(1), counting(&second));

        scheduler.tick(t0()).await;
        assert_eq!(scheduler.jobs().len(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missed_periods_run_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Scheduler::new(clock);
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.register("alert_digest", Duration::from_secs(60), counting(&counter));

        scheduler.tick(t0()).await;
        scheduler.tick(t0() + chrono::Duration::hours(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(scheduler.tick(t0() + chrono::Duration::seconds(3630)).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_stops_job() {
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Scheduler::new(clock);
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.register("watchdog", Duration::from_secs(1), counting(&counter));
        assert!(scheduler.unregister("watchdog"));
        assert!(!scheduler.unregister("watchdog"));
        assert!(scheduler.tick(t0()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Arc::new(Scheduler::new(clock));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.register("watchdog", Duration::from_secs(1), counting(&counter));

        let (tx, rx) = broadcast::channel(1);
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(Duration::from_millis(100), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        runner.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
