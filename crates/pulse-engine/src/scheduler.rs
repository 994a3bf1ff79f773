//! Named periodic jobs with misfire grace and at-most-one concurrent
//! execution per job. A one-second engine loop checks due times; due
//! handlers run as detached tasks so a slow job never stalls the loop.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

/// When a job fires: every N seconds, or on a cron expression (UTC).
#[derive(Debug, Clone)]
pub enum Cadence {
    Interval(u64),
    Cron(String),
}

pub type Handler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct JobSpec {
    pub name: &'static str,
    pub cadence: Cadence,
    /// A fire missed by at most this many seconds still runs once;
    /// beyond it the tick is skipped with a warning.
    pub grace_secs: i64,
    pub handler: Handler,
}

struct JobState {
    spec: JobSpec,
    next_run: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
}

/// Drain wait when stopping, before stragglers are abandoned.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    jobs: Mutex<Vec<JobState>>,
    active: AtomicBool,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn register(&self, spec: JobSpec) {
        let now = self.clock.now_utc();
        let next_run = compute_next_run(&spec.cadence, now);
        if next_run.is_none() {
            error!(job = spec.name, "invalid cadence — job will never fire");
        }
        info!(job = spec.name, ?next_run, "job registered");
        self.jobs.lock().unwrap().push(JobState {
            spec,
            next_run,
            running: Arc::new(AtomicBool::new(false)),
        });
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Main loop. Ticks once a second until `shutdown` flips, then
    /// drains in-flight handlers for a bounded time.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        self.active.store(true, Ordering::SeqCst);

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // No new ticks fire past this point.
        self.active.store(false, Ordering::SeqCst);
        info!("scheduler stopping, draining in-flight jobs");
        self.drain(std::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS))
            .await;
        info!("scheduler stopped");
    }

    /// One pass over the registry: fire due jobs, skip misfires past
    /// grace, drop ticks whose previous run is still in flight.
    pub fn tick(&self) {
        let now = self.clock.now_utc();
        let mut jobs = self.jobs.lock().unwrap();

        for job in jobs.iter_mut() {
            let Some(next_run) = job.next_run else {
                continue;
            };
            if now < next_run {
                continue;
            }

            let late = now - next_run;
            job.next_run = compute_next_run(&job.spec.cadence, now);

            if late > Duration::seconds(job.spec.grace_secs) {
                warn!(
                    job = job.spec.name,
                    late_secs = late.num_seconds(),
                    "misfire beyond grace, tick skipped"
                );
                continue;
            }

            // One concurrent execution per job: an overlapping tick is
            // dropped, which is not an error.
            if job.running.swap(true, Ordering::SeqCst) {
                debug!(job = job.spec.name, "previous run still active, tick dropped");
                continue;
            }

            let name = job.spec.name;
            let running = job.running.clone();
            let fut = (job.spec.handler)();
            tokio::spawn(async move {
                fut.await;
                running.store(false, Ordering::SeqCst);
                debug!(job = name, "job run finished");
            });
        }
    }

    /// Await in-flight handlers up to `timeout`, then abandon them.
    pub async fn drain(&self, timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let any_running = self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .any(|job| job.running.load(Ordering::SeqCst));
            if !any_running {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("drain timeout, abandoning in-flight jobs");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

/// Next fire time strictly after `after`.
fn compute_next_run(cadence: &Cadence, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match cadence {
        Cadence::Interval(secs) => Some(after + Duration::seconds(*secs as i64)),
        Cadence::Cron(expression) => {
            // The cron crate wants the seconds field prepended.
            let full = if expression.split_whitespace().count() == 5 {
                format!("0 {expression}")
            } else {
                expression.clone()
            };
            let schedule = cron::Schedule::from_str(&full).ok()?;
            schedule.after(&after).next()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move || -> BoxFuture<'static, ()> {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn interval_job_fires_when_due() {
        let clock = Arc::new(ManualClock::new(start()));
        let scheduler = Scheduler::new(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(JobSpec {
            name: "test",
            cadence: Cadence::Interval(30),
            grace_secs: 300,
            handler: counting_handler(counter.clone()),
        });

        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        clock.advance(Duration::seconds(30));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Same instant again: not due, nothing fires.
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn misfire_beyond_grace_skips() {
        let clock = Arc::new(ManualClock::new(start()));
        let scheduler = Scheduler::new(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(JobSpec {
            name: "test",
            cadence: Cadence::Interval(30),
            grace_secs: 60,
            handler: counting_handler(counter.clone()),
        });

        // Miss by 10 minutes — way past the 60 s grace.
        clock.advance(Duration::seconds(630));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Next scheduled fire runs normally.
        clock.advance(Duration::seconds(30));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn misfire_within_grace_fires_once() {
        let clock = Arc::new(ManualClock::new(start()));
        let scheduler = Scheduler::new(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(JobSpec {
            name: "test",
            cadence: Cadence::Interval(30),
            grace_secs: 300,
            handler: counting_handler(counter.clone()),
        });

        clock.advance(Duration::seconds(95));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_tick_is_dropped() {
        let clock = Arc::new(ManualClock::new(start()));
        let scheduler = Scheduler::new(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let handler: Handler = {
            let counter = counter.clone();
            let release = release.clone();
            Arc::new(move || -> BoxFuture<'static, ()> {
                let counter = counter.clone();
                let release = release.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                })
            })
        };
        scheduler.register(JobSpec {
            name: "slow",
            cadence: Cadence::Interval(10),
            grace_secs: 300,
            handler,
        });

        clock.advance(Duration::seconds(10));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Still running — the next due tick is dropped.
        clock.advance(Duration::seconds(10));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        release.notify_waiters();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        clock.advance(Duration::seconds(10));
        scheduler.tick();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cron_cadence_fires_at_midnight_utc() {
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 13, 45, 0).unwrap();
        let next = compute_next_run(&Cadence::Cron("0 0 * * *".to_string()), after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn bad_cron_yields_no_fire_time() {
        let after = start();
        assert!(compute_next_run(&Cadence::Cron("not a cron".to_string()), after).is_none());
    }
}
