use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The pipeline ran `runs` times: once for the tick itself, plus once
    /// more for each run during which a tick was skipped.
    Ran { runs: u32 },
    /// Another run held the job.
    Skipped,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobStats {
    pub name: &'static str,
    pub state: JobState,
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
}

/// One collection job kind.
///
/// The lock is taken with `try_lock`, so a tick that lands on a running job
/// is dropped instead of queued. Dropped ticks only set `pending`; once the
/// current run has released the lock it runs exactly once more if the flag is
/// set, however many ticks were dropped.
pub struct Job {
    name: &'static str,
    lock: Mutex<()>,
    running: AtomicBool,
    pending: AtomicBool,
    runs: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Job {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Mutex::new(()),
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> JobState {
        if self.running.load(Ordering::SeqCst) {
            JobState::Running
        } else {
            JobState::Idle
        }
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            name: self.name,
            state: self.state(),
            runs: self.runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Handles one tick. Pipeline errors are logged here and never escape;
    /// the job is idle again when this returns, whatever the outcome.
    pub async fn tick<F, Fut, E>(&self, pipeline: F) -> TickOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut runs = 0;
        loop {
            let Ok(lock) = self.lock.try_lock() else {
                if runs > 0 {
                    // Whoever holds the lock started after the skip and covers it.
                    break;
                }
                self.pending.store(true, Ordering::SeqCst);
                let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!("{}: still running, tick skipped ({skipped} so far)", self.name);
                return TickOutcome::Skipped;
            };
            self.running.store(true, Ordering::SeqCst);
            let running = RunningFlag(&self.running);
            if runs == 0 {
                // A skip recorded before we got the lock is covered by this run.
                self.pending.store(false, Ordering::SeqCst);
            }

            let started = Instant::now();
            match pipeline().await {
                Ok(()) => tracing::debug!("{}: run finished in {:?}", self.name, started.elapsed()),
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("{}: run failed after {:?}: {e}", self.name, started.elapsed());
                }
            }
            runs += 1;
            self.runs.fetch_add(1, Ordering::Relaxed);

            // Checked after unlocking so a tick that lands while the lock is
            // still held is never lost.
            drop(running);
            drop(lock);
            if !self.pending.swap(false, Ordering::SeqCst) {
                break;
            }
            tracing::info!("{}: tick was skipped during the last run, running again", self.name);
        }
        TickOutcome::Ran { runs }
    }

    /// Manual run for startup priming. Shares the tick lock, so it is
    /// skipped if a scheduled run is already in flight.
    pub async fn run_once<F, Fut, E>(&self, pipeline: F) -> TickOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        tracing::info!("{}: priming run", self.name);
        self.tick(pipeline).await
    }
}

/// Fires `job` every `period` on the runtime. Each tick is its own task so a
/// slow run never holds up the timer; overlapping ticks hit the job's lock.
pub fn spawn_interval<F, Fut, E>(job: Arc<Job>, period: Duration, pipeline: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("{}: scheduled every {}s", job.name(), period.as_secs());

        loop {
            interval.tick().await;
            let job = Arc::clone(&job);
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                job.tick(pipeline).await;
            });
        }
    })
}
