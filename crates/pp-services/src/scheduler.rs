//! Periodic and one-shot background jobs.
//!
//! Each job runs on its own task. `stop` (or dropping the scheduler) cancels
//! every job, including one that is mid-run.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct Scheduler {
    shutdown: broadcast::Sender<()>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            jobs: Mutex::new(Vec::new()),
        }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` every `every`, first after one full interval.
    /// A run that overlaps the next tick delays it rather than stacking.
    pub fn add_repeating<F, Fut>(&self, name: &'static str, every: Duration, action: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let every = every.max(Duration::from_millis(1));
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,

                    _ = ticker.tick() => {
                        tracing::trace!(job = name, "running scheduled job");
                        action().await;
                    }
                }
            }
            tracing::debug!(job = name, "scheduled job stopped");
        });
        tracing::debug!(job = name, every_ms = every.as_millis() as u64, "repeating job added");
        self.track(handle);
    }

    /// Run `action` once after `delay`.
    pub fn add_delayed<F, Fut>(&self, name: &'static str, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.recv() => {}

                _ = tokio::time::sleep(delay) => {
                    tracing::trace!(job = name, "running delayed job");
                    action().await;
                }
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    /// Jobs that haven't finished yet.
    pub fn active_jobs(&self) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancel every job. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in jobs.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
