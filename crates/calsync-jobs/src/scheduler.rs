use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MIN_INTERVAL_MINUTES: u32 = 1;
const MAX_INTERVAL_MINUTES: u32 = 720;

/// Normalize an interval to the supported scheduler boundaries.
pub fn clamp_interval(minutes: u32) -> u32 {
    if minutes < MIN_INTERVAL_MINUTES {
        warn!("Interval {minutes} is below minimum, normalizing to {MIN_INTERVAL_MINUTES} minute");
        MIN_INTERVAL_MINUTES
    } else if minutes > MAX_INTERVAL_MINUTES {
        warn!(
            "Interval {minutes} exceeds maximum, normalizing to {MAX_INTERVAL_MINUTES} minutes"
        );
        MAX_INTERVAL_MINUTES
    } else {
        minutes
    }
}

/// One periodic tokio task per job id, with replace-on-reschedule semantics.
#[derive(Debug, Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` every `minutes` minutes. An existing timer under the
    /// same id is replaced. The first run happens after one full interval.
    pub fn schedule_job<F, Fut>(&self, job_id: &str, minutes: u32, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let minutes = clamp_interval(minutes);
        let mut jobs = self.jobs.lock().expect("scheduler state poisoned");
        if let Some(handle) = jobs.remove(job_id) {
            debug!("Rescheduling existing job {job_id}");
            handle.abort();
        }

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(u64::from(minutes) * 60));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; consume it so the job runs on
            // the interval, not at schedule time.
            interval.tick().await;
            loop {
                interval.tick().await;
                task().await;
            }
        });
        jobs.insert(job_id.to_string(), handle);
        info!("Scheduled job {job_id} every {minutes} minutes");
    }

    pub fn cancel_job(&self, job_id: &str) {
        let mut jobs = self.jobs.lock().expect("scheduler state poisoned");
        if let Some(handle) = jobs.remove(job_id) {
            handle.abort();
            info!("Cancelled job {job_id}");
        }
    }

    pub fn is_job_active(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .expect("scheduler state poisoned")
            .contains_key(job_id)
    }

    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().expect("scheduler state poisoned");
        if !jobs.is_empty() {
            info!("Shutting down background scheduler");
        }
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn clamps_interval_to_bounds() {
        assert_eq!(clamp_interval(0), 1);
        assert_eq!(clamp_interval(5), 5);
        assert_eq!(clamp_interval(10_000), 720);
    }

    /// Let spawned scheduler tasks register their timers and react to clock
    /// advances under paused time.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_the_interval_and_replaces_on_reschedule() {
        let scheduler = Scheduler::new();
        let first_runs = Arc::new(AtomicU32::new(0));
        let second_runs = Arc::new(AtomicU32::new(0));

        {
            let runs = first_runs.clone();
            scheduler.schedule_job("auto-sync", 1, move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert!(scheduler.is_job_active("auto-sync"));

        settle().await;
        assert_eq!(first_runs.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert!(first_runs.load(Ordering::SeqCst) >= 1);

        // Rescheduling replaces the timer; the first closure stops running.
        {
            let runs = second_runs.clone();
            scheduler.schedule_job("auto-sync", 1, move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        settle().await;
        let first_count = first_runs.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(first_runs.load(Ordering::SeqCst), first_count);
        assert!(second_runs.load(Ordering::SeqCst) >= 1);

        scheduler.cancel_job("auto-sync");
        assert!(!scheduler.is_job_active("auto-sync"));
    }
}
