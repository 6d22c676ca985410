use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, info};

use crate::types::*;

/// A registered job as seen by the job table.
struct JobEntry {
    trigger: Trigger,
    /// Distinguishes a job from a later one registered under the same id.
    generation: u64,
    handle: AbortHandle,
}

struct Inner {
    jobs: Mutex<HashMap<String, JobEntry>>,
    generation: AtomicU64,
    stopped: watch::Sender<bool>,
}

/// In-process job scheduler with a string-keyed job table.
///
/// Every job runs on its own tokio task. Registration and removal go through a
/// single lock on the job table, so "insert if absent" and "remove if present"
/// are atomic with respect to concurrent callers and to one-shot jobs
/// removing themselves when they fire.
///
/// Cloning is cheap and every clone drives the same job table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates an empty, running scheduler.
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                stopped,
            }),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a job that runs once at `when` and then removes itself.
    /// Instants in the past fire immediately.
    pub fn add_once<F, Fut>(
        &self,
        id: impl Into<String>,
        when: DateTime<Utc>,
        policy: ConflictPolicy,
        job: F,
    ) -> Result<String, SchedulerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let scheduler = self.clone();
        let task_id = id.clone();

        self.register(id, Trigger::Once(when), policy, move |generation| {
            tokio::spawn(async move {
                sleep(delay).await;
                if !scheduler.take_if_current(&task_id, generation) {
                    return;
                }
                debug!("Running job {}", task_id);
                job().await;
            })
        })
    }

    /// Registers a job that runs every `period`, starting one period from now.
    pub fn add_recurring<F, Fut>(
        &self,
        id: impl Into<String>,
        period: Duration,
        policy: ConflictPolicy,
        job: F,
    ) -> Result<String, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        if period.is_zero() {
            return Err(SchedulerError::InvalidTrigger(format!(
                "job {id:?} has a zero period"
            )));
        }
        let task_id = id.clone();

        self.register(id, Trigger::Interval(period), policy, move |_| {
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    ticker.tick().await;
                    debug!("Running job {}", task_id);
                    job().await;
                }
            })
        })
    }

    fn register<S>(
        &self,
        id: String,
        trigger: Trigger,
        policy: ConflictPolicy,
        spawn: S,
    ) -> Result<String, SchedulerError>
    where
        S: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut jobs = self.jobs();
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        if let Some(existing) = jobs.get(&id) {
            match policy {
                ConflictPolicy::Exception => return Err(SchedulerError::ConflictingId(id)),
                ConflictPolicy::DoNothing => {
                    debug!("Job {} already scheduled, leaving it in place", id);
                    return Ok(id);
                }
                ConflictPolicy::Replace => {
                    debug!("Replacing job {}", id);
                    existing.handle.abort();
                }
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let handle = spawn(generation).abort_handle();
        jobs.insert(
            id.clone(),
            JobEntry {
                trigger,
                generation,
                handle,
            },
        );

        Ok(id)
    }

    /// Removes the entry for `id` if it still belongs to `generation`.
    fn take_if_current(&self, id: &str, generation: u64) -> bool {
        let mut jobs = self.jobs();
        match jobs.get(id) {
            Some(entry) if entry.generation == generation => {
                jobs.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Removes a job and aborts it if it has not fired yet.
    ///
    /// Returns whether a job was removed. A missing id is an error only under
    /// [`ConflictPolicy::Exception`].
    pub fn cancel(&self, id: &str, policy: ConflictPolicy) -> Result<bool, SchedulerError> {
        match self.jobs().remove(id) {
            Some(entry) => {
                entry.handle.abort();
                debug!("Cancelled job {}", id);
                Ok(true)
            }
            None if policy == ConflictPolicy::Exception => {
                Err(SchedulerError::JobNotFound(id.to_string()))
            }
            None => Ok(false),
        }
    }

    /// Whether a job with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.jobs().contains_key(id)
    }

    /// The trigger of a registered job.
    pub fn trigger(&self, id: &str) -> Option<Trigger> {
        self.jobs().get(id).map(|entry| entry.trigger)
    }

    /// Ids of all registered jobs, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops the scheduler: aborts every job and rejects further registrations.
    /// In-flight job runs are not awaited.
    pub fn stop(&self) {
        // Flipped under the table lock so no registration can slip in after the drain
        let mut jobs = self.jobs();
        if self.inner.stopped.send_replace(true) {
            return;
        }

        for (_, entry) in jobs.drain() {
            entry.handle.abort();
        }
        info!("Scheduler stopped");
    }

    /// Whether [`Scheduler::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }

    /// Waits until the scheduler is stopped.
    pub async fn run_until_stopped(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        // The sender lives as long as `self`, so this only returns once stopped
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
