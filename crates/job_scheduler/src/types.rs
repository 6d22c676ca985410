use std::time::Duration;

use chrono::{DateTime, Utc};

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fire exactly once at the given instant, then remove the job.
    Once(DateTime<Utc>),
    /// Fire every `period`, starting one period after registration.
    /// Ticks that elapse while a run is still in flight are skipped.
    Interval(Duration),
}

/// How an id collision is resolved when adding or cancelling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail with [`SchedulerError::ConflictingId`] on add, or
    /// [`SchedulerError::JobNotFound`] when cancelling a missing id.
    Exception,
    /// Abort the existing job and register the new one in its place.
    Replace,
    /// Keep whatever is registered and return successfully.
    DoNothing,
}

/// Errors raised by the scheduler.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// A job with this id is already registered.
    #[error("Job id {0:?} is already scheduled")]
    ConflictingId(String),

    /// No job with this id is registered.
    #[error("No job with id {0:?}")]
    JobNotFound(String),

    /// The trigger can never fire, e.g. a zero interval.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// The scheduler has been stopped and accepts no further jobs.
    #[error("Scheduler is stopped")]
    Stopped,
}
