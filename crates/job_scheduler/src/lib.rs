//! # Job Scheduler
//!
//! An in-process job table keyed by stable string ids.
//! Jobs are either one-shot (fire once at an instant) or recurring (fire every period),
//! and id collisions at registration time are resolved by a [`ConflictPolicy`].

/// Types shared by the scheduler: triggers, conflict policies and errors.
mod types;
pub use types::*;

/// The scheduler itself.
mod scheduler;
pub use scheduler::*;
