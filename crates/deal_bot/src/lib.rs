//! # Deal Bot
//!
//! Watches the account's favorite listings, reserves stock the moment it appears,
//! keeps reservations alive until they can be paid, and times polling bursts to
//! announced restocks.

/// Environment, item list and credential file configuration.
mod config;
pub use config::*;

/// Field-level differences between two snapshots.
mod diff;
pub use diff::*;

/// Decides how each newly observed snapshot is handled.
mod change_detector;
pub use change_detector::*;

/// Shared tracked/held/snipe registries.
mod state;
pub use state::*;

/// Hold, catch, order and snipe workflows plus the favorites scan.
mod orchestrator;
pub use orchestrator::*;
