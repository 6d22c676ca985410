//! # Notification Services
//!
//! This crate provides push notifications for the deal bot.
//! It includes the notification sink trait, an ntfy.sh publisher, a log-only sink and an in-memory mock.

/// Notification sink implementations.
pub mod service;
/// Types used by the notification services.
pub mod types;

pub use service::{LogNotifier, MockNotifier, Notifier, NtfyClient};
pub use types::{Notification, NotificationError, Priority};
