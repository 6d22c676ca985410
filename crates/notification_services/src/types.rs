use std::fmt;

/// Errors raised while publishing notifications.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// The HTTP request to the push service failed.
    #[error("Push request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The push service answered with a non-success status.
    #[error("Push service rejected message with status {0}")]
    Rejected(u16),

    /// The topic is empty or contains a path separator.
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),
}

/// Delivery priority of a notification, as understood by ntfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Silent, no vibration.
    Min = 1,
    /// No sound, shown in the drawer.
    Low = 2,
    /// Normal notification.
    #[default]
    Default = 3,
    /// Long vibration burst.
    High = 4,
    /// Pop-over notification.
    Urgent = 5,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// A published message, kept by the mock notifier for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Message body.
    pub message: String,
    /// Delivery priority.
    pub priority: Priority,
    /// Emoji shortcode tag, empty when untagged.
    pub tag: String,
}
