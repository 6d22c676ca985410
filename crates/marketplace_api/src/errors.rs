use chrono::{DateTime, Utc};
use serde_json::Value;

/// Failure kinds surfaced by the API layer.
///
/// Callers match on the variant rather than on HTTP details; the classifier and the
/// reservation service are the only places that translate responses into these.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Connection, timeout or protocol failure below HTTP.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// An HTTP error with no more specific meaning.
    #[error("API error {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Parsed body, or the raw text as a JSON string.
        body: Value,
    },

    /// A 2xx response whose content the client does not recognise.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(Value),

    /// The response body could not be decoded into the expected shape.
    #[error("Malformed response: {0}")]
    Decode(String),

    /// The server answered with a bot-detection challenge.
    #[error("CAPTCHA challenge received")]
    Captcha,

    /// The server refused the credentials outright.
    #[error("Unauthorized")]
    Unauthorized,

    /// Credentials could not be refreshed or were rejected after a refresh.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Request validation failed.
    #[error("Validation error")]
    Validation,

    /// The email change request was refused.
    #[error("Invalid email change request")]
    EmailChange,

    /// The item no longer exists.
    #[error("Item deleted")]
    ItemDeleted,

    /// The item has been disabled by the store.
    #[error("Item disabled")]
    ItemDisabled,

    /// The sales window is closed.
    #[error("Sale closed")]
    SaleClosed,

    /// No stock left.
    #[error("Sold out")]
    SoldOut,

    /// The account exceeded the per-window purchase limit for this item.
    #[error("Purchase limit exceeded: requested {requested}, limit {limit:?}")]
    LimitExceeded {
        /// Quantity that was requested.
        requested: u32,
        /// Limit reported by the server, if any.
        limit: Option<u32>,
    },

    /// The account is temporarily blocked from reserving.
    #[error("Reservations blocked until {blocked_until:?}")]
    ReservationBlocked {
        /// End of the block, if the server reported one.
        blocked_until: Option<DateTime<Utc>>,
    },

    /// Payment did not complete.
    #[error("Payment failed: {}", .0.join(", "))]
    Payment(Vec<String>),

    /// The order can no longer be cancelled.
    #[error("Cancel deadline exceeded")]
    CancelDeadline,

    /// The reservation was already aborted.
    #[error("Reservation already aborted")]
    AlreadyAborted,
}

impl ApiError {
    /// Whether repeating the whole operation may succeed: transport failures and 5xx only.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors that describe the outcome of a reservation attempt.
    pub fn is_reservation_error(&self) -> bool {
        matches!(
            self,
            ApiError::SaleClosed
                | ApiError::SoldOut
                | ApiError::LimitExceeded { .. }
                | ApiError::ReservationBlocked { .. }
        )
    }

    /// Whether the item should no longer be watched after this error.
    pub fn should_untrack(&self) -> bool {
        matches!(self, ApiError::LimitExceeded { .. })
    }
}
