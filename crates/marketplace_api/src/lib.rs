//! # Marketplace API
//!
//! Resilient access to the marketplace's mobile API.
//! Every call goes through the [`RequestPipeline`], which keeps credentials fresh, retries
//! transport failures and turns each response into a value or a typed [`ApiError`].
//! The [`ReservationService`] builds the reservation, payment and favorites operations on top.

/// Logical endpoints of the marketplace API.
mod endpoint;
pub use endpoint::*;

/// The closed set of failure kinds surfaced to callers.
mod errors;
pub use errors::*;

/// Maps (status, endpoint, body) to a value or a failure kind.
mod classifier;
pub use classifier::*;

/// Access/refresh token handling.
mod credentials;
pub use credentials::*;

/// HTTP transport with credential refresh and retries.
mod pipeline;
pub use pipeline::*;

/// Domain records decoded from API responses.
mod models;
pub use models::*;

/// Voucher payment splitting.
mod payment;
pub use payment::*;

/// Reservation, payment and favorites operations.
mod service;
pub use service::*;
