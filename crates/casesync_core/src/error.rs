//! Error types for the session engine.
//!
//! Only [`JoinError`] (after retry exhaustion) and [`SessionError::Unavailable`]
//! are surfaced to the user synchronously. Everything else is logged and
//! recovered by the next poll cycle.

use thiserror::Error;

use crate::cache::CacheKey;
use crate::form::{FieldKey, FieldKind};

/// Failure reported by a [`SessionApi`](crate::api::SessionApi) implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// The request never reached the server (DNS, refused, timeout, offline).
    #[error("Network error: {0}")]
    Network(String),
    /// The server rejected our credentials.
    #[error("Unauthorized")]
    Unauthorized,
    /// The session or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Any other non-success response.
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP-style status code.
        status: u16,
        /// Message returned by the server.
        message: String,
    },
    /// The response could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Presence registration failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JoinError {
    /// Every attempt failed; the session stays un-joined until a manual re-join.
    #[error("Could not join session after {attempts} attempts: {source}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the last attempt.
        source: ApiError,
    },
    /// The client left (view unmounted) while the join was in progress.
    #[error("Join cancelled because the session was left")]
    Cancelled,
    /// A newer join started, or the view was hidden, while this one was in progress.
    #[error("Join superseded by a newer join")]
    Superseded,
}

/// A poll or refresh fetch failed. Transient; the next cycle is the retry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollError {
    /// Fetching the form state failed.
    #[error("Form state fetch failed: {0}")]
    FormState(ApiError),
    /// Fetching the participant list failed.
    #[error("Participant fetch failed: {0}")]
    Participants(ApiError),
    /// The device is known to be offline; no request was made.
    #[error("Device is offline")]
    Offline,
}

/// A field write could not be applied or persisted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WriteError {
    /// The value does not match the registered kind of a well-known field.
    #[error("Invalid value for field {key}: expected {expected}")]
    InvalidValue {
        /// Field that was written.
        key: FieldKey,
        /// Kind the registry declares for that field.
        expected: FieldKind,
    },
    /// Writes are disabled while the view shows cached data.
    #[error("Writes are disabled while operating on cached data")]
    Degraded,
    /// The session view has been unmounted.
    #[error("Session has been unmounted")]
    Unmounted,
    /// The remote persist failed.
    #[error("Remote write for field {key} failed: {source}")]
    Remote {
        /// Field that failed to persist.
        key: FieldKey,
        /// Underlying API error.
        source: ApiError,
    },
}

/// Cache read/write failure.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Nothing is cached under the key and the live fetch failed.
    #[error("No offline data available for {0}")]
    Miss(CacheKey),
    /// Backend storage I/O failure.
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A snapshot could not be (de)serialized.
    #[error("Cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Top-level error returned by [`CaseSession`](crate::session::CaseSession).
#[derive(Debug, Error)]
pub enum SessionError {
    /// Presence could not be registered.
    #[error(transparent)]
    Join(#[from] JoinError),
    /// Neither live nor cached data is available; the view must block.
    #[error("Session {0} is unavailable: no live connection and no offline data")]
    Unavailable(String),
    /// The session has already been unmounted.
    #[error("Session has been unmounted")]
    Unmounted,
}

/// Result alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
