//! # `casesync_core`
//!
//! Session engine for collaborative editing of emergency-medical case
//! records. Several crew members and dispatchers open the same case; each
//! client registers presence, polls the shared form, writes single fields
//! optimistically and keeps working from a local cache when the network drops.
//!
//! The entry point is [`CaseSession`]. Hosts provide a [`SessionApi`]
//! implementation, a [`CacheStore`] and (optionally) a [`SessionObserver`],
//! then push visibility and connectivity changes into the session.

#![warn(missing_docs)]

/// Remote API traits
pub mod api;

/// Snapshot cache and reference data
pub mod cache;

/// Engine settings
pub mod config;

/// Error types
pub mod error;

/// Host-facing events
pub mod events;

/// Typed form fields
pub mod form;

/// Pending writes and reconciliation
pub mod reconcile;

/// Poll and heartbeat timers
pub mod scheduler;

/// The mounted session
pub mod session;

/// Presence client
pub mod session_client;

/// Shared payload types
pub mod types;

/// Optimistic field writer
pub mod writer;

/// Mocks for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use api::{ReferenceApi, SessionApi};
pub use cache::{
    CacheKey, CacheStore, FileCacheBackend, MemoryCacheBackend, ReferenceCategory, ReferenceData,
    ReferenceList,
};
pub use config::{DegradedWritePolicy, SyncConfig};
pub use error::{ApiError, CacheError, JoinError, PollError, SessionError, WriteError};
pub use events::{SessionEvent, SessionObserver};
pub use form::{FieldEntry, FieldKey, FieldKind, FormState};
pub use reconcile::PendingWrite;
pub use scheduler::TimerStatus;
pub use session::{CaseSession, CaseSessionBuilder};
pub use session_client::PresenceState;
pub use types::{CaseStatus, FieldUpdate, FormSnapshot, Participant, Role, SessionId};
