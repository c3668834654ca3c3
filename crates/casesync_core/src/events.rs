//! Events emitted to the host while a session is mounted.
//!
//! The host (a terminal view, a GUI, a test) implements [`SessionObserver`]
//! and translates events into whatever it shows the user. Closures work too:
//!
//! ```ignore
//! use casesync_core::{CaseSession, SessionEvent};
//!
//! let observer = Arc::new(|event: SessionEvent| match event {
//!     SessionEvent::FieldChangedElsewhere { key, .. } => println!("{} changed elsewhere", key),
//!     SessionEvent::DegradedModeChanged(true) => println!("showing cached data"),
//!     _ => {}
//! });
//! ```

use serde_json::Value;

use crate::error::JoinError;
use crate::form::FieldKey;
use crate::session_client::PresenceState;
use crate::types::{CaseStatus, FormSnapshot, Participant, SessionId};

/// Something the host should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// New authoritative (or cached) form state.
    StateChanged {
        /// The state now shown.
        snapshot: FormSnapshot,
        /// Whether it came from the cache.
        from_cache: bool,
    },
    /// Our own presence state changed.
    PresenceChanged(PresenceState),
    /// The participant list was refreshed.
    ParticipantsChanged(Vec<Participant>),
    /// Entered (`true`) or left (`false`) degraded mode.
    DegradedModeChanged(bool),
    /// The case status changed.
    StatusChanged(CaseStatus),
    /// A queued offline edit was dropped because the server has a newer value.
    FieldChangedElsewhere {
        /// Field that was edited.
        key: FieldKey,
        /// Value currently on the server.
        server_value: Option<Value>,
        /// Who changed it, if known.
        updated_by: Option<String>,
    },
    /// A queued edit failed to replay too many times and was dropped.
    WriteAbandoned {
        /// Field that was edited.
        key: FieldKey,
        /// Value that could not be persisted.
        value: Value,
        /// Failed replay attempts.
        attempts: u32,
    },
    /// Joining failed after every retry.
    JoinFailed(JoinError),
    /// A live fetch failed and nothing is cached for the session.
    NoOfflineData(SessionId),
    /// No live connection and no cached data; the view cannot render.
    Unavailable(SessionId),
}

/// Receives [`SessionEvent`]s.
///
/// Called from engine tasks; implementations must not block.
pub trait SessionObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: SessionEvent);
}

impl<F> SessionObserver for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: SessionEvent) {
        self(event)
    }
}

/// Observer that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_event(&self, _event: SessionEvent) {}
}
