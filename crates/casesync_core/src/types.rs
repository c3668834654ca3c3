//! Core types shared by the session engine.
//!
//! These mirror the payloads of the remote session API: the case status,
//! the participant list, and the form snapshot returned by each poll.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::form::{FieldKey, FormState};

/// Identifier of a collaboratively viewed case record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Case opened by the call centre.
    #[default]
    Open,
    /// A team has been notified.
    TeamNotified,
    /// The team is on its way.
    EnRoute,
    /// The team is on scene.
    OnScene,
    /// The patient is in the vehicle.
    PatientOnboard,
    /// A doctor is being consulted remotely.
    DoctorConsultation,
    /// Returning to base without transfer.
    ReturningToBase,
    /// Transferring the patient to a hospital.
    HospitalTransfer,
    /// Case finished.
    Completed,
    /// Case cancelled.
    Cancelled,
    /// Case closed administratively.
    Closed,
    /// A status this client does not know about.
    #[serde(other)]
    Unknown,
}

impl CaseStatus {
    /// Terminal statuses never start polling or heartbeat.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaseStatus::Completed | CaseStatus::Cancelled | CaseStatus::Closed
        )
    }
}

/// Role of a participant in the case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Physician.
    Doctor,
    /// Nurse.
    Nurse,
    /// Paramedic.
    Paramedic,
    /// Emergency medical technician.
    EmergencyTechnician,
    /// Ambulance driver.
    Driver,
    /// Call-centre dispatcher.
    Dispatcher,
    /// Operations manager.
    OperationsManager,
    /// Head office staff.
    HeadOffice,
    /// Any role this client does not know about.
    #[serde(other)]
    Other,
}

/// Someone currently viewing the case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable user id.
    pub user_id: String,
    /// Name shown in the presence list.
    pub display_name: String,
    /// Role in the case.
    pub role: Role,
    /// Avatar reference (URL or asset id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Last presence refresh seen by the server.
    pub last_activity: DateTime<Utc>,
}

/// Authoritative form state as returned by the session API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormSnapshot {
    /// Current case status.
    #[serde(default)]
    pub status: CaseStatus,
    /// Field values with per-field change metadata.
    #[serde(default)]
    pub fields: FormState,
    /// Server-side revision counter, if the backend exposes one.
    #[serde(default)]
    pub revision: Option<u64>,
}

/// Where a field change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Edited on this device.
    Local,
    /// Received from the server.
    Remote,
}

/// A single-field change.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    /// Field that changed.
    pub key: FieldKey,
    /// New value.
    pub value: Value,
    /// Local wall-clock time of the change.
    pub timestamp: DateTime<Utc>,
    /// Where the change came from.
    pub origin: UpdateOrigin,
}

impl FieldUpdate {
    /// A change made on this device, timestamped now.
    pub fn local(key: FieldKey, value: Value) -> Self {
        Self {
            key,
            value,
            timestamp: Utc::now(),
            origin: UpdateOrigin::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(CaseStatus::Completed.is_terminal());
        assert!(CaseStatus::Cancelled.is_terminal());
        assert!(CaseStatus::Closed.is_terminal());
        assert!(!CaseStatus::OnScene.is_terminal());
        assert!(!CaseStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_unknown_wire_values_are_tolerated() {
        let status: CaseStatus = serde_json::from_value(json!("archived")).unwrap();
        assert_eq!(status, CaseStatus::Unknown);

        let participant: Participant = serde_json::from_value(json!({
            "user_id": "u-7",
            "display_name": "Mehmet",
            "role": "pilot",
            "last_activity": "2026-03-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(participant.role, Role::Other);
        assert!(participant.avatar.is_none());
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot: FormSnapshot = serde_json::from_value(json!({})).unwrap();
        assert_eq!(snapshot.status, CaseStatus::Open);
        assert!(snapshot.fields.is_empty());
        assert_eq!(snapshot.revision, None);
    }
}
