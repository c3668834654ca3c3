//! Remote API seams.
//!
//! The engine never talks HTTP itself. Hosts plug in an implementation of
//! [`SessionApi`] (and [`ReferenceApi`] for pick-lists):
//!
//! ```text
//! ┌────────────────────┐    ┌────────────────────┐
//! │ HttpSessionApi     │    │ MockSessionApi     │
//! │ (reqwest, CLI)     │    │ (test_utils)       │
//! └─────────┬──────────┘    └─────────┬──────────┘
//!           └────────────┬────────────┘
//!                        ▼
//!           ┌──────────────────────┐
//!           │   CaseSession        │
//!           │   - SessionClient    │
//!           │   - PollingScheduler │
//!           │   - FieldSyncWriter  │
//!           │   - Reconciliation   │
//!           └──────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::ReferenceCategory;
use crate::error::ApiError;
use crate::form::FieldKey;
use crate::types::{FormSnapshot, Participant, SessionId};

/// Result alias for API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Remote session operations.
///
/// Implementations must be `Send + Sync`; calls are made from spawned tasks.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Register presence in the session.
    async fn join(&self, session: &SessionId) -> ApiResult<()>;

    /// Deregister presence. Callers ignore the result.
    async fn leave(&self, session: &SessionId) -> ApiResult<()>;

    /// Renew presence.
    ///
    /// Backends without a dedicated renew endpoint treat a repeated join as a
    /// refresh, which is what the default does.
    async fn heartbeat(&self, session: &SessionId) -> ApiResult<()> {
        self.join(session).await
    }

    /// Current participant list.
    async fn participants(&self, session: &SessionId) -> ApiResult<Vec<Participant>>;

    /// Authoritative form state and case status.
    async fn form_state(&self, session: &SessionId) -> ApiResult<FormSnapshot>;

    /// Persist one field. `client_timestamp` is when the edit was made locally.
    async fn patch_field(
        &self,
        session: &SessionId,
        key: &FieldKey,
        value: &Value,
        client_timestamp: DateTime<Utc>,
    ) -> ApiResult<()>;
}

/// Remote reference-data lists.
#[async_trait]
pub trait ReferenceApi: Send + Sync {
    /// Download one list.
    async fn reference_list(&self, category: ReferenceCategory) -> ApiResult<Value>;
}
