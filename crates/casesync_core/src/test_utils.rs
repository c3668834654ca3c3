//! Test utilities for casesync_core
//!
//! Scriptable in-memory implementations of the remote APIs plus an observer
//! that records events. Call times are measured on the tokio clock, so tests
//! running with `start_paused = true` see exact whole-second offsets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::{Duration, Instant};

use crate::api::{ApiResult, ReferenceApi, SessionApi};
use crate::cache::ReferenceCategory;
use crate::error::ApiError;
use crate::events::{SessionEvent, SessionObserver};
use crate::form::{FieldEntry, FieldKey};
use crate::types::{FormSnapshot, Participant, SessionId};

/// A call made against [`MockSessionApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    /// `join`
    Join,
    /// `leave`
    Leave,
    /// `heartbeat`
    Heartbeat,
    /// `participants`
    Participants,
    /// `form_state`
    FormState,
    /// `patch_field`
    PatchField {
        /// Field written.
        key: FieldKey,
        /// Value written.
        value: Value,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<(ApiCall, Duration)>,
    form: FormSnapshot,
    participants: Vec<Participant>,
    join_failures: u32,
    patch_failures: u32,
    fail_form_state: bool,
    fail_participants: bool,
    fail_leaves: bool,
    offline: bool,
    patch_delays: HashMap<FieldKey, Duration>,
}

/// In-memory [`SessionApi`] that records every call.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct MockSessionApi {
    state: Arc<Mutex<MockState>>,
    started: Instant,
}

impl Default for MockSessionApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionApi {
    /// Create a mock whose clock starts now.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            started: Instant::now(),
        }
    }

    /// Set the form state the server returns.
    pub fn set_form(&self, form: FormSnapshot) {
        self.state.lock().unwrap().form = form;
    }

    /// Change one field on the "server", as another participant would.
    pub fn set_remote_field(&self, key: FieldKey, entry: FieldEntry) {
        self.state.lock().unwrap().form.fields.set(key, entry);
    }

    /// Current server-side form.
    pub fn form(&self) -> FormSnapshot {
        self.state.lock().unwrap().form.clone()
    }

    /// Set the participant list the server returns.
    pub fn set_participants(&self, participants: Vec<Participant>) {
        self.state.lock().unwrap().participants = participants;
    }

    /// Fail the next `count` joins.
    pub fn fail_joins(&self, count: u32) {
        self.state.lock().unwrap().join_failures = count;
    }

    /// Fail the next `count` field patches.
    pub fn fail_patches(&self, count: u32) {
        self.state.lock().unwrap().patch_failures = count;
    }

    /// Hold every `patch_field` for `key` for `delay` before it completes.
    pub fn slow_patches(&self, key: FieldKey, delay: Duration) {
        self.state.lock().unwrap().patch_delays.insert(key, delay);
    }

    /// Make `form_state` fail until reset.
    pub fn fail_form_state(&self, fail: bool) {
        self.state.lock().unwrap().fail_form_state = fail;
    }

    /// Make `participants` fail until reset.
    pub fn fail_participants(&self, fail: bool) {
        self.state.lock().unwrap().fail_participants = fail;
    }

    /// Make every `leave` fail.
    pub fn fail_leaves(&self) {
        self.state.lock().unwrap().fail_leaves = true;
    }

    /// Fail every call with a network error until reset.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Every call with its offset from creation.
    pub fn calls(&self) -> Vec<(ApiCall, Duration)> {
        self.state.lock().unwrap().calls.clone()
    }

    fn secs_of(&self, matches: impl Fn(&ApiCall) -> bool) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(call, _)| matches(call))
            .map(|(_, at)| at.as_secs())
            .collect()
    }

    /// Whole-second offsets of `join` calls.
    pub fn join_secs(&self) -> Vec<u64> {
        self.secs_of(|call| *call == ApiCall::Join)
    }

    /// Whole-second offsets of `form_state` calls.
    pub fn form_secs(&self) -> Vec<u64> {
        self.secs_of(|call| *call == ApiCall::FormState)
    }

    /// Whole-second offsets of `participants` calls.
    pub fn participant_secs(&self) -> Vec<u64> {
        self.secs_of(|call| *call == ApiCall::Participants)
    }

    /// Whole-second offsets of `heartbeat` calls.
    pub fn heartbeat_secs(&self) -> Vec<u64> {
        self.secs_of(|call| *call == ApiCall::Heartbeat)
    }

    /// Number of `leave` calls.
    pub fn leave_count(&self) -> usize {
        self.secs_of(|call| *call == ApiCall::Leave).len()
    }

    /// Field patches that were attempted, in order.
    pub fn patches(&self) -> Vec<(FieldKey, Value)> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|(call, _)| match call {
                ApiCall::PatchField { key, value } => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Record a call and return the locked state for scripting the response.
    fn record(&self, call: ApiCall) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((call, self.started.elapsed()));
        state
    }
}

fn offline() -> ApiError {
    ApiError::Network("mock network unreachable".to_string())
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn join(&self, _session: &SessionId) -> ApiResult<()> {
        let mut state = self.record(ApiCall::Join);
        if state.offline {
            return Err(offline());
        }
        if state.join_failures > 0 {
            state.join_failures -= 1;
            return Err(ApiError::Server {
                status: 503,
                message: "presence service unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn leave(&self, _session: &SessionId) -> ApiResult<()> {
        let state = self.record(ApiCall::Leave);
        if state.offline || state.fail_leaves {
            return Err(offline());
        }
        Ok(())
    }

    async fn heartbeat(&self, _session: &SessionId) -> ApiResult<()> {
        let state = self.record(ApiCall::Heartbeat);
        if state.offline {
            return Err(offline());
        }
        Ok(())
    }

    async fn participants(&self, _session: &SessionId) -> ApiResult<Vec<Participant>> {
        let state = self.record(ApiCall::Participants);
        if state.offline || state.fail_participants {
            return Err(offline());
        }
        Ok(state.participants.clone())
    }

    async fn form_state(&self, _session: &SessionId) -> ApiResult<FormSnapshot> {
        let state = self.record(ApiCall::FormState);
        if state.offline || state.fail_form_state {
            return Err(offline());
        }
        Ok(state.form.clone())
    }

    async fn patch_field(
        &self,
        _session: &SessionId,
        key: &FieldKey,
        value: &Value,
        client_timestamp: DateTime<Utc>,
    ) -> ApiResult<()> {
        let delay = self
            .record(ApiCall::PatchField {
                key: key.clone(),
                value: value.clone(),
            })
            .patch_delays
            .get(key)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(offline());
        }
        if state.patch_failures > 0 {
            state.patch_failures -= 1;
            return Err(ApiError::Server {
                status: 500,
                message: "write failed".to_string(),
            });
        }
        state
            .form
            .fields
            .set(key.clone(), FieldEntry::new(value.clone()).at(client_timestamp));
        Ok(())
    }
}

/// In-memory [`ReferenceApi`].
#[derive(Default)]
pub struct MockReferenceApi {
    lists: Mutex<HashMap<ReferenceCategory, Value>>,
    calls: AtomicUsize,
}

impl MockReferenceApi {
    /// Create a mock with no lists; unknown lists return `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the list returned for a category.
    pub fn set_list(&self, category: ReferenceCategory, list: Value) {
        self.lists.lock().unwrap().insert(category, list);
    }

    /// Number of calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceApi for MockReferenceApi {
    async fn reference_list(&self, category: ReferenceCategory) -> ApiResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.lists
            .lock()
            .unwrap()
            .get(&category)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(category.to_string()))
    }
}

/// Observer that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Whether any event matches.
    pub fn saw(&self, matches: impl Fn(&SessionEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(matches)
    }
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}
