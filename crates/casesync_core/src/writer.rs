//! Optimistic single-field writes.
//!
//! A write is validated, applied to the local form state immediately, and
//! persisted in the background. Each field has its own lane: sends for one
//! field are serialized, and a send whose edit has been superseded by a newer
//! local edit is skipped. Different fields never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::api::SessionApi;
use crate::config::DegradedWritePolicy;
use crate::error::WriteError;
use crate::form::{self, FieldEntry, FieldKey};
use crate::reconcile::{PendingWrite, PendingWrites};
use crate::types::{FieldUpdate, FormSnapshot, SessionId};

/// Whether a write can be sent now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Online with live data: send immediately.
    Live,
    /// Offline or showing cached data: defer to reconciliation.
    Deferred,
}

#[derive(Default)]
pub(crate) struct Lane {
    latest: AtomicU64,
    pub(crate) send: tokio::sync::Mutex<()>,
}

/// Per-field send lanes, shared by everything that patches fields.
///
/// Holding a lane's send lock is the only way to patch that field, so live
/// sends and offline replays of one field never overlap.
#[derive(Default)]
pub struct FieldLanes {
    lanes: Mutex<HashMap<FieldKey, Arc<Lane>>>,
}

impl FieldLanes {
    /// No lanes yet; they are created on first use.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lane(&self, key: &FieldKey) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap();
        Arc::clone(lanes.entry(key.clone()).or_default())
    }
}

/// Applies field edits locally and persists them remotely.
pub struct FieldSyncWriter {
    session: SessionId,
    api: Arc<dyn SessionApi>,
    local: Arc<Mutex<FormSnapshot>>,
    pending: Arc<PendingWrites>,
    policy: DegradedWritePolicy,
    author: Option<String>,
    lanes: Arc<FieldLanes>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl FieldSyncWriter {
    /// Create a writer over the shared local form state.
    pub fn new(
        session: SessionId,
        api: Arc<dyn SessionApi>,
        local: Arc<Mutex<FormSnapshot>>,
        pending: Arc<PendingWrites>,
        policy: DegradedWritePolicy,
    ) -> Self {
        Self {
            session,
            api,
            local,
            pending,
            policy,
            author: None,
            lanes: Arc::new(FieldLanes::new()),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Record `user_id` as the author of local edits.
    pub fn with_author(mut self, user_id: Option<String>) -> Self {
        self.author = user_id;
        self
    }

    /// Share send lanes with a [`ReconciliationManager`](crate::reconcile::ReconciliationManager).
    pub fn with_lanes(mut self, lanes: Arc<FieldLanes>) -> Self {
        self.lanes = lanes;
        self
    }

    /// Write one field.
    ///
    /// The local state is updated before this returns. In [`WriteMode::Live`]
    /// the remote patch is spawned; in [`WriteMode::Deferred`] the edit is
    /// queued or rejected according to the degraded-write policy.
    pub fn write(&self, key: FieldKey, value: Value, mode: WriteMode) -> Result<FieldUpdate, WriteError> {
        form::validate(&key, &value).map_err(|expected| WriteError::InvalidValue {
            key: key.clone(),
            expected,
        })?;

        if mode == WriteMode::Deferred && self.policy == DegradedWritePolicy::Reject {
            log::info!("[FieldSyncWriter] Rejecting write to {} in degraded mode", key);
            return Err(WriteError::Degraded);
        }

        let update = FieldUpdate::local(key, value);
        self.apply_local(&update);

        let lane = self.lanes.lane(&update.key);
        let seq = lane.latest.fetch_add(1, Ordering::SeqCst) + 1;

        match mode {
            WriteMode::Deferred => {
                log::debug!("[FieldSyncWriter] Deferring {} until reconnect", update.key);
                self.pending.enqueue(PendingWrite::from(update.clone()));
            }
            WriteMode::Live => self.spawn_send(lane, seq, update.clone()),
        }
        Ok(update)
    }

    fn apply_local(&self, update: &FieldUpdate) {
        let mut entry = FieldEntry::new(update.value.clone()).at(update.timestamp);
        if let Some(author) = &self.author {
            entry = entry.by(author.clone());
        }
        self.local
            .lock()
            .unwrap()
            .fields
            .set(update.key.clone(), entry);
    }

    fn spawn_send(&self, lane: Arc<Lane>, seq: u64, update: FieldUpdate) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!(
                    "[FieldSyncWriter] No async runtime, queueing {} for later",
                    update.key
                );
                self.pending.enqueue(PendingWrite::from(update));
                return;
            }
        };

        let api = Arc::clone(&self.api);
        let pending = Arc::clone(&self.pending);
        let session = self.session.clone();

        let task = handle.spawn(async move {
            let _turn = lane.send.lock().await;
            if lane.latest.load(Ordering::SeqCst) != seq {
                log::debug!("[FieldSyncWriter] Skipping superseded write to {}", update.key);
                return;
            }

            match api
                .patch_field(&session, &update.key, &update.value, update.timestamp)
                .await
            {
                Ok(()) => {
                    pending.clear_through(&update.key, update.timestamp);
                }
                Err(e) => {
                    let err = WriteError::Remote {
                        key: update.key.clone(),
                        source: e,
                    };
                    if lane.latest.load(Ordering::SeqCst) == seq {
                        log::warn!("[FieldSyncWriter] {}; queued for replay", err);
                        pending.enqueue(PendingWrite::from(update));
                    } else {
                        log::warn!("[FieldSyncWriter] {}; a newer edit exists", err);
                    }
                }
            }
        });

        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(task);
    }

    /// Wait for every spawned send to finish.
    pub async fn flush(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("[FieldSyncWriter] Send task failed: {}", e);
            }
        }
    }
}
