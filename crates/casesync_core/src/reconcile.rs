//! Pending offline edits and their replay after reconnecting.
//!
//! Edits made without a live connection (or whose live send failed) are kept
//! in [`PendingWrites`], at most one per field. When the session is back
//! online, [`ReconciliationManager`] compares each one with the server's
//! per-field timestamp:
//!
//! - server field unchanged since the edit (or never timestamped): replay it
//! - server field changed after the edit: drop it and tell the user
//!
//! Replays run one at a time in queue order, each under the field's send
//! lane, and only if the write is still the one queued for that field: a live
//! edit made during the pass always wins. A failed replay stops the pass;
//! the write stays queued for the next pass until it has failed
//! `max_attempts` times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::SessionApi;
use crate::cache::{CacheKey, CacheStore};
use crate::error::PollError;
use crate::events::{SessionEvent, SessionObserver};
use crate::form::FieldKey;
use crate::types::{FieldUpdate, FormSnapshot, SessionId};
use crate::writer::FieldLanes;

/// A local edit that has not reached the server yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Field that was edited.
    pub key: FieldKey,
    /// Edited value.
    pub value: Value,
    /// When the edit was made locally.
    pub timestamp: DateTime<Utc>,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingWrite {
    /// A fresh pending write.
    pub fn new(key: FieldKey, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            timestamp,
            retry_count: 0,
        }
    }
}

impl From<FieldUpdate> for PendingWrite {
    fn from(update: FieldUpdate) -> Self {
        PendingWrite::new(update.key, update.value, update.timestamp)
    }
}

/// Ordered queue of pending writes, one per field.
///
/// With a cache attached, every change is persisted so queued edits survive
/// a restart.
pub struct PendingWrites {
    queue: Mutex<IndexMap<FieldKey, PendingWrite>>,
    persist: Option<(Arc<CacheStore>, CacheKey)>,
}

impl PendingWrites {
    /// Empty in-memory queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(IndexMap::new()),
            persist: None,
        }
    }

    /// Queue persisted in `cache`, restoring whatever a previous run left.
    pub fn restore(cache: Arc<CacheStore>, session: &SessionId) -> Self {
        let key = CacheKey::pending(session);
        let restored: Vec<PendingWrite> = match cache.get_as(&key) {
            Ok(Some(writes)) => writes,
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("[Reconcile] Could not restore pending writes for {}: {}", session, e);
                Vec::new()
            }
        };
        if !restored.is_empty() {
            log::info!(
                "[Reconcile] Restored {} pending write(s) for {}",
                restored.len(),
                session
            );
        }

        let queue = restored
            .into_iter()
            .map(|write| (write.key.clone(), write))
            .collect();
        Self {
            queue: Mutex::new(queue),
            persist: Some((cache, key)),
        }
    }

    fn save(&self, queue: &IndexMap<FieldKey, PendingWrite>) {
        let Some((cache, key)) = &self.persist else {
            return;
        };
        let writes: Vec<&PendingWrite> = queue.values().collect();
        let result = serde_json::to_value(writes)
            .map_err(crate::error::CacheError::from)
            .and_then(|payload| cache.put(key, payload));
        if let Err(e) = result {
            log::warn!("[Reconcile] Could not persist pending writes: {}", e);
        }
    }

    /// Queue a write, superseding an older one for the same field.
    ///
    /// The newer write moves to the end of the queue. Returns `false` (and
    /// changes nothing) if a write with a later timestamp is already queued.
    pub fn enqueue(&self, write: PendingWrite) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if let Some(existing) = queue.get(&write.key)
            && existing.timestamp > write.timestamp
        {
            return false;
        }
        queue.shift_remove(&write.key);
        log::debug!("[Reconcile] Queued {} ({} pending)", write.key, queue.len() + 1);
        queue.insert(write.key.clone(), write);
        self.save(&queue);
        true
    }

    /// Drop the queued write for `key` if it is not newer than `timestamp`.
    pub fn clear_through(&self, key: &FieldKey, timestamp: DateTime<Utc>) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let stale = queue
            .get(key)
            .is_some_and(|existing| existing.timestamp <= timestamp);
        if stale {
            queue.shift_remove(key);
            self.save(&queue);
        }
        stale
    }

    /// Count a failed replay. Returns the new retry count, or `None` if the
    /// write was superseded in the meantime.
    fn record_failure(&self, key: &FieldKey, timestamp: DateTime<Utc>) -> Option<u32> {
        let mut queue = self.queue.lock().unwrap();
        let write = queue.get_mut(key).filter(|w| w.timestamp == timestamp)?;
        write.retry_count += 1;
        let count = write.retry_count;
        self.save(&queue);
        Some(count)
    }

    /// Queued writes in replay order.
    pub fn snapshot(&self) -> Vec<PendingWrite> {
        self.queue.lock().unwrap().values().cloned().collect()
    }

    /// Queued write for a field.
    pub fn get(&self, key: &FieldKey) -> Option<PendingWrite> {
        self.queue.lock().unwrap().get(key).cloned()
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl Default for PendingWrites {
    fn default() -> Self {
        Self::new()
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Authoritative state the pass compared against.
    pub snapshot: FormSnapshot,
    /// Writes that reached the server.
    pub replayed: Vec<PendingWrite>,
    /// Fields whose queued edit lost to a newer server value.
    pub discarded: Vec<FieldKey>,
    /// Fields whose queued edit was dropped after too many failures.
    pub abandoned: Vec<FieldKey>,
    /// Writes still queued after the pass.
    pub retained: usize,
}

/// Resets the running flag even if the pass is cancelled mid-await.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Replays pending writes against fresh server state.
pub struct ReconciliationManager {
    session: SessionId,
    api: Arc<dyn SessionApi>,
    cache: Arc<CacheStore>,
    pending: Arc<PendingWrites>,
    observer: Arc<dyn SessionObserver>,
    lanes: Arc<FieldLanes>,
    max_attempts: u32,
    running: AtomicBool,
}

impl ReconciliationManager {
    /// Create a manager.
    pub fn new(
        session: SessionId,
        api: Arc<dyn SessionApi>,
        cache: Arc<CacheStore>,
        pending: Arc<PendingWrites>,
        observer: Arc<dyn SessionObserver>,
        max_attempts: u32,
    ) -> Self {
        Self {
            session,
            api,
            cache,
            pending,
            observer,
            lanes: Arc::new(FieldLanes::new()),
            max_attempts: max_attempts.max(1),
            running: AtomicBool::new(false),
        }
    }

    /// Share send lanes with a [`FieldSyncWriter`](crate::writer::FieldSyncWriter).
    pub fn with_lanes(mut self, lanes: Arc<FieldLanes>) -> Self {
        self.lanes = lanes;
        self
    }

    fn still_queued(&self, write: &PendingWrite) -> bool {
        self.pending
            .get(&write.key)
            .is_some_and(|queued| queued.timestamp == write.timestamp)
    }

    /// Whether a pass is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one pass.
    ///
    /// Without a `snapshot` the authoritative state is fetched first and
    /// written through to the cache. Returns `Ok(None)` if another pass is
    /// already running.
    pub async fn reconcile(
        &self,
        snapshot: Option<FormSnapshot>,
    ) -> Result<Option<ReconcileReport>, PollError> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::debug!("[Reconcile] Pass already in progress for {}", self.session);
            return Ok(None);
        }
        let _running = RunningGuard(&self.running);

        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => self.fetch_fresh().await?,
        };

        let mut report = ReconcileReport {
            snapshot,
            ..Default::default()
        };

        for write in self.pending.snapshot() {
            if !self.still_queued(&write) {
                log::debug!("[Reconcile] {} superseded during the pass", write.key);
                continue;
            }
            let server = report.snapshot.fields.entry(&write.key);
            let server_changed_later = server
                .and_then(|entry| entry.updated_at)
                .is_some_and(|updated_at| updated_at >= write.timestamp);

            if server_changed_later {
                log::info!(
                    "[Reconcile] {} was updated elsewhere, discarding offline edit",
                    write.key
                );
                self.pending.clear_through(&write.key, write.timestamp);
                self.observer.on_event(SessionEvent::FieldChangedElsewhere {
                    key: write.key.clone(),
                    server_value: server.map(|entry| entry.value.clone()),
                    updated_by: server.and_then(|entry| entry.updated_by.clone()),
                });
                report.discarded.push(write.key);
                continue;
            }

            let lane = self.lanes.lane(&write.key);
            let _turn = lane.send.lock().await;
            if !self.still_queued(&write) {
                log::debug!("[Reconcile] {} superseded by a live edit", write.key);
                continue;
            }

            match self
                .api
                .patch_field(&self.session, &write.key, &write.value, write.timestamp)
                .await
            {
                Ok(()) => {
                    log::debug!("[Reconcile] Replayed {}", write.key);
                    self.pending.clear_through(&write.key, write.timestamp);
                    report.replayed.push(write);
                }
                Err(e) => {
                    let attempts = self.pending.record_failure(&write.key, write.timestamp);
                    log::warn!(
                        "[Reconcile] Replay of {} failed (attempt {}/{}): {}",
                        write.key,
                        attempts.unwrap_or(0),
                        self.max_attempts,
                        e
                    );
                    if let Some(attempts) = attempts
                        && attempts >= self.max_attempts
                    {
                        log::error!(
                            "[Reconcile] Abandoning edit of {} after {} attempts",
                            write.key,
                            attempts
                        );
                        self.pending.clear_through(&write.key, write.timestamp);
                        self.observer.on_event(SessionEvent::WriteAbandoned {
                            key: write.key.clone(),
                            value: write.value.clone(),
                            attempts,
                        });
                        report.abandoned.push(write.key);
                    }
                    break;
                }
            }
        }

        report.retained = self.pending.len();
        log::info!(
            "[Reconcile] {}: {} replayed, {} discarded, {} abandoned, {} still pending",
            self.session,
            report.replayed.len(),
            report.discarded.len(),
            report.abandoned.len(),
            report.retained
        );
        Ok(Some(report))
    }

    async fn fetch_fresh(&self) -> Result<FormSnapshot, PollError> {
        let stamp = self.cache.stamp();
        let snapshot = self
            .api
            .form_state(&self.session)
            .await
            .map_err(PollError::FormState)?;

        let key = CacheKey::for_session(&self.session);
        match serde_json::to_value(&snapshot) {
            Ok(payload) => {
                if let Err(e) = self.cache.put_stamped(&key, payload, stamp) {
                    log::warn!("[Reconcile] Failed to cache {}: {}", key, e);
                }
            }
            Err(e) => log::warn!("[Reconcile] Failed to encode {}: {}", key, e),
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DegradedWritePolicy;
    use crate::error::ApiError;
    use crate::writer::{FieldSyncWriter, WriteMode};
    use crate::form::FieldEntry;
    use crate::test_utils::{MockSessionApi, RecordingObserver};
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        api: Arc<MockSessionApi>,
        cache: Arc<CacheStore>,
        pending: Arc<PendingWrites>,
        observer: Arc<RecordingObserver>,
        lanes: Arc<FieldLanes>,
        manager: ReconciliationManager,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(MockSessionApi::new());
        let cache = Arc::new(CacheStore::in_memory());
        let pending = Arc::new(PendingWrites::new());
        let observer = Arc::new(RecordingObserver::new());
        let lanes = Arc::new(FieldLanes::new());
        let manager = ReconciliationManager::new(
            SessionId::new("case-1"),
            api.clone(),
            cache.clone(),
            pending.clone(),
            observer.clone(),
            3,
        )
        .with_lanes(lanes.clone());
        Fixture {
            api,
            cache,
            pending,
            observer,
            lanes,
            manager,
        }
    }

    fn live_writer(f: &Fixture) -> FieldSyncWriter {
        FieldSyncWriter::new(
            SessionId::new("case-1"),
            f.api.clone(),
            Arc::new(Mutex::new(FormSnapshot::default())),
            f.pending.clone(),
            DegradedWritePolicy::Queue,
        )
        .with_lanes(f.lanes.clone())
    }

    #[test]
    fn test_newer_write_supersedes_and_moves_to_end() {
        let pending = PendingWrites::new();
        let t0 = Utc::now();
        pending.enqueue(PendingWrite::new(FieldKey::HeartRate, json!(90), t0));
        pending.enqueue(PendingWrite::new(FieldKey::Diagnosis, json!("MI"), t0));
        pending.enqueue(PendingWrite::new(
            FieldKey::HeartRate,
            json!(95),
            t0 + Duration::seconds(1),
        ));

        let keys: Vec<_> = pending.snapshot().into_iter().map(|w| w.key).collect();
        assert_eq!(keys, vec![FieldKey::Diagnosis, FieldKey::HeartRate]);
        assert_eq!(pending.get(&FieldKey::HeartRate).unwrap().value, json!(95));

        assert!(!pending.enqueue(PendingWrite::new(FieldKey::HeartRate, json!(80), t0)));
        assert_eq!(pending.get(&FieldKey::HeartRate).unwrap().value, json!(95));
    }

    #[test]
    fn test_pending_writes_survive_restart() {
        let cache = Arc::new(CacheStore::in_memory());
        let session = SessionId::new("case-7");

        let pending = PendingWrites::restore(cache.clone(), &session);
        pending.enqueue(PendingWrite::new(FieldKey::PatientAge, json!(41), Utc::now()));
        drop(pending);

        let restored = PendingWrites::restore(cache, &session);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(&FieldKey::PatientAge).unwrap().value, json!(41));
    }

    #[tokio::test]
    async fn test_unchanged_field_is_replayed_exactly_once() {
        let f = fixture();
        let edited_at = Utc::now();
        f.api.set_form(FormSnapshot {
            fields: crate::form::FormState::new().with(
                FieldKey::HeartRate,
                FieldEntry::new(json!(80)).at(edited_at - Duration::minutes(5)),
            ),
            ..Default::default()
        });
        f.pending
            .enqueue(PendingWrite::new(FieldKey::HeartRate, json!(120), edited_at));

        let report = f.manager.reconcile(None).await.unwrap().unwrap();
        assert_eq!(report.replayed.len(), 1);
        assert!(f.pending.is_empty());

        let again = f.manager.reconcile(None).await.unwrap().unwrap();
        assert!(again.replayed.is_empty());
        assert_eq!(f.api.patches(), vec![(FieldKey::HeartRate, json!(120))]);
        assert!(f.cache.get(&CacheKey::session("case-1")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_field_changed_elsewhere_is_discarded_with_notice() {
        let f = fixture();
        let edited_at = Utc::now();
        f.api.set_form(FormSnapshot {
            fields: crate::form::FormState::new().with(
                FieldKey::Diagnosis,
                FieldEntry::new(json!("stroke"))
                    .at(edited_at + Duration::seconds(30))
                    .by("dr-kaya"),
            ),
            ..Default::default()
        });
        f.pending
            .enqueue(PendingWrite::new(FieldKey::Diagnosis, json!("syncope"), edited_at));

        let report = f.manager.reconcile(None).await.unwrap().unwrap();

        assert_eq!(report.discarded, vec![FieldKey::Diagnosis]);
        assert!(f.api.patches().is_empty());
        assert!(f.pending.is_empty());
        assert!(f.observer.events().contains(&SessionEvent::FieldChangedElsewhere {
            key: FieldKey::Diagnosis,
            server_value: Some(json!("stroke")),
            updated_by: Some("dr-kaya".to_string()),
        }));
    }

    #[tokio::test]
    async fn test_failed_replay_stops_pass_and_abandons_after_limit() {
        let f = fixture();
        let t0 = Utc::now();
        f.pending
            .enqueue(PendingWrite::new(FieldKey::HeartRate, json!(100), t0));
        f.pending
            .enqueue(PendingWrite::new(FieldKey::Diagnosis, json!("asthma"), t0));
        f.api.fail_patches(u32::MAX);

        for _ in 0..2 {
            let report = f.manager.reconcile(None).await.unwrap().unwrap();
            assert_eq!(report.retained, 2);
        }
        assert_eq!(f.pending.get(&FieldKey::HeartRate).unwrap().retry_count, 2);
        assert_eq!(f.pending.get(&FieldKey::Diagnosis).unwrap().retry_count, 0);

        let report = f.manager.reconcile(None).await.unwrap().unwrap();
        assert_eq!(report.abandoned, vec![FieldKey::HeartRate]);
        assert_eq!(report.retained, 1);
        assert!(f.observer.events().iter().any(|e| matches!(
            e,
            SessionEvent::WriteAbandoned { key: FieldKey::HeartRate, attempts: 3, .. }
        )));
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_queue_untouched() {
        let f = fixture();
        f.pending
            .enqueue(PendingWrite::new(FieldKey::HeartRate, json!(100), Utc::now()));
        f.api.fail_form_state(true);

        let err = f.manager.reconcile(None).await.unwrap_err();

        assert!(matches!(err, PollError::FormState(ApiError::Network(_))));
        assert_eq!(f.pending.len(), 1);
        assert!(!f.manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_edit_during_pass_skips_stale_replay() {
        let f = fixture();
        let writer = live_writer(&f);
        let queued_at = Utc::now() - Duration::seconds(10);
        f.pending
            .enqueue(PendingWrite::new(FieldKey::HeartRate, json!(1), queued_at));
        f.pending
            .enqueue(PendingWrite::new(FieldKey::Diagnosis, json!("old"), queued_at));
        f.api
            .slow_patches(FieldKey::HeartRate, std::time::Duration::from_secs(1));

        let (report, ()) = tokio::join!(f.manager.reconcile(None), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            writer
                .write(FieldKey::Diagnosis, json!("new"), WriteMode::Live)
                .unwrap();
        });
        writer.flush().await;

        let report = report.unwrap().unwrap();
        let replayed: Vec<_> = report.replayed.into_iter().map(|w| w.key).collect();
        assert_eq!(replayed, vec![FieldKey::HeartRate]);
        assert_eq!(
            f.api.patches(),
            vec![
                (FieldKey::Diagnosis, json!("new")),
                (FieldKey::HeartRate, json!(1)),
            ]
        );
        assert_eq!(
            f.api.form().fields.value(&FieldKey::Diagnosis),
            Some(&json!("new"))
        );
        assert!(f.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_edit_waits_for_replay_of_same_field() {
        let f = fixture();
        let writer = live_writer(&f);
        f.pending.enqueue(PendingWrite::new(
            FieldKey::Diagnosis,
            json!("old"),
            Utc::now() - Duration::seconds(10),
        ));
        f.api
            .slow_patches(FieldKey::Diagnosis, std::time::Duration::from_secs(1));

        let (report, ()) = tokio::join!(f.manager.reconcile(None), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            writer
                .write(FieldKey::Diagnosis, json!("new"), WriteMode::Live)
                .unwrap();
        });
        writer.flush().await;

        assert_eq!(report.unwrap().unwrap().replayed.len(), 1);
        assert_eq!(
            f.api.patches(),
            vec![
                (FieldKey::Diagnosis, json!("old")),
                (FieldKey::Diagnosis, json!("new")),
            ]
        );
        assert_eq!(
            f.api.form().fields.value(&FieldKey::Diagnosis),
            Some(&json!("new"))
        );
    }
}
