//! One mounted case view: presence, polling, writes and offline recovery.
//!
//! [`CaseSession`] wires the components together and reacts to the two
//! signals a host pushes in, visibility and connectivity:
//!
//! ```text
//!  mount ─► load (live, else cache) ─► join (3 tries) ─► start timers
//!                                         │
//!  hidden ─► stop timers                  └─ terminal status: quiesce, no timers
//!  visible ─► join ─► refresh ─► start timers (fresh schedule)
//!  offline ─► degraded, ticks skipped, writes queued
//!  online ─► reconcile pending writes against fresh state
//!  unmount ─► dispose timers, leave once
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::api::SessionApi;
use crate::cache::{CacheKey, CacheStore, FetchStamp};
use crate::config::SyncConfig;
use crate::error::{ApiError, CacheError, JoinError, PollError, SessionError, WriteError};
use crate::events::{NoopObserver, SessionEvent, SessionObserver};
use crate::form::{FieldEntry, FieldKey};
use crate::reconcile::{PendingWrite, PendingWrites, ReconcileReport, ReconciliationManager};
use crate::scheduler::{PollingScheduler, TickGuard, TickHandler, TimerKind, TimerStatus};
use crate::session_client::{JoinPolicy, PresenceState, SessionClient};
use crate::types::{FieldUpdate, FormSnapshot, Participant, SessionId};
use crate::writer::{FieldLanes, FieldSyncWriter, WriteMode};

#[derive(Debug, Clone, Copy)]
struct Flags {
    mounted: bool,
    unmounted: bool,
    visible: bool,
    online: bool,
    degraded: bool,
    has_data: bool,
}

/// What a fetch result must still be valid against before it is applied.
enum Validity {
    /// Produced by a timer tick.
    Tick(TickGuard),
    /// Produced by a lifecycle transition (mount, visibility, reconnect).
    Epoch(u64),
}

/// Builder for [`CaseSession`].
pub struct CaseSessionBuilder {
    id: SessionId,
    api: Arc<dyn SessionApi>,
    cache: Arc<CacheStore>,
    observer: Arc<dyn SessionObserver>,
    config: SyncConfig,
    author: Option<String>,
    visible: bool,
    online: bool,
}

impl CaseSessionBuilder {
    /// Timing and retry settings.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Where events go.
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// User id recorded on local edits.
    pub fn author(mut self, user_id: impl Into<String>) -> Self {
        self.author = Some(user_id.into());
        self
    }

    /// Initial visibility (default visible).
    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Initial connectivity (default online).
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Create the session. Nothing happens until [`CaseSession::mount`].
    pub fn build(self) -> CaseSession {
        let CaseSessionBuilder {
            id,
            api,
            cache,
            observer,
            config,
            author,
            visible,
            online,
        } = self;

        let form = Arc::new(Mutex::new(FormSnapshot::default()));
        let pending = Arc::new(PendingWrites::restore(Arc::clone(&cache), &id));
        let lanes = Arc::new(FieldLanes::new());

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let handler: Weak<dyn TickHandler> = weak.clone();
            SessionInner {
                client: SessionClient::new(
                    id.clone(),
                    Arc::clone(&api),
                    Arc::clone(&observer),
                    JoinPolicy {
                        max_attempts: config.join_max_attempts,
                        retry_delay: config.join_retry_delay(),
                    },
                ),
                scheduler: PollingScheduler::new(
                    handler,
                    config.poll_interval(),
                    config.heartbeat_interval(),
                ),
                writer: FieldSyncWriter::new(
                    id.clone(),
                    Arc::clone(&api),
                    Arc::clone(&form),
                    Arc::clone(&pending),
                    config.degraded_writes,
                )
                .with_author(author)
                .with_lanes(Arc::clone(&lanes)),
                reconciler: ReconciliationManager::new(
                    id.clone(),
                    Arc::clone(&api),
                    Arc::clone(&cache),
                    Arc::clone(&pending),
                    Arc::clone(&observer),
                    config.replay_max_attempts,
                )
                .with_lanes(lanes),
                participants: Mutex::new(Vec::new()),
                flags: Mutex::new(Flags {
                    mounted: false,
                    unmounted: false,
                    visible,
                    online,
                    degraded: false,
                    has_data: false,
                }),
                epoch: AtomicU64::new(0),
                id,
                api,
                cache,
                observer,
                pending,
                form,
            }
        });

        CaseSession { inner }
    }
}

struct SessionInner {
    id: SessionId,
    api: Arc<dyn SessionApi>,
    cache: Arc<CacheStore>,
    observer: Arc<dyn SessionObserver>,
    client: SessionClient,
    scheduler: PollingScheduler,
    writer: FieldSyncWriter,
    reconciler: ReconciliationManager,
    pending: Arc<PendingWrites>,
    form: Arc<Mutex<FormSnapshot>>,
    participants: Mutex<Vec<Participant>>,
    flags: Mutex<Flags>,
    epoch: AtomicU64,
}

/// A collaboratively viewed case, from mount to unmount.
///
/// Dropping the session unmounts it.
pub struct CaseSession {
    inner: Arc<SessionInner>,
}

impl CaseSession {
    /// Start building a session.
    pub fn builder(
        id: impl Into<SessionId>,
        api: Arc<dyn SessionApi>,
        cache: Arc<CacheStore>,
    ) -> CaseSessionBuilder {
        CaseSessionBuilder {
            id: id.into(),
            api,
            cache,
            observer: Arc::new(NoopObserver),
            config: SyncConfig::default(),
            author: None,
            visible: true,
            online: true,
        }
    }

    /// Load the case, register presence and start polling.
    ///
    /// Fails with [`SessionError::Join`] when presence could not be
    /// registered (the view still shows whatever was loaded), and with
    /// [`SessionError::Unavailable`] when there is neither a live connection
    /// nor cached data.
    pub async fn mount(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        {
            let mut flags = inner.flags.lock().unwrap();
            if flags.unmounted {
                return Err(SessionError::Unmounted);
            }
            if flags.mounted {
                return Ok(());
            }
            flags.mounted = true;
        }
        let epoch = inner.epoch.load(Ordering::SeqCst);
        log::info!("[CaseSession] Mounting {}", inner.id);

        let has_data = inner.load_initial().await;
        let flags = inner.flags();
        if flags.unmounted {
            return Err(SessionError::Unmounted);
        }

        if !flags.online {
            log::info!("[CaseSession] {} mounted offline, join deferred", inner.id);
            return if has_data {
                Ok(())
            } else {
                inner.unavailable()
            };
        }

        match inner.client.join().await {
            Ok(()) => {
                inner.after_join(&Validity::Epoch(epoch));
                Ok(())
            }
            Err(JoinError::Cancelled) => Err(SessionError::Join(JoinError::Cancelled)),
            Err(JoinError::Superseded) => {
                log::debug!("[CaseSession] Mount join for {} superseded", inner.id);
                Ok(())
            }
            Err(e) => {
                inner.observer.on_event(SessionEvent::JoinFailed(e.clone()));
                if inner.flags().has_data {
                    Err(SessionError::Join(e))
                } else {
                    inner.unavailable()
                }
            }
        }
    }

    /// Visibility changed. Hiding stops every timer at once; showing again
    /// re-joins, refreshes and restarts the timers on a fresh schedule.
    pub async fn set_visible(&self, visible: bool) -> Result<(), SessionError> {
        let inner = &self.inner;
        let flags = {
            let mut flags = inner.flags.lock().unwrap();
            if flags.unmounted {
                return Err(SessionError::Unmounted);
            }
            if flags.visible == visible {
                return Ok(());
            }
            flags.visible = visible;
            *flags
        };
        if !flags.mounted {
            return Ok(());
        }

        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if !visible {
            inner.client.cancel_join();
            inner.stop_timers();
            log::info!("[CaseSession] {} hidden, timers stopped", inner.id);
            return Ok(());
        }

        log::info!("[CaseSession] {} visible again", inner.id);
        inner.resume(epoch).await
    }

    /// Connectivity changed. Going offline switches to degraded mode; coming
    /// back runs reconciliation (and joins if presence was never registered).
    pub async fn set_online(&self, online: bool) -> Result<(), SessionError> {
        let inner = &self.inner;
        let flags = {
            let mut flags = inner.flags.lock().unwrap();
            if flags.unmounted {
                return Err(SessionError::Unmounted);
            }
            if flags.online == online {
                return Ok(());
            }
            flags.online = online;
            *flags
        };
        if !flags.mounted {
            return Ok(());
        }

        if !online {
            log::info!("[CaseSession] {} offline, switching to degraded mode", inner.id);
            if flags.has_data {
                inner.set_degraded(true);
            } else {
                inner.enter_degraded();
            }
            return Ok(());
        }

        log::info!("[CaseSession] {} back online", inner.id);
        let epoch = inner.epoch.load(Ordering::SeqCst);
        if inner.client.state() == PresenceState::Idle && flags.visible && !inner.is_terminal() {
            return inner.resume(epoch).await;
        }

        match inner.reconciler.reconcile(None).await {
            Ok(Some(report)) => {
                if inner.still_valid(&Validity::Epoch(epoch)) {
                    inner.apply_report(report);
                    inner.set_degraded(false);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("[CaseSession] Reconnect refresh failed: {}", e),
        }
        Ok(())
    }

    /// Edit one field. Local state changes immediately; persistence happens
    /// in the background or, while degraded, after reconnecting.
    pub fn write(&self, key: impl Into<FieldKey>, value: Value) -> Result<FieldUpdate, WriteError> {
        let flags = self.inner.flags();
        if flags.unmounted {
            return Err(WriteError::Unmounted);
        }
        let mode = if flags.online && !flags.degraded {
            WriteMode::Live
        } else {
            WriteMode::Deferred
        };
        self.inner.writer.write(key.into(), value, mode)
    }

    /// Try to join again after a failed join.
    pub async fn retry_join(&self) -> Result<(), SessionError> {
        if self.inner.flags().unmounted {
            return Err(SessionError::Unmounted);
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.resume(epoch).await
    }

    /// Tear down: stop every timer now and send `leave` once.
    pub fn unmount(&self) {
        self.inner.unmount();
    }

    /// Wait for background field writes to finish.
    pub async fn flush_writes(&self) {
        self.inner.writer.flush().await;
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Local form state, including unconfirmed edits.
    pub fn form(&self) -> FormSnapshot {
        self.inner.form.lock().unwrap().clone()
    }

    /// Participants from the last successful poll.
    pub fn participants(&self) -> Vec<Participant> {
        self.inner.participants.lock().unwrap().clone()
    }

    /// Our presence state.
    pub fn presence(&self) -> PresenceState {
        self.inner.client.state()
    }

    /// Which timers are running.
    pub fn timer_status(&self) -> TimerStatus {
        self.inner.scheduler.status()
    }

    /// Whether the view is showing cached data.
    pub fn is_degraded(&self) -> bool {
        self.inner.flags().degraded
    }

    /// Edits waiting for replay.
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.inner.pending.snapshot()
    }
}

impl Drop for CaseSession {
    fn drop(&mut self) {
        self.inner.unmount();
    }
}

impl SessionInner {
    fn flags(&self) -> Flags {
        *self.flags.lock().unwrap()
    }

    fn still_valid(&self, validity: &Validity) -> bool {
        if self.flags().unmounted {
            return false;
        }
        match validity {
            Validity::Tick(guard) => guard.is_current(),
            Validity::Epoch(epoch) => self.epoch.load(Ordering::SeqCst) == *epoch,
        }
    }

    fn is_terminal(&self) -> bool {
        self.form.lock().unwrap().status.is_terminal()
    }

    fn unavailable(&self) -> Result<(), SessionError> {
        log::error!("[CaseSession] {} unavailable: no connection and no offline data", self.id);
        self.observer.on_event(SessionEvent::Unavailable(self.id.clone()));
        Err(SessionError::Unavailable(self.id.to_string()))
    }

    fn start_timers(&self) {
        self.scheduler.start_polling();
        self.scheduler.start_heartbeat();
    }

    fn stop_timers(&self) {
        self.scheduler.stop_polling();
        self.scheduler.stop_heartbeat();
    }

    fn after_join(&self, validity: &Validity) {
        if self.is_terminal() {
            self.client.quiesce();
            return;
        }
        if self.still_valid(validity) && self.flags().visible {
            self.start_timers();
        }
    }

    /// Join, refresh and start timers, unless superseded on the way.
    async fn resume(&self, epoch: u64) -> Result<(), SessionError> {
        if self.is_terminal() {
            return Ok(());
        }
        if !self.flags().online {
            log::debug!("[CaseSession] {} offline, resume deferred", self.id);
            return Ok(());
        }

        let validity = Validity::Epoch(epoch);
        if let Err(e) = self.client.join().await {
            if e == JoinError::Superseded || !self.still_valid(&validity) {
                return Ok(());
            }
            self.observer.on_event(SessionEvent::JoinFailed(e.clone()));
            return Err(SessionError::Join(e));
        }
        if !self.still_valid(&validity) {
            return Ok(());
        }

        self.refresh_form(&validity).await;
        self.refresh_participants(&validity).await;
        self.after_join(&validity);
        Ok(())
    }

    /// Initial load. Returns whether anything is shown.
    async fn load_initial(&self) -> bool {
        let online = self.flags().online;
        let key = CacheKey::for_session(&self.id);
        let api = Arc::clone(&self.api);
        let id = self.id.clone();

        let loaded = self
            .cache
            .load_through(&key, online, || async move {
                let snapshot = api.form_state(&id).await?;
                serde_json::to_value(snapshot).map_err(|e| ApiError::Decode(e.to_string()))
            })
            .await;

        match loaded {
            Ok(loaded) => match serde_json::from_value::<FormSnapshot>(loaded.payload) {
                Ok(snapshot) => {
                    if loaded.from_cache {
                        self.set_degraded(true);
                    }
                    self.apply_form(snapshot, loaded.from_cache);
                }
                Err(e) => {
                    log::warn!("[CaseSession] Discarding undecodable snapshot for {}: {}", key, e);
                    self.observer.on_event(SessionEvent::NoOfflineData(self.id.clone()));
                }
            },
            Err(CacheError::Miss(_)) => {
                log::warn!("[CaseSession] No live or cached state for {}", self.id);
                self.observer.on_event(SessionEvent::NoOfflineData(self.id.clone()));
            }
            Err(e) => {
                log::warn!("[CaseSession] Cache failure loading {}: {}", self.id, e);
                self.observer.on_event(SessionEvent::NoOfflineData(self.id.clone()));
            }
        }

        if online {
            let epoch = self.epoch.load(Ordering::SeqCst);
            self.refresh_participants(&Validity::Epoch(epoch)).await;
        }
        self.flags().has_data
    }

    fn store_snapshot(&self, snapshot: &FormSnapshot, stamp: FetchStamp) {
        let key = CacheKey::for_session(&self.id);
        let result = serde_json::to_value(snapshot)
            .map_err(CacheError::from)
            .and_then(|payload| self.cache.put_stamped(&key, payload, stamp));
        if let Err(e) = result {
            log::warn!("[CaseSession] Failed to cache {}: {}", key, e);
        }
    }

    async fn refresh_form(&self, validity: &Validity) {
        let stamp = self.cache.stamp();
        let result = self.api.form_state(&self.id).await;
        if !self.still_valid(validity) {
            log::debug!("[CaseSession] Dropping stale form state for {}", self.id);
            return;
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("[CaseSession] {}", PollError::FormState(e));
                self.enter_degraded();
                return;
            }
        };
        self.store_snapshot(&snapshot, stamp);

        if self.flags().degraded || !self.pending.is_empty() {
            match self.reconciler.reconcile(Some(snapshot.clone())).await {
                Ok(Some(report)) => {
                    if !self.still_valid(validity) {
                        return;
                    }
                    self.apply_report(report);
                }
                Ok(None) => self.apply_form(snapshot, false),
                Err(e) => {
                    log::warn!("[CaseSession] Reconciliation failed: {}", e);
                    self.apply_form(snapshot, false);
                }
            }
        } else {
            self.apply_form(snapshot, false);
        }
        self.set_degraded(false);
    }

    async fn refresh_participants(&self, validity: &Validity) {
        let result = self.api.participants(&self.id).await;
        if !self.still_valid(validity) {
            return;
        }
        match result {
            Ok(participants) => {
                *self.participants.lock().unwrap() = participants.clone();
                self.observer
                    .on_event(SessionEvent::ParticipantsChanged(participants));
            }
            Err(e) => log::warn!("[CaseSession] {}", PollError::Participants(e)),
        }
    }

    /// Show `snapshot`, with queued local edits laid over it.
    fn apply_form(&self, mut snapshot: FormSnapshot, from_cache: bool) {
        for write in self.pending.snapshot() {
            snapshot
                .fields
                .set(write.key, FieldEntry::new(write.value).at(write.timestamp));
        }

        let previous = {
            let mut form = self.form.lock().unwrap();
            std::mem::replace(&mut *form, snapshot.clone()).status
        };
        self.flags.lock().unwrap().has_data = true;

        let status = snapshot.status;
        self.observer.on_event(SessionEvent::StateChanged {
            snapshot,
            from_cache,
        });
        if status != previous {
            log::info!("[CaseSession] {} status {:?} -> {:?}", self.id, previous, status);
            self.observer.on_event(SessionEvent::StatusChanged(status));
        }
        if status.is_terminal() {
            self.stop_timers();
            self.client.quiesce();
        }
    }

    fn apply_report(&self, report: ReconcileReport) {
        let mut snapshot = report.snapshot;
        for write in report.replayed {
            snapshot
                .fields
                .set(write.key, FieldEntry::new(write.value).at(write.timestamp));
        }
        self.apply_form(snapshot, false);
    }

    fn set_degraded(&self, degraded: bool) {
        {
            let mut flags = self.flags.lock().unwrap();
            if flags.degraded == degraded {
                return;
            }
            flags.degraded = degraded;
        }
        if degraded {
            log::warn!("[CaseSession] {} entering degraded mode", self.id);
        } else {
            log::info!("[CaseSession] {} back on live data", self.id);
        }
        self.observer
            .on_event(SessionEvent::DegradedModeChanged(degraded));
    }

    /// Fall back to the cached snapshot after a failed fetch.
    fn enter_degraded(&self) {
        if self.flags().degraded {
            return;
        }
        let key = CacheKey::for_session(&self.id);
        match self.cache.get_as::<FormSnapshot>(&key) {
            Ok(Some(snapshot)) => {
                self.set_degraded(true);
                self.apply_form(snapshot, true);
            }
            Ok(None) => {
                log::warn!("[CaseSession] {}", CacheError::Miss(key));
                self.observer
                    .on_event(SessionEvent::NoOfflineData(self.id.clone()));
            }
            Err(e) => {
                log::warn!("[CaseSession] Could not read cached state for {}: {}", self.id, e);
                self.observer
                    .on_event(SessionEvent::NoOfflineData(self.id.clone()));
            }
        }
    }

    fn unmount(&self) {
        {
            let mut flags = self.flags.lock().unwrap();
            if flags.unmounted {
                return;
            }
            flags.unmounted = true;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.scheduler.dispose();
        self.client.leave();
        log::info!("[CaseSession] Unmounted {}", self.id);
    }
}

#[async_trait]
impl TickHandler for SessionInner {
    async fn on_tick(&self, kind: TimerKind, guard: TickGuard) {
        if !guard.is_current() || self.flags().unmounted {
            return;
        }
        if !self.flags().online {
            log::debug!("[CaseSession] Skipping {:?} tick: {}", kind, PollError::Offline);
            return;
        }

        let validity = Validity::Tick(guard);
        match kind {
            TimerKind::FormState => self.refresh_form(&validity).await,
            TimerKind::Participants => self.refresh_participants(&validity).await,
            TimerKind::Heartbeat => self.client.heartbeat().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockSessionApi, RecordingObserver};
    use crate::types::CaseStatus;
    use chrono::Utc;
    use serde_json::json;
    use tokio::time::{Duration, Instant, sleep_until};

    struct Fixture {
        api: Arc<MockSessionApi>,
        cache: Arc<CacheStore>,
        observer: Arc<RecordingObserver>,
        start: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                api: Arc::new(MockSessionApi::new()),
                cache: Arc::new(CacheStore::in_memory()),
                observer: Arc::new(RecordingObserver::new()),
                start: Instant::now(),
            }
        }

        fn session(&self) -> CaseSession {
            CaseSession::builder("case-1", self.api.clone(), self.cache.clone())
                .observer(self.observer.clone())
                .author("medic-1")
                .build()
        }

        async fn at(&self, secs: u64) {
            sleep_until(self.start + Duration::from_secs(secs)).await;
        }
    }

    fn after(secs: Vec<u64>, t: u64) -> Vec<u64> {
        secs.into_iter().filter(|s| *s > t).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_start_when_join_finally_succeeds() {
        let f = Fixture::new();
        f.api.fail_joins(2);
        let session = f.session();

        session.mount().await.unwrap();
        assert_eq!(session.presence(), PresenceState::Joined);
        f.at(15).await;

        assert_eq!(f.api.join_secs(), vec![0, 2, 4]);
        assert_eq!(f.api.form_secs(), vec![0, 9, 14]);
        assert_eq!(f.api.participant_secs(), vec![0, 9, 14]);
        assert!(f.api.heartbeat_secs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hide_stops_timers_and_show_restarts_on_fresh_schedule() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();

        f.at(10).await;
        session.set_visible(false).await.unwrap();
        assert_eq!(session.timer_status(), TimerStatus::default());

        f.at(40).await;
        assert!(after(f.api.form_secs(), 10).is_empty());
        session.set_visible(true).await.unwrap();
        f.at(51).await;

        assert_eq!(f.api.join_secs(), vec![0, 40]);
        assert_eq!(after(f.api.form_secs(), 10), vec![40, 45, 50]);
        assert_eq!(after(f.api.participant_secs(), 10), vec![40, 45, 50]);
        assert!(f.api.heartbeat_secs().is_empty());

        f.at(71).await;
        assert_eq!(f.api.heartbeat_secs(), vec![70]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_leaves_once_and_kills_timers() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();
        assert!(session.timer_status().any());

        f.at(6).await;
        session.unmount();
        session.unmount();
        assert_eq!(session.timer_status(), TimerStatus::default());
        assert_eq!(session.presence(), PresenceState::Left);
        drop(session);

        f.at(120).await;
        assert_eq!(f.api.leave_count(), 1);
        assert_eq!(f.api.form_secs(), vec![0, 5]);
        assert!(f.api.heartbeat_secs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_during_join_retry() {
        let f = Fixture::new();
        f.api.fail_joins(10);
        let session = Arc::new(f.session());

        let mounting = tokio::spawn({
            let session = session.clone();
            async move { session.mount().await }
        });
        f.at(3).await;
        session.unmount();

        let result = mounting.await.unwrap();
        assert!(matches!(result, Err(SessionError::Join(JoinError::Cancelled))));
        f.at(30).await;
        assert_eq!(f.api.join_secs(), vec![0, 2]);
        assert_eq!(f.api.leave_count(), 1);
        assert!(!session.timer_status().any());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hide_and_show_during_join_retry_runs_one_loop() {
        let f = Fixture::new();
        f.api.fail_joins(10);
        let session = Arc::new(f.session());

        let mounting = tokio::spawn({
            let session = session.clone();
            async move { session.mount().await }
        });
        f.at(1).await;
        session.set_visible(false).await.unwrap();
        assert_eq!(session.presence(), PresenceState::Idle);
        let shown = session.set_visible(true).await;

        assert!(mounting.await.unwrap().is_ok());
        assert!(matches!(
            shown,
            Err(SessionError::Join(JoinError::Exhausted { attempts: 3, .. }))
        ));
        f.at(30).await;
        assert_eq!(f.api.join_secs(), vec![0, 1, 3, 5]);
        let failures = f
            .observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::JoinFailed(_)))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(session.presence(), PresenceState::Idle);
        assert!(!session.timer_status().any());
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_after_hide_mid_retry_starts_fresh_schedule() {
        let f = Fixture::new();
        f.api.fail_joins(2);
        let session = Arc::new(f.session());

        let mounting = tokio::spawn({
            let session = session.clone();
            async move { session.mount().await }
        });
        f.at(1).await;
        session.set_visible(false).await.unwrap();
        session.set_visible(true).await.unwrap();
        assert!(mounting.await.unwrap().is_ok());
        f.at(14).await;

        assert_eq!(f.api.join_secs(), vec![0, 1, 3]);
        assert_eq!(after(f.api.form_secs(), 0), vec![3, 8, 13]);
        assert_eq!(session.presence(), PresenceState::Joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_case_never_polls() {
        let f = Fixture::new();
        f.api.set_form(FormSnapshot {
            status: CaseStatus::Completed,
            ..Default::default()
        });
        let session = f.session();

        session.mount().await.unwrap();
        f.at(60).await;

        assert_eq!(session.presence(), PresenceState::Quiesced);
        assert_eq!(f.api.form_secs(), vec![0]);
        assert!(f.api.heartbeat_secs().is_empty());
        assert!(!session.timer_status().any());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_seeing_terminal_status_quiesces() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();

        f.at(7).await;
        f.api.set_form(FormSnapshot {
            status: CaseStatus::Cancelled,
            ..Default::default()
        });
        f.at(30).await;

        assert_eq!(f.api.form_secs(), vec![0, 5, 10]);
        assert_eq!(session.presence(), PresenceState::Quiesced);
        assert!(!session.timer_status().any());
        assert!(
            f.observer
                .saw(|e| *e == SessionEvent::StatusChanged(CaseStatus::Cancelled))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_degrades_and_recovery_replays() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();

        f.at(1).await;
        f.api.fail_form_state(true);
        f.at(6).await;
        assert!(session.is_degraded());
        assert!(f.observer.saw(|e| matches!(
            e,
            SessionEvent::StateChanged {
                from_cache: true,
                ..
            }
        )));

        session.write(FieldKey::HeartRate, json!(99)).unwrap();
        session.flush_writes().await;
        assert!(f.api.patches().is_empty());
        assert_eq!(session.pending_writes().len(), 1);
        assert_eq!(session.form().fields.heart_rate(), Some(99));

        f.api.fail_form_state(false);
        f.at(11).await;

        assert!(!session.is_degraded());
        assert!(session.pending_writes().is_empty());
        assert_eq!(f.api.patches(), vec![(FieldKey::HeartRate, json!(99))]);
        assert_eq!(session.form().fields.heart_rate(), Some(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_edit_replayed_once_on_reconnect() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();

        f.at(2).await;
        session.set_online(false).await.unwrap();
        assert!(session.is_degraded());
        session.write("triage_colour", json!("yellow")).unwrap();

        f.at(12).await;
        assert_eq!(f.api.form_secs(), vec![0]);

        session.set_online(true).await.unwrap();
        f.at(21).await;

        assert_eq!(
            f.api.patches(),
            vec![(FieldKey::parse("triage_colour"), json!("yellow"))]
        );
        assert!(session.pending_writes().is_empty());
        assert!(!session.is_degraded());
        assert_eq!(f.api.form_secs(), vec![0, 12, 15, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_edit_discarded_when_changed_elsewhere() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();

        session.set_online(false).await.unwrap();
        session.write(FieldKey::Diagnosis, json!("angina")).unwrap();
        f.api.set_remote_field(
            FieldKey::Diagnosis,
            FieldEntry::new(json!("STEMI"))
                .at(Utc::now() + chrono::Duration::minutes(1))
                .by("dr-aydin"),
        );

        session.set_online(true).await.unwrap();

        assert!(f.api.patches().is_empty());
        assert!(session.pending_writes().is_empty());
        assert_eq!(session.form().fields.text(&FieldKey::Diagnosis), Some("STEMI"));
        assert!(f.observer.saw(|e| matches!(
            e,
            SessionEvent::FieldChangedElsewhere { key: FieldKey::Diagnosis, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connection_and_no_cache_is_unavailable() {
        let f = Fixture::new();
        f.api.set_offline(true);
        let session = f.session();

        let err = session.mount().await.unwrap_err();

        assert!(matches!(err, SessionError::Unavailable(_)));
        assert!(f.observer.saw(|e| matches!(e, SessionEvent::NoOfflineData(_))));
        assert!(f.observer.saw(|e| matches!(e, SessionEvent::Unavailable(_))));
        assert_eq!(f.api.join_secs(), vec![0, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_state_shown_when_server_unreachable() {
        let f = Fixture::new();
        let cached = FormSnapshot {
            status: CaseStatus::OnScene,
            fields: crate::form::FormState::new()
                .with(FieldKey::PatientName, FieldEntry::new(json!("Zeynep"))),
            revision: Some(4),
        };
        f.cache
            .put(
                &CacheKey::session("case-1"),
                serde_json::to_value(&cached).unwrap(),
            )
            .unwrap();
        f.api.set_offline(true);
        let session = f.session();

        let err = session.mount().await.unwrap_err();

        assert!(matches!(err, SessionError::Join(JoinError::Exhausted { .. })));
        assert!(session.is_degraded());
        assert_eq!(session.form().fields.patient_name(), Some("Zeynep"));
        assert!(!session.timer_status().any());
        assert!(f.observer.saw(|e| matches!(e, SessionEvent::JoinFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_after_unmount_are_refused() {
        let f = Fixture::new();
        let session = f.session();
        session.mount().await.unwrap();
        session.unmount();

        assert_eq!(
            session.write(FieldKey::HeartRate, json!(80)),
            Err(WriteError::Unmounted)
        );
        assert!(matches!(session.mount().await, Err(SessionError::Unmounted)));
    }
}
