//! Presence registration: join with retry, heartbeat, leave.
//!
//! ```text
//!   Idle ──join──► Joining ──ok──► Joined ──terminal──► Quiesced
//!    ▲               │                │                    │
//!    └──exhausted────┘                └───────leave────────┴──► Left
//! ```
//!
//! `leave` is reachable from every state and is final. It also cancels a
//! join retry loop that is still running.
//!
//! Only one join runs at a time: starting a new join, or calling
//! [`SessionClient::cancel_join`], ends the previous retry loop with
//! [`JoinError::Superseded`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::api::SessionApi;
use crate::error::{ApiError, JoinError};
use crate::events::{SessionEvent, SessionObserver};
use crate::types::SessionId;

/// Our own presence in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// Not registered.
    Idle,
    /// Join in progress (including retry delays).
    Joining,
    /// Registered.
    Joined,
    /// Registered, but the case is terminal: no heartbeat, no polling.
    Quiesced,
    /// Left. Final.
    Left,
}

/// Join retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Manages presence for one session.
pub struct SessionClient {
    session: SessionId,
    api: Arc<dyn SessionApi>,
    observer: Arc<dyn SessionObserver>,
    policy: JoinPolicy,
    state: Mutex<PresenceState>,
    left: AtomicBool,
    closed: watch::Sender<bool>,
    joins: watch::Sender<u64>,
}

impl SessionClient {
    /// Create a client in the `Idle` state.
    pub fn new(
        session: SessionId,
        api: Arc<dyn SessionApi>,
        observer: Arc<dyn SessionObserver>,
        policy: JoinPolicy,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let (joins, _) = watch::channel(0);
        Self {
            session,
            api,
            observer,
            policy,
            state: Mutex::new(PresenceState::Idle),
            left: AtomicBool::new(false),
            closed,
            joins,
        }
    }

    /// Current presence state.
    pub fn state(&self) -> PresenceState {
        *self.state.lock().unwrap()
    }

    /// Whether `leave` has been issued.
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: PresenceState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == next || (*state == PresenceState::Left && next != PresenceState::Left) {
                return false;
            }
            *state = next;
        }
        log::debug!("[SessionClient] {} presence -> {:?}", self.session, next);
        self.observer.on_event(SessionEvent::PresenceChanged(next));
        true
    }

    /// Register presence, retrying with a fixed delay.
    ///
    /// Resolves with [`JoinError::Cancelled`] as soon as [`leave`](Self::leave)
    /// is called, and with [`JoinError::Superseded`] when another join starts
    /// or [`cancel_join`](Self::cancel_join) is called, even mid-request or
    /// mid-delay. A superseded join leaves the presence state alone.
    pub async fn join(&self) -> Result<(), JoinError> {
        if self.has_left() {
            return Err(JoinError::Cancelled);
        }

        let mut closed = self.closed.subscribe();
        let mut ticket = 0;
        self.joins.send_modify(|current| {
            *current += 1;
            ticket = *current;
        });
        let mut joins = self.joins.subscribe();
        self.set_state(PresenceState::Joining);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = ApiError::Network("join not attempted".to_string());

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                log::info!(
                    "[SessionClient] Retrying join in {}s (attempt {}/{})",
                    self.policy.retry_delay.as_secs(),
                    attempt,
                    max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.policy.retry_delay) => {}
                    _ = wait_closed(&mut closed) => return Err(JoinError::Cancelled),
                    _ = wait_superseded(&mut joins, ticket) => return Err(JoinError::Superseded),
                }
            }

            let result = tokio::select! {
                result = self.api.join(&self.session) => result,
                _ = wait_closed(&mut closed) => return Err(JoinError::Cancelled),
                _ = wait_superseded(&mut joins, ticket) => return Err(JoinError::Superseded),
            };
            if *self.joins.borrow() != ticket {
                return Err(JoinError::Superseded);
            }

            match result {
                Ok(()) => {
                    if self.has_left() {
                        return Err(JoinError::Cancelled);
                    }
                    log::info!("[SessionClient] Joined {}", self.session);
                    self.set_state(PresenceState::Joined);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "[SessionClient] Join attempt {}/{} for {} failed: {}",
                        attempt,
                        max_attempts,
                        self.session,
                        e
                    );
                    last_error = e;
                }
            }
        }

        log::error!(
            "[SessionClient] Giving up on joining {} after {} attempts",
            self.session,
            max_attempts
        );
        self.set_state(PresenceState::Idle);
        Err(JoinError::Exhausted {
            attempts: max_attempts,
            source: last_error,
        })
    }

    /// Stop a join retry loop that is still running. Presence goes back to
    /// `Idle` if it was still joining.
    pub fn cancel_join(&self) {
        self.joins.send_modify(|current| *current += 1);
        let reverted = {
            let state = self.state.lock().unwrap();
            *state == PresenceState::Joining
        };
        if reverted && self.set_state(PresenceState::Idle) {
            log::info!("[SessionClient] Join for {} cancelled", self.session);
        }
    }

    /// Renew presence. Failures are logged and left to the next beat.
    pub async fn heartbeat(&self) {
        if self.state() != PresenceState::Joined {
            log::debug!(
                "[SessionClient] Skipping heartbeat for {} ({:?})",
                self.session,
                self.state()
            );
            return;
        }
        if let Err(e) = self.api.heartbeat(&self.session).await {
            log::warn!("[SessionClient] Heartbeat for {} failed: {}", self.session, e);
        }
    }

    /// Stop renewing presence because the case reached a terminal status.
    pub fn quiesce(&self) {
        if self.state() == PresenceState::Joined && self.set_state(PresenceState::Quiesced) {
            log::info!("[SessionClient] {} is terminal, presence quiesced", self.session);
        }
    }

    /// Deregister presence.
    ///
    /// Sent at most once per client, on a detached task, and never awaited.
    /// Errors are swallowed. Outside a tokio runtime the request is skipped.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.send_replace(true);
        self.set_state(PresenceState::Left);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let api = Arc::clone(&self.api);
                let session = self.session.clone();
                handle.spawn(async move {
                    if let Err(e) = api.leave(&session).await {
                        log::debug!("[SessionClient] Ignoring leave failure for {}: {}", session, e);
                    }
                });
            }
            Err(_) => log::warn!(
                "[SessionClient] No async runtime, leave for {} not sent",
                self.session
            ),
        }
    }
}

/// Resolves once a newer join has taken over from `ticket`.
async fn wait_superseded(joins: &mut watch::Receiver<u64>, ticket: u64) {
    loop {
        if *joins.borrow_and_update() != ticket {
            return;
        }
        if joins.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves once the client has been closed.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockSessionApi, RecordingObserver};
    use tokio::time::sleep;

    fn client(api: &Arc<MockSessionApi>, observer: &Arc<RecordingObserver>) -> Arc<SessionClient> {
        Arc::new(SessionClient::new(
            SessionId::new("case-1"),
            api.clone(),
            observer.clone(),
            JoinPolicy::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_with_fixed_delay() {
        let api = Arc::new(MockSessionApi::new());
        api.fail_joins(2);
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        client.join().await.unwrap();

        assert_eq!(api.join_secs(), vec![0, 2, 4]);
        assert_eq!(client.state(), PresenceState::Joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_exhaustion_reverts_to_idle() {
        let api = Arc::new(MockSessionApi::new());
        api.fail_joins(10);
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        let err = client.join().await.unwrap_err();

        assert!(matches!(err, JoinError::Exhausted { attempts: 3, .. }));
        assert_eq!(api.join_secs(), vec![0, 2, 4]);
        assert_eq!(client.state(), PresenceState::Idle);
        assert!(observer.events().contains(&SessionEvent::PresenceChanged(PresenceState::Idle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_cancels_join_retry() {
        let api = Arc::new(MockSessionApi::new());
        api.fail_joins(10);
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        let joining = tokio::spawn({
            let client = client.clone();
            async move { client.join().await }
        });
        sleep(Duration::from_secs(1)).await;
        client.leave();

        assert_eq!(joining.await.unwrap(), Err(JoinError::Cancelled));
        sleep(Duration::from_secs(10)).await;
        assert_eq!(api.join_secs(), vec![0]);
        assert_eq!(api.leave_count(), 1);
        assert_eq!(client.state(), PresenceState::Left);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_is_sent_once_and_errors_are_swallowed() {
        let api = Arc::new(MockSessionApi::new());
        api.fail_leaves();
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        client.leave();
        client.leave();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(api.leave_count(), 1);
        assert_eq!(client.join().await, Err(JoinError::Cancelled));
    }

    #[tokio::test]
    async fn test_heartbeat_only_while_joined() {
        let api = Arc::new(MockSessionApi::new());
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        client.heartbeat().await;
        assert_eq!(api.heartbeat_secs().len(), 0);

        client.join().await.unwrap();
        client.heartbeat().await;
        assert_eq!(api.heartbeat_secs().len(), 1);

        client.quiesce();
        assert_eq!(client.state(), PresenceState::Quiesced);
        client.heartbeat().await;
        assert_eq!(api.heartbeat_secs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_join_supersedes_running_retry_loop() {
        let api = Arc::new(MockSessionApi::new());
        api.fail_joins(10);
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.join().await }
        });
        sleep(Duration::from_secs(1)).await;

        let second = client.join().await;

        assert_eq!(first.await.unwrap(), Err(JoinError::Superseded));
        assert!(matches!(second, Err(JoinError::Exhausted { attempts: 3, .. })));
        assert_eq!(api.join_secs(), vec![0, 1, 3, 5]);
        assert_eq!(client.state(), PresenceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_join_stops_retries() {
        let api = Arc::new(MockSessionApi::new());
        api.fail_joins(10);
        let observer = Arc::new(RecordingObserver::new());
        let client = client(&api, &observer);

        let joining = tokio::spawn({
            let client = client.clone();
            async move { client.join().await }
        });
        sleep(Duration::from_secs(1)).await;
        client.cancel_join();

        assert_eq!(joining.await.unwrap(), Err(JoinError::Superseded));
        sleep(Duration::from_secs(10)).await;
        assert_eq!(api.join_secs(), vec![0]);
        assert_eq!(client.state(), PresenceState::Idle);
        assert!(!client.has_left());
    }
}
