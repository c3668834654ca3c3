//! Interval timers for polling and heartbeat.
//!
//! Three independent timers, each in its own slot:
//!
//! | Timer          | Default period | Started by        |
//! |----------------|----------------|-------------------|
//! | form state     | 5s             | `start_polling`   |
//! | participants   | 5s             | `start_polling`   |
//! | heartbeat      | 30s            | `start_heartbeat` |
//!
//! Each slot carries a generation counter. Stopping bumps it synchronously
//! and aborts the task; a tick captures the generation it was spawned with in
//! a [`TickGuard`], and the handler re-checks it after every await before
//! applying anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Form-state poll.
    FormState,
    /// Participant-list poll.
    Participants,
    /// Presence heartbeat.
    Heartbeat,
}

impl TimerKind {
    fn slot(self) -> usize {
        match self {
            TimerKind::FormState => 0,
            TimerKind::Participants => 1,
            TimerKind::Heartbeat => 2,
        }
    }
}

/// Proof that a tick belongs to the live timer generation.
#[derive(Debug, Clone)]
pub struct TickGuard {
    current: Arc<AtomicU64>,
    generation: u64,
}

impl TickGuard {
    /// False once the timer that produced this tick was stopped or restarted.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Receives timer ticks.
#[async_trait]
pub trait TickHandler: Send + Sync {
    /// Handle one tick. Check `guard` before applying results.
    async fn on_tick(&self, kind: TimerKind, guard: TickGuard);
}

/// Which timers are running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStatus {
    /// Form-state poll running.
    pub form_polling: bool,
    /// Participant poll running.
    pub participant_polling: bool,
    /// Heartbeat running.
    pub heartbeat: bool,
}

impl TimerStatus {
    /// Whether any timer is running.
    pub fn any(&self) -> bool {
        self.form_polling || self.participant_polling || self.heartbeat
    }
}

#[derive(Default)]
struct Slot {
    generation: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn stop(&mut self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

/// Owns the poll and heartbeat timers of one session.
pub struct PollingScheduler {
    poll_interval: Duration,
    heartbeat_interval: Duration,
    handler: Weak<dyn TickHandler>,
    slots: Mutex<[Slot; 3]>,
    disposed: AtomicBool,
}

impl PollingScheduler {
    /// Create a scheduler with no running timers.
    ///
    /// The handler is held weakly so the scheduler can live inside it.
    pub fn new(
        handler: Weak<dyn TickHandler>,
        poll_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            poll_interval,
            heartbeat_interval,
            handler,
            slots: Mutex::new(Default::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start both poll timers. No-op if they are already running.
    pub fn start_polling(&self) {
        self.start(TimerKind::FormState, self.poll_interval);
        self.start(TimerKind::Participants, self.poll_interval);
    }

    /// Stop both poll timers.
    pub fn stop_polling(&self) {
        let mut slots = self.slots.lock().unwrap();
        let form = slots[TimerKind::FormState.slot()].stop();
        let participants = slots[TimerKind::Participants.slot()].stop();
        if form || participants {
            log::debug!("[PollingScheduler] Polling stopped");
        }
    }

    /// Start the heartbeat timer. No-op if it is already running.
    pub fn start_heartbeat(&self) {
        self.start(TimerKind::Heartbeat, self.heartbeat_interval);
    }

    /// Stop the heartbeat timer.
    pub fn stop_heartbeat(&self) {
        if self.slots.lock().unwrap()[TimerKind::Heartbeat.slot()].stop() {
            log::debug!("[PollingScheduler] Heartbeat stopped");
        }
    }

    /// Stop every timer for good. Later starts are ignored.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            slot.stop();
        }
        log::debug!("[PollingScheduler] Disposed");
    }

    /// Snapshot of which timers are running.
    pub fn status(&self) -> TimerStatus {
        let slots = self.slots.lock().unwrap();
        TimerStatus {
            form_polling: slots[TimerKind::FormState.slot()].is_running(),
            participant_polling: slots[TimerKind::Participants.slot()].is_running(),
            heartbeat: slots[TimerKind::Heartbeat.slot()].is_running(),
        }
    }

    fn start(&self, kind: TimerKind, period: Duration) {
        if self.disposed.load(Ordering::SeqCst) {
            log::debug!("[PollingScheduler] Ignoring start of {:?} after dispose", kind);
            return;
        }

        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[kind.slot()];
        if slot.is_running() {
            return;
        }

        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&slot.generation);
        let handler = self.handler.clone();

        log::debug!("[PollingScheduler] Starting {:?} every {:?}", kind, period);
        slot.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let guard = TickGuard {
                    current: Arc::clone(&current),
                    generation,
                };
                if !guard.is_current() {
                    break;
                }
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.on_tick(kind, guard).await;
            }
        }));
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Ok(slots) = self.slots.get_mut() {
            for slot in slots.iter_mut() {
                slot.stop();
            }
        }
    }
}
