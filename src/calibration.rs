//! Live-delay calibration: a 1 Hz timer state machine measuring the gap
//! between the data feed and the TV picture.
//!
//! The user arms the timer, it starts running when the chosen reference
//! fires (session start or formation start), and the user stops it when the
//! reference moment appears on their screen. The elapsed time, clamped to
//! [0, 300] seconds, becomes the live delay. Replay playback blocks the
//! whole flow; the outcome says so instead of erroring.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{LiveBus, Subscription};
use crate::normalize::session;
use crate::reference::ReferenceKind;
use crate::types::StreamId;

/// Wall-clock budget for a running calibration.
pub const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(120);
/// Committed delays are clamped to this many seconds.
pub const MAX_COMMIT_S: u32 = 300;

/// Sink for the measured delay. The session clock implements this.
pub trait DelayCommit: Send + Sync {
    fn commit_delay(&self, seconds: u32, source: &str);
}

impl DelayCommit for crate::clock::SessionClock {
    fn commit_delay(&self, seconds: u32, source: &str) {
        info!(seconds, source, "committing calibrated live delay");
        self.set_live_delay(seconds);
    }
}

/// Replay engagement check, implemented by the replay controller. Kept as a
/// trait so the two managers need not own each other.
pub trait ReplayQuery: Send + Sync {
    fn replay_engaged(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationMode {
    #[default]
    Idle,
    Waiting,
    Running,
}

/// Outcome of the last committed calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub seconds: u32,
    pub completed_at: DateTime<Utc>,
    pub source: String,
}

/// Published state of the calibration flow.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationSnapshot {
    pub mode: CalibrationMode,
    pub reference: ReferenceKind,
    pub waiting_since: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_s: f64,
    pub timeout_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub last_result: Option<CalibrationResult>,
}

/// Result of a calibration operation. Control-flow outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// Armed and waiting for the reference.
    Armed,
    /// The delay was committed.
    Committed { seconds: u32 },
    Cancelled,
    /// Replay is engaged; nothing was changed.
    BlockedByReplay,
    /// `complete` was called while the timer was not running.
    NotRunning,
}

/// User-facing notification raised for calibration outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotification {
    pub title: String,
    pub message: String,
}

struct State {
    snapshot: CalibrationSnapshot,
    session_live: bool,
    formation_start_utc: Option<DateTime<Utc>>,
    tick: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<State>,
    tx: watch::Sender<CalibrationSnapshot>,
    notifications: broadcast::Sender<UserNotification>,
    delay: Arc<dyn DelayCommit>,
    replay: Mutex<Option<Arc<dyn ReplayQuery>>>,
    reload: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    cancel: CancellationToken,
}

/// Coordinates the timer-based calibration workflow. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct CalibrationManager {
    inner: Arc<Inner>,
}

impl CalibrationManager {
    pub fn new(delay: Arc<dyn DelayCommit>) -> Self {
        let (tx, _) = watch::channel(CalibrationSnapshot::default());
        let (notifications, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    snapshot: CalibrationSnapshot::default(),
                    session_live: false,
                    formation_start_utc: None,
                    tick: None,
                }),
                tx,
                notifications,
                delay,
                replay: Mutex::new(None),
                reload: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Wire in the replay controller after construction.
    pub fn set_replay_query(&self, query: Arc<dyn ReplayQuery>) {
        *self.inner.replay.lock().unwrap_or_else(|e| e.into_inner()) = Some(query);
    }

    /// Hook invoked after a successful commit so dependent consumers reload.
    pub fn set_reload_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.reload.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Subscribe to the SessionStatus stream that drives the session
    /// reference. The returned subscription must be kept alive.
    pub fn attach(&self, bus: &LiveBus) -> Subscription {
        let manager = self.clone();
        bus.subscribe(StreamId::SessionStatus, move |payload| {
            manager.handle_session_status(payload);
        })
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CalibrationSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<UserNotification> {
        self.inner.notifications.subscribe()
    }

    /// Change the timing reference; a satisfied reference starts a waiting
    /// timer immediately.
    pub fn set_reference(&self, reference: ReferenceKind) {
        let start = {
            let mut state = self.lock();
            state.snapshot.reference = reference;
            let waiting = state.snapshot.mode == CalibrationMode::Waiting;
            let start = match reference {
                ReferenceKind::Session if waiting && state.session_live => Some(None),
                ReferenceKind::Formation if waiting => {
                    state.formation_start_utc.map(Some)
                }
                _ => None,
            };
            self.publish(&mut state);
            start
        };
        if let Some(started_at) = start {
            self.start_timer("reference-switch", started_at);
        }
    }

    /// Arm the calibration and wait for the reference to fire.
    pub fn prepare(&self, source: &str) -> CalibrationOutcome {
        if self.replay_engaged() {
            return self.blocked_by_replay(source);
        }
        debug!(source, "calibration armed");
        let start = {
            let mut state = self.lock();
            self.stop_tick(&mut state);
            let reference = state.snapshot.reference;
            state.snapshot.mode = CalibrationMode::Waiting;
            state.snapshot.waiting_since = Some(Utc::now());
            state.snapshot.started_at = None;
            state.snapshot.elapsed_s = 0.0;
            state.snapshot.timeout_at = None;
            state.snapshot.message = Some(waiting_message(reference).to_string());
            self.publish(&mut state);
            match reference {
                ReferenceKind::Session if state.session_live => Some(None),
                ReferenceKind::Formation => state.formation_start_utc.map(Some),
                _ => None,
            }
        };
        if let Some(started_at) = start {
            self.start_timer("reference-already-satisfied", started_at);
        }
        CalibrationOutcome::Armed
    }

    /// Commit the measured delay.
    pub fn complete(&self, source: &str) -> CalibrationOutcome {
        if self.replay_engaged() {
            return self.blocked_by_replay(source);
        }
        let seconds = {
            let mut state = self.lock();
            if state.snapshot.mode != CalibrationMode::Running {
                return CalibrationOutcome::NotRunning;
            }
            let elapsed = state
                .snapshot
                .started_at
                .map(|s| (Utc::now() - s).num_milliseconds().max(0) as f64 / 1000.0)
                .unwrap_or(0.0);
            let seconds = (elapsed.round() as i64).clamp(0, MAX_COMMIT_S as i64) as u32;
            state.snapshot.last_result = Some(CalibrationResult {
                seconds,
                completed_at: Utc::now(),
                source: source.to_string(),
            });
            let message = format!("Live delay updated to {seconds} seconds.");
            self.to_idle(&mut state, Some(message));
            seconds
        };
        self.inner.delay.commit_delay(seconds, "calibration");
        self.notify("F1 live delay calibrated", &format!("Live delay updated to {seconds} seconds."));
        let reload = self.inner.reload.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(reload) = reload {
            reload();
        }
        CalibrationOutcome::Committed { seconds }
    }

    /// Abort the flow. A `timeout` source raises a user notification.
    pub fn cancel(&self, source: &str) -> CalibrationOutcome {
        if self.replay_engaged() && source != "replay" {
            return self.blocked_by_replay(source);
        }
        {
            let mut state = self.lock();
            self.to_idle(&mut state, Some("Calibration cancelled.".to_string()));
        }
        if source == "timeout" {
            self.notify(
                "F1 live delay",
                "Calibration timed out after 2 minutes without changing the delay.",
            );
        }
        CalibrationOutcome::Cancelled
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut state = self.lock();
        self.stop_tick(&mut state);
    }

    /// Formation tracker updates, routed in by the engine.
    pub fn handle_formation(&self, formation_start_utc: Option<DateTime<Utc>>) {
        let start = {
            let mut state = self.lock();
            state.formation_start_utc = formation_start_utc;
            (state.snapshot.reference == ReferenceKind::Formation
                && state.snapshot.mode == CalibrationMode::Waiting)
                .then_some(formation_start_utc)
                .flatten()
        };
        if let Some(utc) = start {
            self.start_timer("formation-marker-found", Some(utc));
        }
    }

    pub(crate) fn handle_session_status(&self, payload: &Value) {
        let live = session::is_session_live(payload);
        let finished = session::session_status(payload)
            .map(|s| session::is_session_end(&s))
            .unwrap_or(false);
        let action = {
            let mut state = self.lock();
            state.session_live = live;
            if state.snapshot.reference == ReferenceKind::Session
                && state.snapshot.mode == CalibrationMode::Waiting
                && live
            {
                Some("session-live")
            } else if state.snapshot.mode == CalibrationMode::Running && finished {
                Some("session-finished")
            } else {
                None
            }
        };
        match action {
            Some("session-live") => self.start_timer("session-status-live", None),
            Some("session-finished") => {
                let mut state = self.lock();
                self.to_idle(
                    &mut state,
                    Some("Session ended; calibration stopped.".to_string()),
                );
            }
            _ => {}
        }
    }

    // Internal helpers -----------------------------------------------------

    fn start_timer(&self, reason: &str, started_at: Option<DateTime<Utc>>) {
        debug!(reason, "calibration timer started");
        let mut state = self.lock();
        self.stop_tick(&mut state);
        let start = started_at.unwrap_or_else(Utc::now);
        let reference = state.snapshot.reference;
        state.snapshot.mode = CalibrationMode::Running;
        state.snapshot.waiting_since = None;
        state.snapshot.started_at = Some(start);
        state.snapshot.elapsed_s = 0.0;
        state.snapshot.timeout_at =
            Some(Utc::now() + ChronoDuration::seconds(CALIBRATION_TIMEOUT.as_secs() as i64));
        state.snapshot.message = Some(running_message(reference).to_string());
        self.publish(&mut state);

        let inner = Arc::clone(&self.inner);
        let manager = self.clone();
        state.tick = Some(tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + CALIBRATION_TIMEOUT;
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                {
                    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    if state.snapshot.mode != CalibrationMode::Running {
                        return;
                    }
                    if let Some(started) = state.snapshot.started_at {
                        state.snapshot.elapsed_s =
                            (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;
                    }
                    inner.tx.send_replace(state.snapshot.clone());
                }
                if tokio::time::Instant::now() >= deadline {
                    debug!("calibration timed out");
                    manager.cancel("timeout");
                    return;
                }
            }
        }));
    }

    fn to_idle(&self, state: &mut std::sync::MutexGuard<'_, State>, message: Option<String>) {
        self.stop_tick(state);
        state.snapshot.mode = CalibrationMode::Idle;
        state.snapshot.waiting_since = None;
        state.snapshot.started_at = None;
        state.snapshot.elapsed_s = 0.0;
        state.snapshot.timeout_at = None;
        state.snapshot.message = message;
        self.publish(state);
    }

    fn stop_tick(&self, state: &mut std::sync::MutexGuard<'_, State>) {
        if let Some(tick) = state.tick.take() {
            tick.abort();
        }
    }

    fn publish(&self, state: &mut std::sync::MutexGuard<'_, State>) {
        self.inner.tx.send_replace(state.snapshot.clone());
    }

    /// Reset to idle with the replay-blocked message and notify the user.
    /// Also reachable directly for surfaces that pre-check replay state.
    pub fn blocked_by_replay(&self, source: &str) -> CalibrationOutcome {
        debug!(source, "calibration blocked by replay");
        {
            let mut state = self.lock();
            self.to_idle(
                &mut state,
                Some("Live delay calibration is not available in replay mode.".to_string()),
            );
        }
        self.notify("F1 live delay", "Live delay calibration is not available in replay mode.");
        CalibrationOutcome::BlockedByReplay
    }

    fn replay_engaged(&self) -> bool {
        self.inner
            .replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|q| q.replay_engaged())
            .unwrap_or(false)
    }

    fn notify(&self, title: &str, message: &str) {
        let _ = self.inner.notifications.send(UserNotification {
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn waiting_message(reference: ReferenceKind) -> &'static str {
    match reference {
        ReferenceKind::Session => "Waiting for SessionStatus to report 'Started'.",
        ReferenceKind::Formation => "Waiting for formation start marker (race/sprint).",
    }
}

fn running_message(reference: ReferenceKind) -> &'static str {
    match reference {
        ReferenceKind::Session => {
            "Calibration running - press 'Match live delay' when TV catches up."
        }
        ReferenceKind::Formation => {
            "Calibration running from formation marker - press 'Match live delay' when TV catches up."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingCommit {
        seconds: AtomicU32,
        called: AtomicBool,
    }

    impl DelayCommit for RecordingCommit {
        fn commit_delay(&self, seconds: u32, _source: &str) {
            self.seconds.store(seconds, Ordering::SeqCst);
            self.called.store(true, Ordering::SeqCst);
        }
    }

    struct ReplayActive(bool);

    impl ReplayQuery for ReplayActive {
        fn replay_engaged(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn replay_blocks_arming() {
        let commit = Arc::new(RecordingCommit::default());
        let manager = CalibrationManager::new(commit.clone());
        manager.set_replay_query(Arc::new(ReplayActive(true)));

        assert_eq!(manager.prepare("button"), CalibrationOutcome::BlockedByReplay);
        assert_eq!(manager.snapshot().mode, CalibrationMode::Idle);
        assert!(!commit.called.load(Ordering::SeqCst));

        let mut notifications = manager.subscribe_notifications();
        manager.prepare("button");
        let note = notifications.recv().await.unwrap();
        assert!(note.message.contains("replay"));
    }

    #[tokio::test]
    async fn session_reference_flow_commits_clamped_delay() {
        let commit = Arc::new(RecordingCommit::default());
        let manager = CalibrationManager::new(commit.clone());
        manager.set_replay_query(Arc::new(ReplayActive(false)));

        assert_eq!(manager.prepare("button"), CalibrationOutcome::Armed);
        assert_eq!(manager.snapshot().mode, CalibrationMode::Waiting);

        manager.handle_session_status(&json!({"Status": "Started"}));
        assert_eq!(manager.snapshot().mode, CalibrationMode::Running);

        // Pretend the timer has run for far longer than the clamp allows.
        {
            let mut state = manager.inner.state.lock().unwrap();
            state.snapshot.started_at = Some(Utc::now() - ChronoDuration::seconds(900));
        }
        match manager.complete("button") {
            CalibrationOutcome::Committed { seconds } => assert_eq!(seconds, MAX_COMMIT_S),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(commit.seconds.load(Ordering::SeqCst), MAX_COMMIT_S);
        assert_eq!(manager.snapshot().mode, CalibrationMode::Idle);
        manager.close();
    }

    #[tokio::test]
    async fn complete_without_running_timer_is_typed() {
        let manager = CalibrationManager::new(Arc::new(RecordingCommit::default()));
        assert_eq!(manager.complete("button"), CalibrationOutcome::NotRunning);
    }

    #[tokio::test]
    async fn formation_reference_starts_at_marker_utc() {
        let commit = Arc::new(RecordingCommit::default());
        let manager = CalibrationManager::new(commit.clone());
        manager.set_reference(ReferenceKind::Formation);
        manager.prepare("button");
        assert_eq!(manager.snapshot().mode, CalibrationMode::Waiting);

        let marker = Utc::now() - ChronoDuration::seconds(42);
        manager.handle_formation(Some(marker));
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.mode, CalibrationMode::Running);
        assert_eq!(snapshot.started_at, Some(marker));

        match manager.complete("button") {
            CalibrationOutcome::Committed { seconds } => {
                assert!((41..=43).contains(&seconds), "measured {seconds}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        manager.close();
    }

    #[tokio::test(start_paused = true)]
    async fn running_timer_times_out_and_notifies() {
        let manager = CalibrationManager::new(Arc::new(RecordingCommit::default()));
        let mut notifications = manager.subscribe_notifications();
        manager.prepare("button");
        manager.handle_session_status(&json!({"Status": "Started"}));
        assert_eq!(manager.snapshot().mode, CalibrationMode::Running);

        tokio::time::sleep(CALIBRATION_TIMEOUT + Duration::from_secs(5)).await;
        assert_eq!(manager.snapshot().mode, CalibrationMode::Idle);
        let note = notifications.recv().await.unwrap();
        assert!(note.message.contains("timed out"));
        manager.close();
    }

    #[tokio::test]
    async fn session_finish_stops_running_calibration() {
        let manager = CalibrationManager::new(Arc::new(RecordingCommit::default()));
        manager.prepare("button");
        manager.handle_session_status(&json!({"Status": "Started"}));
        manager.handle_session_status(&json!({"Status": "Finished"}));
        assert_eq!(manager.snapshot().mode, CalibrationMode::Idle);
        manager.close();
    }

    #[tokio::test]
    async fn reload_hook_fires_after_commit() {
        let manager = CalibrationManager::new(Arc::new(RecordingCommit::default()));
        let reloaded = Arc::new(AtomicBool::new(false));
        let reloaded2 = Arc::clone(&reloaded);
        manager.set_reload_hook(Arc::new(move || {
            reloaded2.store(true, Ordering::SeqCst);
        }));
        manager.prepare("button");
        manager.handle_session_status(&json!({"Status": "Started"}));
        manager.complete("button");
        assert!(reloaded.load(Ordering::SeqCst));
        manager.close();
    }
}
