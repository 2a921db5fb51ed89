//! Replay controller: selection, loading and playback orchestration.
//!
//! Playback works by swapping the bus onto a replay transport. While a
//! replay is engaged the availability register is replay-locked so the live
//! supervisor cannot flip state underneath it. On completion the previous
//! transport factory is restored *before* the bus closes; restoring after
//! would let the supervisor reconnect the drained replay transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::availability::LiveAvailability;
use crate::bus::LiveBus;
use crate::calibration::ReplayQuery;
use crate::error::{Result, TimingError};
use crate::reference::ReferenceKind;
use crate::stream::ThrottleExt;
use crate::transport::{Transport, TransportFactory};
use crate::transports::replay::{PlaybackHandle, PlaybackStatus, ReplayTransport};
use crate::types::{ReplaySession, ReplayState, StreamId};

use super::recorder::{LoadedReplay, ReplayRecorder};

/// Completion poll cadence while a replay plays.
const COMPLETION_POLL: Duration = Duration::from_millis(250);
/// Position updates are throttled to this for UI streams.
const STATUS_THROTTLE: Duration = Duration::from_millis(250);

/// Published controller state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplayControllerSnapshot {
    pub state: Option<ReplayState>,
    pub selected_label: Option<String>,
    pub selected_id: Option<String>,
    pub error: Option<String>,
    pub sessions_count: usize,
}

struct State {
    state: ReplayState,
    sessions: Vec<ReplaySession>,
    selected: Option<ReplaySession>,
    loaded: Option<LoadedReplay>,
    handle: Option<PlaybackHandle>,
    /// The factory the bus ran before the swap; `Some(None)` means it had
    /// none.
    saved_factory: Option<Option<TransportFactory>>,
    error: Option<String>,
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    recorder: Arc<ReplayRecorder>,
    bus: Arc<LiveBus>,
    availability: Arc<LiveAvailability>,
    start_reference: Mutex<ReferenceKind>,
    speed: Mutex<f64>,
    state: Mutex<State>,
    tx: watch::Sender<ReplayControllerSnapshot>,
}

/// High-level controller coordinating the recorder and playback. Cheap to
/// clone; clones share state.
#[derive(Clone)]
pub struct ReplayController {
    inner: Arc<Inner>,
}

impl ReplayController {
    pub fn new(
        recorder: Arc<ReplayRecorder>,
        bus: Arc<LiveBus>,
        availability: Arc<LiveAvailability>,
    ) -> Self {
        let (tx, _) = watch::channel(ReplayControllerSnapshot {
            state: Some(ReplayState::Idle),
            ..ReplayControllerSnapshot::default()
        });
        Self {
            inner: Arc::new(Inner {
                recorder,
                bus,
                availability,
                start_reference: Mutex::new(ReferenceKind::Session),
                speed: Mutex::new(1.0),
                state: Mutex::new(State {
                    state: ReplayState::Idle,
                    sessions: Vec::new(),
                    selected: None,
                    loaded: None,
                    handle: None,
                    saved_factory: None,
                    error: None,
                    watcher: None,
                }),
                tx,
            }),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.inner.recorder.initialize().await
    }

    pub fn state(&self) -> ReplayState {
        self.lock().state
    }

    pub fn snapshot(&self) -> ReplayControllerSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ReplayControllerSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn set_start_reference(&self, reference: ReferenceKind) {
        *self.inner.start_reference.lock().unwrap_or_else(|e| e.into_inner()) = reference;
    }

    /// Clamped by the transport to [0.1, 10].
    pub fn set_speed(&self, speed: f64) {
        *self.inner.speed.lock().unwrap_or_else(|e| e.into_inner()) = speed;
    }

    /// Refresh the selectable session list from the season index.
    pub async fn refresh_sessions(&self) -> Result<Vec<ReplaySession>> {
        let sessions = self.inner.recorder.list_sessions(None).await?;
        {
            let mut state = self.lock();
            state.sessions = sessions.clone();
            self.publish(&mut state);
        }
        Ok(sessions)
    }

    /// Select a session from the cached list and load it.
    pub async fn prepare_and_load_session(&self, session_id: &str) -> Result<()> {
        let session = {
            let state = self.lock();
            state.sessions.iter().find(|s| s.unique_id() == session_id).cloned()
        };
        let Some(session) = session else {
            return Err(TimingError::replay_error(format!("session {session_id} not found")));
        };
        self.prepare_and_load(session).await
    }

    /// Select and load one session: download (or reuse) the cache and move
    /// to `Ready`.
    pub async fn prepare_and_load(&self, session: ReplaySession) -> Result<()> {
        {
            let mut state = self.lock();
            state.selected = Some(session.clone());
            state.loaded = None;
            state.error = None;
            state.state = ReplayState::Selected;
            self.publish(&mut state);
            state.state = ReplayState::Loading;
            self.publish(&mut state);
        }
        info!(session = %session.label(), "loading replay session");
        match self.inner.recorder.record(&session).await {
            Ok(loaded) => {
                let mut state = self.lock();
                info!(
                    frames = loaded.index.total_frames,
                    session_start_ms = loaded.index.session_started_at_ms,
                    "replay session ready"
                );
                state.loaded = Some(loaded);
                state.state = ReplayState::Ready;
                self.publish(&mut state);
                Ok(())
            }
            Err(err) => {
                let mut state = self.lock();
                warn!(%err, "replay session load failed");
                state.error = Some(err.to_string());
                state.state = ReplayState::Selected;
                self.publish(&mut state);
                Err(err)
            }
        }
    }

    /// Start playback of the loaded session.
    pub async fn play(&self) -> Result<()> {
        let (loaded, reference, speed) = {
            let state = self.lock();
            if state.state != ReplayState::Ready {
                return Err(TimingError::replay_error("session not ready for playback"));
            }
            let loaded = state
                .loaded
                .clone()
                .ok_or_else(|| TimingError::replay_error("no replay index loaded"))?;
            (
                loaded,
                *self.inner.start_reference.lock().unwrap_or_else(|e| e.into_inner()),
                *self.inner.speed.lock().unwrap_or_else(|e| e.into_inner()),
            )
        };

        let (transport, handle) = ReplayTransport::new(
            &loaded.index,
            loaded.frames_path.clone(),
            reference,
            speed,
        );

        // Coordinators must accept incoming data outside any live window.
        self.inner.availability.set_state(true, "replay");

        let saved_factory = self.inner.bus.transport_factory();
        let slot: Mutex<Option<Box<dyn Transport>>> = Mutex::new(Some(Box::new(transport)));
        let factory_handle = handle.clone();
        let factory: TransportFactory = Arc::new(move || {
            if let Some(transport) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                return Ok(transport);
            }
            if factory_handle.is_closed() {
                Err(TimingError::replay_error("replay transport is closed - playback complete"))
            } else {
                Err(TimingError::replay_error("replay transport already taken"))
            }
        });

        {
            let mut state = self.lock();
            state.saved_factory = Some(saved_factory);
            state.handle = Some(handle.clone());
            state.state = ReplayState::Playing;
            self.publish(&mut state);
        }
        debug!("swapping bus onto replay transport");
        self.inner.bus.swap_transport(Some(factory));

        // Seed subscribers with the pre-start snapshot so merged state is
        // correct before the first frame plays.
        if !loaded.index.initial_state.is_empty() {
            info!(
                streams = loaded.index.initial_state.len(),
                "injecting replay initial state"
            );
            for (stream, payload) in &loaded.index.initial_state {
                if let Some(stream) = StreamId::parse(stream) {
                    self.inner.bus.inject_message(stream, payload);
                }
            }
        }

        let controller = self.clone();
        let watcher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(COMPLETION_POLL).await;
                let done = {
                    let state = controller.lock();
                    match state.state {
                        ReplayState::Playing | ReplayState::Paused => {
                            state.handle.as_ref().map(|h| h.is_closed()).unwrap_or(true)
                        }
                        // Stopped externally; nothing left to watch.
                        _ => return,
                    }
                };
                if done {
                    info!("replay playback ended naturally");
                    controller.finish(true).await;
                    return;
                }
            }
        });
        self.lock().watcher = Some(watcher);
        info!("replay playback started");
        Ok(())
    }

    pub fn pause(&self) {
        let mut state = self.lock();
        if state.state == ReplayState::Playing {
            if let Some(handle) = &state.handle {
                handle.pause();
            }
            state.state = ReplayState::Paused;
            self.publish(&mut state);
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        if state.state == ReplayState::Paused {
            if let Some(handle) = &state.handle {
                handle.resume();
            }
            state.state = ReplayState::Playing;
            self.publish(&mut state);
        }
    }

    /// Stop playback and return to idle, discarding the session cache.
    pub async fn stop(&self) {
        let watcher = {
            let mut state = self.lock();
            if state.state == ReplayState::Idle {
                return;
            }
            state.watcher.take()
        };
        info!("stopping replay playback");
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.finish(false).await;
    }

    /// Current playback position and status.
    pub fn get_playback_status(&self) -> Option<PlaybackStatus> {
        self.lock().handle.as_ref().map(|h| h.status())
    }

    /// Throttled position updates for UI projections.
    pub fn status_stream(&self) -> Option<impl Stream<Item = PlaybackStatus>> {
        let receiver = self.lock().handle.as_ref().map(|h| h.status_receiver())?;
        Some(WatchStream::new(receiver).throttle_latest(STATUS_THROTTLE))
    }

    /// Shared teardown for natural completion and explicit stop.
    async fn finish(&self, completed: bool) {
        let (saved_factory, unload_id) = {
            let mut state = self.lock();
            let saved = state.saved_factory.take();
            let unload_id = state.loaded.as_ref().map(|l| l.index.session_id.clone());
            state.handle = None;
            state.loaded = None;
            state.selected = None;
            state.state = ReplayState::Idle;
            self.publish(&mut state);
            (saved, unload_id)
        };

        // Restore the factory BEFORE closing the bus: if the supervisor
        // restarts the bus first, it must not find the replay factory.
        if let Some(factory) = saved_factory {
            self.inner.bus.set_transport_factory(factory);
        }
        self.inner.bus.close().await;

        self.inner
            .availability
            .set_state(false, if completed { "replay-completed" } else { "replay-stopped" });

        if let Some(session_id) = unload_id {
            if let Err(err) = self.inner.recorder.unload(&session_id).await {
                warn!(%err, "replay cache unload failed");
            }
        }
    }

    fn publish(&self, state: &mut std::sync::MutexGuard<'_, State>) {
        let snapshot = ReplayControllerSnapshot {
            state: Some(state.state),
            selected_label: state.selected.as_ref().map(|s| s.label()),
            selected_id: state.selected.as_ref().map(|s| s.unique_id()),
            error: state.error.clone(),
            sessions_count: state.sessions.len(),
        };
        self.inner.tx.send_replace(snapshot);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReplayQuery for ReplayController {
    fn replay_engaged(&self) -> bool {
        self.state().engages_replay()
    }
}
