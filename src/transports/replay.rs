//! Replay transport: deterministic playback of a recorded session.
//!
//! Frames stream from the indexed cache file at wall-clock speed (scaled by
//! the speed multiplier), skipping everything before the configured start
//! offset. Pacing tracks actual elapsed playback time minus paused spans, so
//! a paused replay resumes exactly where it left off.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Result, TimingError};
use crate::reference::ReferenceKind;
use crate::transport::{Transport, TransportEvent};
use crate::types::{ReplayFrame, ReplayIndex};

/// Sleep only when the pacing drift exceeds this.
const PACING_SLACK: Duration = Duration::from_millis(10);

/// Playback position snapshot for UI projections.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub session_start_ms: u64,
    pub paused: bool,
    pub elapsed_s: f64,
}

#[derive(Default)]
struct PauseBook {
    pause_started: Option<Instant>,
    total_paused: Duration,
}

struct Shared {
    paused: watch::Sender<bool>,
    status: watch::Sender<PlaybackStatus>,
    closed: AtomicBool,
    book: Mutex<PauseBook>,
}

/// Control handle for an active replay transport: pause/resume gating and
/// position reporting. Remains valid after the transport closes.
#[derive(Clone)]
pub struct PlaybackHandle {
    shared: Arc<Shared>,
}

impl PlaybackHandle {
    pub fn pause(&self) {
        let mut book = self.shared.book.lock().unwrap_or_else(|e| e.into_inner());
        if book.pause_started.is_none() {
            book.pause_started = Some(Instant::now());
            drop(book);
            let _ = self.shared.paused.send(true);
            self.shared.status.send_modify(|status| status.paused = true);
            debug!("replay paused");
        }
    }

    pub fn resume(&self) {
        let mut book = self.shared.book.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(started) = book.pause_started.take() {
            book.total_paused += started.elapsed();
            drop(book);
            let _ = self.shared.paused.send(false);
            self.shared.status.send_modify(|status| status.paused = false);
            debug!("replay resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.status.borrow().clone()
    }

    /// Watch receiver updated on every yielded frame and pause transition.
    pub fn status_receiver(&self) -> watch::Receiver<PlaybackStatus> {
        self.shared.status.subscribe()
    }
}

/// Transport that plays back a recorded session from local cache.
pub struct ReplayTransport {
    frames_path: PathBuf,
    start_offset_ms: u64,
    speed: f64,
    shared: Arc<Shared>,
    paused_rx: watch::Receiver<bool>,
    frames: VecDeque<ReplayFrame>,
    started_at: Option<Instant>,
}

impl ReplayTransport {
    /// Build a transport for `index` with its frames file, a start reference
    /// and a speed multiplier (clamped to 0.1-10).
    pub fn new(
        index: &ReplayIndex,
        frames_path: PathBuf,
        reference: ReferenceKind,
        speed: f64,
    ) -> (Self, PlaybackHandle) {
        let start_offset_ms = match reference {
            ReferenceKind::Session => index.session_started_at_ms,
            ReferenceKind::Formation => {
                index.formation_start_ms.unwrap_or(index.session_started_at_ms)
            }
        };
        let (paused_tx, paused_rx) = watch::channel(false);
        let (status_tx, _) = watch::channel(PlaybackStatus {
            position_ms: start_offset_ms,
            duration_ms: index.duration_ms,
            session_start_ms: index.session_started_at_ms,
            paused: false,
            elapsed_s: 0.0,
        });
        let shared = Arc::new(Shared {
            paused: paused_tx,
            status: status_tx,
            closed: AtomicBool::new(false),
            book: Mutex::new(PauseBook::default()),
        });
        let transport = Self {
            frames_path,
            start_offset_ms,
            speed: speed.clamp(0.1, 10.0),
            shared: Arc::clone(&shared),
            paused_rx,
            frames: VecDeque::new(),
            started_at: None,
        };
        (transport, PlaybackHandle { shared })
    }

    /// Elapsed playback time, excluding paused spans.
    fn elapsed_playback(&self) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let book = self.shared.book.lock().unwrap_or_else(|e| e.into_inner());
        let pausing_now = book.pause_started.map(|p| p.elapsed()).unwrap_or_default();
        started_at.elapsed().saturating_sub(book.total_paused + pausing_now)
    }

    async fn wait_while_paused(&mut self) -> bool {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return false;
            }
            if !*self.paused_rx.borrow() {
                return true;
            }
            if self.paused_rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for ReplayTransport {
    async fn ensure_connection(&mut self) -> Result<()> {
        let text = tokio::fs::read_to_string(&self.frames_path)
            .await
            .map_err(|e| TimingError::cache_error(&self.frames_path, e))?;
        let start = self.start_offset_ms;
        self.frames = text
            .lines()
            .filter_map(|line| serde_json::from_str::<ReplayFrame>(line).ok())
            .filter(|frame| frame.timestamp_ms >= start)
            .collect();
        self.started_at = Some(Instant::now());
        info!(
            frames = self.frames.len(),
            start_offset_ms = start,
            speed = self.speed,
            "replay playback starting"
        );
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
        if !self.wait_while_paused().await {
            return Ok(None);
        }
        let Some(frame) = self.frames.pop_front() else {
            info!("replay playback completed");
            self.shared.closed.store(true, Ordering::SeqCst);
            return Ok(None);
        };

        let target =
            Duration::from_millis(frame.timestamp_ms - self.start_offset_ms).div_f64(self.speed);
        let elapsed = self.elapsed_playback();
        if target > elapsed + PACING_SLACK {
            tokio::time::sleep(target - elapsed).await;
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let elapsed_s = self.elapsed_playback().as_secs_f64();
        self.shared.status.send_modify(|status| {
            status.position_ms = frame.timestamp_ms;
            status.elapsed_s = elapsed_s;
        });
        Ok(Some(TransportEvent { stream: frame.stream, payload: frame.payload }))
    }

    async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Unblock a paused reader so it can observe the close.
        let _ = self.shared.paused.send(false);
    }
}
