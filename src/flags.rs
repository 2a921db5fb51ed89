//! Flag / safety-car state machine.
//!
//! Aggregates race-control messages and track-status updates into one
//! canonical flag value with precedence Red > SC > VSC > Yellow > Green.
//! Green/Yellow emission is debounced so rapid sector-flag toggles coalesce
//! into a single published transition.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::normalize::TrackState;
use crate::types::{RaceControlMsg, RcCategory, RcFlag, RcScope};

/// Published Green/Yellow transitions wait this long for the counter-toggle.
pub const GREEN_YELLOW_DEBOUNCE: Duration = Duration::from_millis(500);

/// Track-wide flag component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFlag {
    Yellow,
    Red,
    Chequered,
}

/// Safety-car component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VscMode {
    Vsc,
    Sc,
}

/// The single canonical flag exposed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivedFlag {
    #[default]
    Green,
    Yellow,
    Vsc,
    Sc,
    Red,
    Chequered,
}

impl DerivedFlag {
    /// The safety-car binary.
    pub fn safety_car_active(&self) -> bool {
        matches!(self, DerivedFlag::Sc | DerivedFlag::Vsc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedFlag::Green => "green",
            DerivedFlag::Yellow => "yellow",
            DerivedFlag::Vsc => "vsc",
            DerivedFlag::Sc => "sc",
            DerivedFlag::Red => "red",
            DerivedFlag::Chequered => "chequered",
        }
    }
}

/// Immutable view of the machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagSnapshot {
    pub track_flag: Option<TrackFlag>,
    pub vsc_mode: Option<VscMode>,
    pub yellow_sectors: BTreeSet<u8>,
    pub derived: DerivedFlag,
}

/// Inputs accepted by the machine, posted by the normalization layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagInput {
    RaceControl(RaceControlMsg),
    TrackStatus(TrackState),
}

/// The pure state machine. Driven by a single owning task; see
/// [`FlagSensor`].
#[derive(Debug, Default)]
pub struct FlagStateMachine {
    track_flag: Option<TrackFlag>,
    vsc_mode: Option<VscMode>,
    yellow_sectors: BTreeSet<u8>,
}

impl FlagStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, input: &FlagInput) {
        match input {
            FlagInput::RaceControl(msg) => self.apply_race_control(msg),
            FlagInput::TrackStatus(track) => self.apply_track_status(*track),
        }
    }

    fn apply_race_control(&mut self, msg: &RaceControlMsg) {
        match msg.category {
            RcCategory::SafetyCar => {
                let status = msg.status.as_deref().unwrap_or("").to_ascii_uppercase();
                if status.contains("DEPLOYED") {
                    let mode = msg.mode.as_deref().unwrap_or("").to_ascii_uppercase();
                    self.vsc_mode = Some(if mode.contains("VIRTUAL") {
                        VscMode::Vsc
                    } else {
                        VscMode::Sc
                    });
                } else if status.contains("ENDING")
                    || status.contains("IN THIS LAP")
                    || status.contains("WITHDRAWN")
                {
                    self.vsc_mode = None;
                }
            }
            RcCategory::Flag => match msg.scope {
                Some(RcScope::Track) => match msg.flag {
                    Some(RcFlag::Green) | Some(RcFlag::Clear) => {
                        self.track_flag = None;
                        self.yellow_sectors.clear();
                    }
                    Some(RcFlag::Red) => {
                        self.track_flag = Some(TrackFlag::Red);
                        self.yellow_sectors.clear();
                        self.vsc_mode = None;
                    }
                    Some(RcFlag::Chequered) => {
                        self.track_flag = Some(TrackFlag::Chequered);
                        self.yellow_sectors.clear();
                    }
                    Some(RcFlag::Yellow) | Some(RcFlag::DoubleYellow) => {
                        self.track_flag = Some(TrackFlag::Yellow);
                    }
                    _ => {}
                },
                Some(RcScope::Sector) => {
                    let Some(sector) = msg.sector else { return };
                    match msg.flag {
                        Some(RcFlag::Yellow) | Some(RcFlag::DoubleYellow) => {
                            self.yellow_sectors.insert(sector);
                        }
                        Some(RcFlag::Clear) | Some(RcFlag::Green) => {
                            self.yellow_sectors.remove(&sector);
                        }
                        _ => {}
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn apply_track_status(&mut self, track: TrackState) {
        match track {
            // A track-status green is authoritative: everything resets.
            TrackState::Clear => {
                self.track_flag = None;
                self.vsc_mode = None;
                self.yellow_sectors.clear();
            }
            TrackState::Yellow => self.track_flag = Some(TrackFlag::Yellow),
            TrackState::Sc => self.vsc_mode = Some(VscMode::Sc),
            TrackState::Vsc => self.vsc_mode = Some(VscMode::Vsc),
            TrackState::Red => {
                self.track_flag = Some(TrackFlag::Red);
                self.vsc_mode = None;
            }
        }
    }

    fn derived(&self) -> DerivedFlag {
        match self.track_flag {
            Some(TrackFlag::Red) => return DerivedFlag::Red,
            Some(TrackFlag::Chequered) => return DerivedFlag::Chequered,
            _ => {}
        }
        match self.vsc_mode {
            Some(VscMode::Sc) => return DerivedFlag::Sc,
            Some(VscMode::Vsc) => return DerivedFlag::Vsc,
            None => {}
        }
        if self.track_flag == Some(TrackFlag::Yellow) || !self.yellow_sectors.is_empty() {
            return DerivedFlag::Yellow;
        }
        DerivedFlag::Green
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            track_flag: self.track_flag,
            vsc_mode: self.vsc_mode,
            yellow_sectors: self.yellow_sectors.clone(),
            derived: self.derived(),
        }
    }
}

fn is_green_yellow_toggle(a: DerivedFlag, b: DerivedFlag) -> bool {
    matches!(
        (a, b),
        (DerivedFlag::Green, DerivedFlag::Yellow) | (DerivedFlag::Yellow, DerivedFlag::Green)
    )
}

/// Owning task around [`FlagStateMachine`]: consumes posted inputs,
/// publishes debounced snapshots on a watch channel.
pub struct FlagSensor {
    input_tx: mpsc::UnboundedSender<FlagInput>,
    snapshot_rx: watch::Receiver<FlagSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FlagSensor {
    pub fn spawn() -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(FlagSnapshot::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(input_rx, snapshot_tx, cancel.clone()));
        Self { input_tx, snapshot_rx, cancel, task }
    }

    /// Sender used by the engine to post inputs.
    pub fn input(&self) -> mpsc::UnboundedSender<FlagInput> {
        self.input_tx.clone()
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch receiver for published (debounced) snapshots.
    pub fn watch(&self) -> watch::Receiver<FlagSnapshot> {
        self.snapshot_rx.clone()
    }

    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    mut input_rx: mpsc::UnboundedReceiver<FlagInput>,
    snapshot_tx: watch::Sender<FlagSnapshot>,
    cancel: CancellationToken,
) {
    let mut machine = FlagStateMachine::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let debounce_target = deadline
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));
        tokio::select! {
            _ = cancel.cancelled() => break,
            input = input_rx.recv() => {
                let Some(input) = input else { break };
                machine.apply(&input);
                let snapshot = machine.snapshot();
                let published = snapshot_tx.borrow().derived;
                if snapshot.derived != published
                    && is_green_yellow_toggle(published, snapshot.derived)
                {
                    // Wait for a possible counter-toggle before publishing.
                    if deadline.is_none() {
                        deadline =
                            Some(tokio::time::Instant::now() + GREEN_YELLOW_DEBOUNCE);
                    }
                    trace!(derived = snapshot.derived.as_str(), "flag change held for debounce");
                } else {
                    deadline = None;
                    if *snapshot_tx.borrow() != snapshot {
                        debug!(derived = snapshot.derived.as_str(), "flag state published");
                        let _ = snapshot_tx.send(snapshot);
                    }
                }
            }
            _ = tokio::time::sleep_until(debounce_target), if deadline.is_some() => {
                deadline = None;
                let snapshot = machine.snapshot();
                if *snapshot_tx.borrow() != snapshot {
                    debug!(derived = snapshot.derived.as_str(), "flag state published (debounced)");
                    let _ = snapshot_tx.send(snapshot);
                }
            }
        }
    }
}
