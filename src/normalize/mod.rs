//! Normalization and merge layer.
//!
//! Raw per-stream payloads go in; canonical events and a merged, read-only
//! state snapshot come out. Any payload that fails to normalize is logged
//! and dropped; the stream continues.

pub mod driver_list;
pub mod race_control;
pub mod session;
pub mod timing;
pub mod top_three;
pub mod track_status;

pub use driver_list::DriverInfo;
pub use session::{ClockAnchor, SessionDataUpdate, SessionMeta};
pub use timing::{DriverTiming, TimingState};
pub use top_three::TopThreeState;
pub use track_status::TrackState;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tracing::trace;

use crate::jsonstream;
use crate::types::{RaceControlMsg, StreamId};

/// Race-control history retained in the merged state.
const RACE_CONTROL_HISTORY: usize = 64;

/// Lap counter from the `LapCount` stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LapCount {
    pub current: Option<i64>,
    pub total: Option<i64>,
}

/// Canonical events emitted by [`Normalizer::apply`], routed by the engine
/// to the flag machine, the session clock and other consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    RaceControl(RaceControlMsg),
    TrackStatus(TrackState),
    SessionStatus(String),
    SessionInfo(SessionMeta),
    SessionData(SessionDataUpdate),
    Clock(ClockAnchor),
}

/// Read-only merged state across all hot streams.
#[derive(Debug, Clone, Default)]
pub struct MergedState {
    pub session: Option<SessionMeta>,
    pub session_status: Option<String>,
    pub session_started_utc: Option<DateTime<Utc>>,
    pub race_control: VecDeque<RaceControlMsg>,
    pub track_status: Option<TrackState>,
    pub timing: TimingState,
    pub drivers: BTreeMap<String, DriverInfo>,
    pub top_three: TopThreeState,
    pub lap_count: LapCount,
    pub weather: Option<Value>,
}

/// Owns the merged state and the per-stream normalization rules.
pub struct Normalizer {
    state: Mutex<MergedState>,
    dedup: Mutex<race_control::DedupWindow>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MergedState::default()),
            dedup: Mutex::new(race_control::DedupWindow::default()),
        }
    }

    /// Immutable snapshot of the merged state.
    pub fn snapshot(&self) -> MergedState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply one raw payload and return the canonical events it produced.
    pub fn apply(&self, stream: StreamId, payload: &Value) -> Vec<NormalizedEvent> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match stream {
            StreamId::RaceControlMessages => {
                let t0 = state
                    .session_started_utc
                    .or_else(|| state.session.as_ref().and_then(|s| s.scheduled_start_utc));
                let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
                let messages = race_control::normalize_messages(payload, t0, &mut dedup);
                for message in &messages {
                    state.race_control.push_back(message.clone());
                    while state.race_control.len() > RACE_CONTROL_HISTORY {
                        state.race_control.pop_front();
                    }
                }
                messages.into_iter().map(NormalizedEvent::RaceControl).collect()
            }
            StreamId::TrackStatus => match track_status::normalize_track_status(payload) {
                Some(track) => {
                    state.track_status = Some(track);
                    vec![NormalizedEvent::TrackStatus(track)]
                }
                None => {
                    trace!(?payload, "unresolvable track status");
                    Vec::new()
                }
            },
            StreamId::SessionStatus => match session::session_status(payload) {
                Some(status) => {
                    state.session_status = Some(status.clone());
                    vec![NormalizedEvent::SessionStatus(status)]
                }
                None => Vec::new(),
            },
            StreamId::SessionInfo => match session::parse_session_info(payload) {
                Some(meta) => {
                    state.session = Some(meta.clone());
                    vec![NormalizedEvent::SessionInfo(meta)]
                }
                None => Vec::new(),
            },
            StreamId::SessionData => {
                let update = session::parse_session_data(payload);
                if let Some(started) = update.started_utc {
                    state.session_started_utc = Some(started);
                }
                vec![NormalizedEvent::SessionData(update)]
            }
            StreamId::ExtrapolatedClock => match session::parse_extrapolated_clock(payload) {
                Some(anchor) => vec![NormalizedEvent::Clock(anchor)],
                None => Vec::new(),
            },
            StreamId::TimingData => {
                timing::apply_timing_data(&mut state.timing, payload);
                Vec::new()
            }
            StreamId::DriverList => {
                driver_list::apply_driver_list(&mut state.drivers, payload);
                Vec::new()
            }
            StreamId::TopThree => {
                state.top_three.merge(payload);
                Vec::new()
            }
            StreamId::LapCount => {
                if let Some(current) = payload.get("CurrentLap").and_then(jsonstream::as_i64) {
                    state.lap_count.current = Some(current);
                }
                if let Some(total) = payload.get("TotalLaps").and_then(jsonstream::as_i64) {
                    state.lap_count.total = Some(total);
                }
                Vec::new()
            }
            StreamId::WeatherData => {
                state.weather = Some(payload.clone());
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merged_state_accumulates_across_streams() {
        let normalizer = Normalizer::new();

        normalizer.apply(
            StreamId::SessionInfo,
            &json!({"Name": "Race", "Type": "Race", "Path": "2025/x/race/"}),
        );
        normalizer.apply(StreamId::SessionStatus, &json!({"Status": "Started"}));
        normalizer.apply(StreamId::TrackStatus, &json!({"Status": "2"}));
        normalizer.apply(StreamId::LapCount, &json!({"CurrentLap": 12, "TotalLaps": 57}));
        normalizer.apply(StreamId::DriverList, &json!({"1": {"Tla": "VER"}}));

        let state = normalizer.snapshot();
        assert_eq!(state.session.as_ref().unwrap().name, "Race");
        assert_eq!(state.session_status.as_deref(), Some("Started"));
        assert_eq!(state.track_status, Some(TrackState::Yellow));
        assert_eq!(state.lap_count.current, Some(12));
        assert_eq!(state.drivers.get("1").unwrap().tla.as_deref(), Some("VER"));
    }

    #[test]
    fn race_control_history_is_bounded() {
        let normalizer = Normalizer::new();
        for id in 0..(RACE_CONTROL_HISTORY + 10) {
            normalizer.apply(
                StreamId::RaceControlMessages,
                &json!({"Messages": {id.to_string(): {"Category": 4, "Message": "M"}}}),
            );
        }
        let state = normalizer.snapshot();
        assert_eq!(state.race_control.len(), RACE_CONTROL_HISTORY);
        assert_eq!(state.race_control.back().unwrap().id, Some((RACE_CONTROL_HISTORY + 9) as i64));
    }

    #[test]
    fn malformed_payloads_produce_no_events() {
        let normalizer = Normalizer::new();
        assert!(normalizer.apply(StreamId::TrackStatus, &json!({"Status": "3"})).is_empty());
        assert!(normalizer.apply(StreamId::SessionStatus, &json!({})).is_empty());
        assert!(normalizer.apply(StreamId::ExtrapolatedClock, &json!({"bad": 1})).is_empty());
    }

    #[test]
    fn session_data_start_feeds_race_control_offsets() {
        let normalizer = Normalizer::new();
        normalizer.apply(
            StreamId::SessionData,
            &json!({"StatusSeries": [{"Utc": "2025-06-01T14:00:00Z", "SessionStatus": "Started"}]}),
        );
        let events = normalizer.apply(
            StreamId::RaceControlMessages,
            &json!({"Messages": [{"Category": 4, "utc": 60_000, "mes": "OFFSET"}]}),
        );
        match &events[0] {
            NormalizedEvent::RaceControl(msg) => {
                assert_eq!(msg.utc, Some("2025-06-01T14:01:00Z".parse().unwrap()));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
