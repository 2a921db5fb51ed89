//! Replay session metadata, frames and index records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::StreamId;

/// State machine for the replay controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    Idle,
    Selected,
    Loading,
    Ready,
    Playing,
    Paused,
}

impl ReplayState {
    /// Whether this state blocks live-delay calibration.
    pub fn engages_replay(&self) -> bool {
        !matches!(self, ReplayState::Idle)
    }
}

/// Metadata for a downloadable/playable archived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySession {
    pub year: i32,
    pub meeting_key: i64,
    pub meeting_name: String,
    pub session_key: i64,
    pub session_name: String,
    pub session_type: String,
    /// Archive prefix under the static base, no leading/trailing slash.
    pub path: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

impl ReplaySession {
    pub fn label(&self) -> String {
        format!("{} - {}", self.meeting_name, self.session_name)
    }

    /// Cache-directory key for this session.
    pub fn unique_id(&self) -> String {
        format!("{}_{}_{}", self.year, self.meeting_key, self.session_key)
    }

    /// Race and sprint sessions have a formation lap; everything else does not.
    pub fn is_race_or_sprint(&self) -> bool {
        let joined =
            format!("{} {}", self.session_type, self.session_name).to_ascii_lowercase();
        (joined.contains("sprint") && !joined.contains("qualifying"))
            || joined.contains("race")
    }
}

/// A single frame of replay data, ordered by `timestamp_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrame {
    /// Milliseconds from the start of the archive file set.
    #[serde(rename = "t")]
    pub timestamp_ms: u64,
    #[serde(rename = "s")]
    pub stream: StreamId,
    #[serde(rename = "p")]
    pub payload: Value,
}

/// Index metadata persisted as `index.json` next to `frames.jsonl`.
///
/// A `cache_version` older than the current build is treated as corrupt and
/// the session is re-downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayIndex {
    pub cache_version: u32,
    pub session_id: String,
    pub total_frames: usize,
    pub duration_ms: u64,
    /// Offset of the first `SessionStatus: Started` frame.
    pub session_started_at_ms: u64,
    /// Offset of the formation-lap marker, when one was found before session
    /// start. Absent for non-race sessions and archives without the marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formation_start_ms: Option<u64>,
    /// Last payload of each stream at or before session start (first
    /// post-start payload for late-joining streams).
    pub initial_state: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}
