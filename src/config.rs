//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::reference::ReferenceKind;

/// Canonical base for the static archive and the push feed.
pub const LIVETIMING_BASE: &str = "https://livetiming.formula1.com";

/// How the engine sources its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Normal operation: the supervisor arms the SignalR transport inside
    /// session windows.
    Live,
    /// SignalR arming disabled; availability is driven by replay playback.
    Development,
}

/// First day of the week used for race-week detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceWeekStartDay {
    Monday,
    Sunday,
}

/// Top-level engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub operation_mode: OperationMode,
    /// Seconds subtracted from the wall clock when computing server-now.
    /// Clamped to [0, 300] wherever it is applied.
    pub live_delay_seconds: u32,
    /// When calibration leaves its waiting state.
    pub live_delay_reference: ReferenceKind,
    /// Where replay playback starts.
    pub replay_start_reference: ReferenceKind,
    /// Arms race-control and flag subscriptions.
    pub enable_race_control: bool,
    /// Minimum supervisor tick while armed, seconds.
    pub fast_poll_seconds: u64,
    pub race_week_start_day: RaceWeekStartDay,
    /// Root directory for the replay cache and persisted state.
    pub data_dir: PathBuf,
    /// Overridable for tests; everything network-facing derives from it.
    pub static_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::Live,
            live_delay_seconds: 0,
            live_delay_reference: ReferenceKind::Session,
            replay_start_reference: ReferenceKind::Session,
            enable_race_control: true,
            fast_poll_seconds: 20,
            race_week_start_day: RaceWeekStartDay::Monday,
            data_dir: PathBuf::from(".gantry"),
            static_base: format!("{LIVETIMING_BASE}/static"),
        }
    }
}

impl EngineConfig {
    pub fn replay_cache_dir(&self) -> PathBuf {
        self.data_dir.join("replay_cache")
    }

    pub fn http_cache_path(&self) -> PathBuf {
        self.data_dir.join("http_cache").join("v1.json")
    }

    pub fn live_delay_reference_path(&self) -> PathBuf {
        self.data_dir.join("live_delay_reference.json")
    }

    pub fn replay_start_reference_path(&self) -> PathBuf {
        self.data_dir.join("replay_start_reference.json")
    }
}
