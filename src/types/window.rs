//! Session broadcast windows.

use chrono::{DateTime, Duration, Utc};

/// One live broadcast window derived from a schedule source.
///
/// Immutable once produced; the supervisor owns the active window and
/// discards it when the window closes. `connect_at`/`disconnect_at` bracket
/// the session with the pre/post margins applied at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionWindow {
    pub meeting_name: String,
    pub session_name: String,
    /// Archive prefix under the static base, normalized to end with `/`.
    /// Empty when the source does not expose archive paths.
    pub path: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub connect_at: DateTime<Utc>,
    pub disconnect_at: DateTime<Utc>,
    pub meeting_key: Option<i64>,
    pub session_key: Option<i64>,
}

impl SessionWindow {
    /// Human-readable label used in logs and availability reasons.
    pub fn label(&self) -> String {
        if self.meeting_name.is_empty() {
            self.session_name.clone()
        } else {
            format!("{} - {}", self.meeting_name, self.session_name)
        }
    }

    /// Session length as scheduled, used for practice clock totals.
    pub fn duration(&self) -> Duration {
        self.end_utc - self.start_utc
    }

    /// Whether `now` falls inside the open connect window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.connect_at && now <= self.disconnect_at
    }
}
