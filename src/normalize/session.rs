//! SessionInfo / SessionStatus / SessionData / ExtrapolatedClock parsing.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::jsonstream;
use crate::schedule;

/// Archive states that mean the session is over.
pub const SESSION_END_STATES: &[&str] = &["Finished", "Finalised", "Ends"];

/// Session identity extracted from a `SessionInfo` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMeta {
    pub name: String,
    /// `Type` field: Practice, Qualifying, Race.
    pub kind: String,
    pub meeting_name: Option<String>,
    /// Archive prefix; present on the live feed, absent on fallback sources.
    pub path: Option<String>,
    pub scheduled_start_utc: Option<DateTime<Utc>>,
    pub scheduled_end_utc: Option<DateTime<Utc>>,
}

impl SessionMeta {
    pub fn is_race_or_sprint(&self) -> bool {
        let joined = format!("{} {}", self.kind, self.name).to_ascii_lowercase();
        (joined.contains("sprint") && !joined.contains("qualifying")) || joined.contains("race")
    }

    pub fn is_sprint(&self) -> bool {
        self.name.to_ascii_lowercase().contains("sprint")
    }
}

/// Parse a `SessionInfo` payload. Returns `None` when the payload carries
/// neither a name nor a type.
pub fn parse_session_info(payload: &Value) -> Option<SessionMeta> {
    let name = payload.get("Name").and_then(jsonstream::as_text);
    let kind = payload.get("Type").and_then(jsonstream::as_text);
    if name.is_none() && kind.is_none() {
        return None;
    }
    let gmt_offset = payload.get("GmtOffset").and_then(Value::as_str);
    Some(SessionMeta {
        name: name.unwrap_or_default().to_string(),
        kind: kind.unwrap_or_default().to_string(),
        meeting_name: payload
            .pointer("/Meeting/Name")
            .and_then(jsonstream::as_text)
            .map(str::to_string),
        path: payload.get("Path").and_then(jsonstream::as_text).map(str::to_string),
        scheduled_start_utc: payload
            .get("StartDate")
            .and_then(Value::as_str)
            .and_then(|d| schedule::to_utc(d, gmt_offset)),
        scheduled_end_utc: payload
            .get("EndDate")
            .and_then(Value::as_str)
            .and_then(|d| schedule::to_utc(d, gmt_offset)),
    })
}

/// Extract the status text from a `SessionStatus` payload.
pub fn session_status(payload: &Value) -> Option<String> {
    payload
        .get("Status")
        .or_else(|| payload.get("Message"))
        .and_then(jsonstream::as_text)
        .map(str::to_string)
}

/// Whether a `SessionStatus` payload reports a running session.
pub fn is_session_live(payload: &Value) -> bool {
    if let Some(started) = payload.get("Started") {
        let text = match started {
            Value::String(s) => s.trim().to_ascii_lowercase(),
            Value::Bool(true) => "true".to_string(),
            _ => String::new(),
        };
        if text == "started" || text == "true" {
            return true;
        }
    }
    matches!(session_status(payload).as_deref(), Some("Started" | "Green" | "GreenFlag"))
}

/// Whether a status string is a terminal session state.
pub fn is_session_end(status: &str) -> bool {
    SESSION_END_STATES.contains(&status)
}

/// Anchors extracted from a `SessionData` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDataUpdate {
    /// Utc of the first `StatusSeries` entry reporting `Started`.
    pub started_utc: Option<DateTime<Utc>>,
    /// Highest `QualifyingPart` seen in the `Series`.
    pub latest_part: Option<i64>,
}

/// Parse `Series`/`StatusSeries`, both of which arrive as list or map.
pub fn parse_session_data(payload: &Value) -> SessionDataUpdate {
    let mut update = SessionDataUpdate::default();
    if let Some(series) = payload.get("StatusSeries") {
        for (_, entry) in jsonstream::indexed_sequence(series) {
            let started = entry
                .get("SessionStatus")
                .and_then(jsonstream::as_text)
                .map(|s| s == "Started")
                .unwrap_or(false);
            if started && update.started_utc.is_none() {
                update.started_utc = entry
                    .get("Utc")
                    .and_then(Value::as_str)
                    .and_then(jsonstream::parse_utc);
            }
        }
    }
    if let Some(series) = payload.get("Series") {
        for (_, entry) in jsonstream::indexed_sequence(series) {
            if let Some(part) = entry.get("QualifyingPart").and_then(jsonstream::as_i64) {
                update.latest_part = Some(update.latest_part.map_or(part, |p| p.max(part)));
            }
        }
    }
    update
}

/// Clock anchor from an `ExtrapolatedClock` payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockAnchor {
    pub utc: DateTime<Utc>,
    pub remaining_s: u32,
    pub extrapolating: bool,
}

/// Parse `{"Utc", "Remaining": "H:MM:SS", "Extrapolating"}`.
pub fn parse_extrapolated_clock(payload: &Value) -> Option<ClockAnchor> {
    let utc = payload.get("Utc").and_then(Value::as_str).and_then(jsonstream::parse_utc)?;
    let remaining_s =
        payload.get("Remaining").and_then(Value::as_str).and_then(hms_to_secs)?;
    Some(ClockAnchor {
        utc,
        remaining_s,
        extrapolating: payload.get("Extrapolating").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// `"H:MM:SS"` (or `"MM:SS"`) to seconds.
pub fn hms_to_secs(text: &str) -> Option<u32> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    let nums: Vec<u32> = parts
        .iter()
        .map(|p| p.split('.').next().unwrap_or(p).parse::<u32>())
        .collect::<Result<_, _>>()
        .ok()?;
    match nums.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        [m, s] => Some(m * 60 + s),
        _ => None,
    }
}
