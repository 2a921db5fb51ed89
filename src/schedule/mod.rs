//! Schedule sources: turning season metadata into ordered session windows.

mod event_tracker;
mod index;

pub use event_tracker::{EventTrackerConfig, EventTrackerScheduleSource};
pub use index::IndexScheduleSource;

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Utc};
use serde_json::Value;

use crate::config::RaceWeekStartDay;
use crate::jsonstream;
use crate::types::SessionWindow;

/// Margin before the scheduled start during which the bus may connect.
pub const DEFAULT_PRE_WINDOW: Duration = Duration::minutes(60);
/// Margin after the scheduled end before the bus disconnects.
pub const DEFAULT_POST_WINDOW: Duration = Duration::minutes(15);

/// Which provider produced a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleSourceKind {
    Index,
    EventTracker,
    None,
}

impl ScheduleSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleSourceKind::Index => "index",
            ScheduleSourceKind::EventTracker => "event_tracker",
            ScheduleSourceKind::None => "none",
        }
    }
}

/// Outcome of one schedule fetch.
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    pub windows: Vec<SessionWindow>,
    pub source: ScheduleSourceKind,
    pub http_status: Option<u16>,
    pub last_error: Option<String>,
}

impl ScheduleResult {
    pub fn empty(source: ScheduleSourceKind) -> Self {
        Self { windows: Vec::new(), source, http_status: None, last_error: None }
    }
}

/// An interchangeable schedule provider.
#[async_trait::async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Fetch upcoming windows with the given pre/post margins. `active`
    /// hints that a fallback source is currently driving the supervisor and
    /// should refresh more eagerly.
    async fn fetch_windows(
        &self,
        pre_window: Duration,
        post_window: Duration,
        active: bool,
    ) -> ScheduleResult;
}

/// Parse a `GmtOffset` like `"-03:00"` or `"04:00:00"` into seconds.
fn parse_gmt_offset(offset: &str) -> i32 {
    let offset = offset.trim();
    if offset.is_empty() {
        return 0;
    }
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let digits = offset.trim_start_matches(['+', '-']);
    let mut parts = digits.split(':').map(|p| p.parse::<i32>().unwrap_or(0));
    let hours = parts.next().unwrap_or(0);
    let minutes = parts.next().unwrap_or(0);
    let seconds = parts.next().unwrap_or(0);
    sign * (hours * 3600 + minutes * 60 + seconds)
}

/// Convert a schedule timestamp plus optional `GmtOffset` to UTC. Naive
/// timestamps are interpreted in the offset's zone.
pub(crate) fn to_utc(date: &str, gmt_offset: Option<&str>) -> Option<DateTime<Utc>> {
    let date = date.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(date) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    let offset_s = gmt_offset.map(parse_gmt_offset).unwrap_or(0);
    let zone = FixedOffset::east_opt(offset_s)?;
    Some(zone.from_local_datetime(&naive).single()?.with_timezone(&Utc))
}

fn normalize_path(path: Option<&str>) -> String {
    let Some(path) = path else { return String::new() };
    let cleaned = path.trim().trim_matches('/');
    if cleaned.is_empty() {
        String::new()
    } else {
        format!("{cleaned}/")
    }
}

fn sequence_values(value: &Value) -> Vec<&Value> {
    jsonstream::indexed_sequence(value).into_iter().map(|(_, v)| v).collect()
}

fn clean_text(candidates: &[Option<&Value>], default: &str) -> String {
    for candidate in candidates {
        if let Some(text) = candidate.and_then(|v| jsonstream::as_text(v)) {
            return text.to_string();
        }
    }
    default.to_string()
}

/// Build ordered session windows from a season index payload.
///
/// Meetings and their sessions may each arrive as list or map. Sessions
/// without a start date are skipped; a missing or non-positive end
/// synthesizes start + 2 h.
pub fn build_session_windows(
    payload: &Value,
    pre_window: Duration,
    post_window: Duration,
) -> Vec<SessionWindow> {
    static NO_MEETING: Value = Value::Null;
    let mut windows = Vec::new();

    let meetings_value = payload.get("Meetings").or_else(|| payload.get("meetings"));
    let meeting_sessions: Vec<(&Value, &Value)> = match meetings_value {
        Some(meetings) => sequence_values(meetings)
            .into_iter()
            .flat_map(|meeting| {
                let sessions = meeting
                    .get("Sessions")
                    .or_else(|| meeting.get("sessions"))
                    .map(sequence_values)
                    .unwrap_or_default();
                sessions.into_iter().map(move |session| (meeting, session))
            })
            .collect(),
        // Some builds expose Sessions at root with an embedded Meeting.
        None => payload
            .get("Sessions")
            .or_else(|| payload.get("sessions"))
            .map(sequence_values)
            .unwrap_or_default()
            .into_iter()
            .map(|session| (session.get("Meeting").unwrap_or(&NO_MEETING), session))
            .collect(),
    };

    for (meeting, session) in meeting_sessions {
        let gmt_offset = session.get("GmtOffset").and_then(Value::as_str);
        let Some(start) = session
            .get("StartDate")
            .and_then(Value::as_str)
            .and_then(|d| to_utc(d, gmt_offset))
        else {
            continue;
        };
        let end = session
            .get("EndDate")
            .and_then(Value::as_str)
            .and_then(|d| to_utc(d, gmt_offset))
            .filter(|end| *end > start)
            .unwrap_or(start + Duration::hours(2));

        windows.push(SessionWindow {
            meeting_name: clean_text(
                &[meeting.get("Name"), meeting.get("OfficialName")],
                "F1",
            ),
            session_name: clean_text(&[session.get("Name"), session.get("Type")], "Session"),
            path: normalize_path(session.get("Path").and_then(Value::as_str)),
            start_utc: start,
            end_utc: end,
            connect_at: start - pre_window,
            disconnect_at: end + post_window,
            meeting_key: meeting.get("Key").and_then(jsonstream::as_i64),
            session_key: session.get("Key").and_then(jsonstream::as_i64),
        });
    }

    windows.sort_by_key(|w| w.start_utc);
    windows
}

/// Race-week status derived from the next scheduled race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceWeekStatus {
    pub is_on: bool,
    pub days_until_next_race: Option<i64>,
}

/// Whether `now` falls in the week containing the next race, where the week
/// starts on the configured day.
pub fn race_week(
    now: DateTime<Utc>,
    next_race_start: Option<DateTime<Utc>>,
    start_day: RaceWeekStartDay,
) -> RaceWeekStatus {
    let Some(race) = next_race_start else {
        return RaceWeekStatus { is_on: false, days_until_next_race: None };
    };
    let today = now.date_naive();
    let race_day = race.date_naive();
    let days_until = (race_day - today).num_days().max(0);

    let back = match start_day {
        RaceWeekStartDay::Monday => race_day.weekday().num_days_from_monday(),
        RaceWeekStartDay::Sunday => race_day.weekday().num_days_from_sunday(),
    };
    let week_start = race_day - Duration::days(back as i64);
    let week_end = week_start + Duration::days(6);
    let is_on = today >= week_start && today <= week_end;

    RaceWeekStatus { is_on, days_until_next_race: Some(days_until) }
}
