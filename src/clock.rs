//! Session clock: anchor extrapolation, totals and the race three-hour cap.
//!
//! The clock anchors on `ExtrapolatedClock` events (official) and falls back
//! to `SessionData` start markers. Server-now is derived from the last
//! heartbeat plus monotonic elapsed time, shifted by the configured live
//! delay, so timers track the broadcast the viewer actually sees.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

use crate::flags::DerivedFlag;
use crate::normalize::{ClockAnchor, SessionDataUpdate, SessionMeta};
use crate::types::SessionWindow;

/// Default race total: two hours of racing time.
const RACE_TOTAL_S: u32 = 2 * 3600;
/// Regulation cap on race duration, wall clock.
const RACE_CAP: ChronoDuration = ChronoDuration::hours(3);
/// Live delay ceiling, seconds.
pub const MAX_LIVE_DELAY_S: u32 = 300;

/// How the current clock values were derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceQuality {
    Official,
    SessionDataFallback,
    Unavailable,
}

impl SourceQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceQuality::Official => "official",
            SourceQuality::SessionDataFallback => "sessiondata_fallback",
            SourceQuality::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Practice,
    Qualifying,
    Sprint,
    Race,
    Unknown,
}

/// Full clock state exposed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClockSnapshot {
    pub session_type: Option<String>,
    pub session_name: Option<String>,
    pub session_part: Option<i64>,
    pub session_status: Option<String>,
    pub total_s: Option<u32>,
    pub remaining_s: Option<u32>,
    pub elapsed_s: Option<u32>,
    pub running: bool,
    pub phase: &'static str,
    pub source_quality: SourceQuality,
    pub session_start_utc: Option<DateTime<Utc>>,
    pub race_start_utc: Option<DateTime<Utc>>,
    pub race_three_hour_cap_utc: Option<DateTime<Utc>>,
    pub race_three_hour_remaining_s: Option<u32>,
    pub reference_utc: Option<DateTime<Utc>>,
    pub server_now_utc: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    meta: Option<SessionMeta>,
    window: Option<SessionWindow>,
    anchor: Option<ClockAnchor>,
    /// Learned totals per qualifying part.
    part_totals: HashMap<i64, u32>,
    session_part: Option<i64>,
    session_started_utc: Option<DateTime<Utc>>,
    session_status: Option<String>,
    derived_flag: DerivedFlag,
    live_delay_s: u32,
    heartbeat: Option<(DateTime<Utc>, Instant)>,
}

/// Anchor-extrapolating session clock. All ingest methods are cheap and
/// callable from bus subscription callbacks.
#[derive(Default)]
pub struct SessionClock {
    inner: Mutex<Inner>,
}

fn ceil_minute(seconds: u32) -> u32 {
    seconds.div_ceil(60) * 60
}

fn kind_of(name: &str, session_type: &str) -> SessionKind {
    let type_lower = session_type.to_ascii_lowercase();
    let name_lower = name.to_ascii_lowercase();
    if type_lower.contains("qualifying") || name_lower.contains("qualifying") {
        return SessionKind::Qualifying;
    }
    if name_lower.contains("sprint") {
        return SessionKind::Sprint;
    }
    if type_lower.contains("race") || name_lower.contains("race") {
        return SessionKind::Race;
    }
    if type_lower.contains("practice") || name_lower.contains("practice") {
        return SessionKind::Practice;
    }
    SessionKind::Unknown
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest_clock(&self, anchor: ClockAnchor) {
        let mut inner = self.lock();
        if anchor.extrapolating {
            let part = inner.session_part.unwrap_or(0);
            let total = ceil_minute(anchor.remaining_s);
            inner.part_totals.entry(part).or_insert(total);
        }
        inner.anchor = Some(anchor);
    }

    pub fn ingest_session_status(&self, status: &str) {
        self.lock().session_status = Some(status.to_string());
    }

    pub fn ingest_session_data(&self, update: &SessionDataUpdate) {
        let mut inner = self.lock();
        if let Some(started) = update.started_utc {
            inner.session_started_utc = Some(started);
        }
        if let Some(part) = update.latest_part {
            inner.session_part = Some(part);
        }
    }

    pub fn set_session_meta(&self, meta: SessionMeta) {
        self.lock().meta = Some(meta);
    }

    pub fn set_window(&self, window: Option<SessionWindow>) {
        self.lock().window = window;
    }

    pub fn set_derived_flag(&self, flag: DerivedFlag) {
        self.lock().derived_flag = flag;
    }

    /// Clamped to [0, 300].
    pub fn set_live_delay(&self, seconds: u32) {
        let clamped = seconds.min(MAX_LIVE_DELAY_S);
        debug!(seconds = clamped, "live delay updated");
        self.lock().live_delay_s = clamped;
    }

    pub fn live_delay(&self) -> u32 {
        self.lock().live_delay_s
    }

    /// Called on every Heartbeat event; anchors server-now.
    pub fn record_heartbeat(&self, utc: DateTime<Utc>) {
        self.lock().heartbeat = Some((utc, Instant::now()));
    }

    /// Current server time: heartbeat-anchored when available, shifted back
    /// by the live delay.
    pub fn server_now(&self) -> DateTime<Utc> {
        let inner = self.lock();
        let base = match inner.heartbeat {
            Some((utc, mono)) => {
                utc + ChronoDuration::milliseconds(mono.elapsed().as_millis() as i64)
            }
            None => Utc::now(),
        };
        base - ChronoDuration::seconds(inner.live_delay_s as i64)
    }

    pub fn snapshot(&self) -> SessionClockSnapshot {
        let now = self.server_now();
        self.snapshot_at(now)
    }

    /// Build the clock state for an explicit server-now. Deterministic;
    /// exposed for diagnostics and tests.
    pub fn snapshot_at(&self, server_now: DateTime<Utc>) -> SessionClockSnapshot {
        let inner = self.lock();

        let session_name = inner
            .meta
            .as_ref()
            .map(|m| m.name.clone())
            .or_else(|| inner.window.as_ref().map(|w| w.session_name.clone()));
        let kind = kind_of(
            session_name.as_deref().unwrap_or(""),
            inner.meta.as_ref().map(|m| m.kind.as_str()).unwrap_or(""),
        );
        let session_type = match kind {
            SessionKind::Practice => Some("Practice".to_string()),
            SessionKind::Qualifying => Some("Qualifying".to_string()),
            SessionKind::Sprint | SessionKind::Race => Some("Race".to_string()),
            SessionKind::Unknown => inner.meta.as_ref().map(|m| m.kind.clone()),
        };

        let total_s = self.total_s(&inner, kind);

        let remaining_s = inner.anchor.map(|anchor| {
            if anchor.extrapolating {
                let gone = (server_now - anchor.utc).num_seconds();
                (anchor.remaining_s as i64 - gone.max(0)).max(0) as u32
            } else {
                anchor.remaining_s
            }
        });

        let session_start_utc = inner
            .session_started_utc
            .or_else(|| inner.meta.as_ref().and_then(|m| m.scheduled_start_utc))
            .or_else(|| inner.window.as_ref().map(|w| w.start_utc));

        let elapsed_s = match (total_s, remaining_s) {
            (Some(total), Some(remaining)) => Some(total.saturating_sub(remaining)),
            _ => session_start_utc
                .map(|start| (server_now - start).num_seconds().max(0) as u32),
        };

        let running = inner.anchor.map(|a| a.extrapolating).unwrap_or(false)
            && remaining_s.map(|r| r > 0).unwrap_or(false)
            && inner.derived_flag != DerivedFlag::Red
            && inner.session_status.as_deref() != Some("Paused");

        let phase = if running {
            "running"
        } else if inner.anchor.is_some() {
            "stopped"
        } else {
            "unavailable"
        };

        let source_quality = if inner.anchor.is_some() {
            SourceQuality::Official
        } else if inner.session_started_utc.is_some() {
            SourceQuality::SessionDataFallback
        } else {
            SourceQuality::Unavailable
        };

        // Three-hour cap applies to grands prix only; sprints are exempt.
        let race_start_utc = if kind == SessionKind::Race {
            inner.session_started_utc.or_else(|| {
                let anchor = inner.anchor?;
                let total = total_s?;
                Some(
                    anchor.utc
                        - ChronoDuration::seconds(
                            total.saturating_sub(anchor.remaining_s) as i64
                        ),
                )
            })
        } else {
            None
        };
        let race_three_hour_cap_utc = race_start_utc.map(|start| start + RACE_CAP);
        let race_three_hour_remaining_s = race_three_hour_cap_utc
            .map(|cap| (cap - server_now).num_seconds().max(0) as u32);

        SessionClockSnapshot {
            session_type,
            session_name,
            session_part: inner.session_part,
            session_status: inner.session_status.clone(),
            total_s,
            remaining_s,
            elapsed_s,
            running,
            phase,
            source_quality,
            session_start_utc,
            race_start_utc,
            race_three_hour_cap_utc,
            race_three_hour_remaining_s,
            reference_utc: inner.anchor.map(|a| a.utc),
            server_now_utc: server_now,
        }
    }

    fn total_s(&self, inner: &Inner, kind: SessionKind) -> Option<u32> {
        match kind {
            SessionKind::Race => Some(RACE_TOTAL_S),
            SessionKind::Qualifying | SessionKind::Sprint => {
                let part = inner.session_part.unwrap_or(0);
                inner.part_totals.get(&part).copied().or_else(|| {
                    inner
                        .anchor
                        .filter(|a| a.extrapolating)
                        .map(|a| ceil_minute(a.remaining_s))
                })
            }
            SessionKind::Practice => inner
                .window
                .as_ref()
                .map(|w| w.duration().num_seconds().max(0) as u32),
            SessionKind::Unknown => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::session::parse_session_data;
    use serde_json::json;

    fn utc(value: &str) -> DateTime<Utc> {
        value.parse().unwrap()
    }

    fn meta(name: &str, kind: &str) -> SessionMeta {
        SessionMeta { name: name.into(), kind: kind.into(), ..SessionMeta::default() }
    }

    fn window(name: &str, start: &str, end: &str) -> SessionWindow {
        SessionWindow {
            meeting_name: "Test".into(),
            session_name: name.into(),
            path: String::new(),
            start_utc: utc(start),
            end_utc: utc(end),
            connect_at: utc(start),
            disconnect_at: utc(end),
            meeting_key: None,
            session_key: None,
        }
    }

    #[test]
    fn qualifying_extrapolation_vector() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Qualifying", "Qualifying"));
        clock.ingest_session_data(&parse_session_data(&json!({
            "Series": {"0": {"Utc": "2025-12-06T13:46:34.368Z", "QualifyingPart": 1}}
        })));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-06T14:00:01.002Z"),
            remaining_s: 17 * 60 + 59,
            extrapolating: true,
        });

        let state = clock.snapshot_at(utc("2025-12-06T14:00:11.002Z"));
        assert_eq!(state.session_part, Some(1));
        assert_eq!(state.total_s, Some(1080));
        assert_eq!(state.remaining_s, Some(1069));
        assert_eq!(state.elapsed_s, Some(11));
        assert!(state.running);
        assert_eq!(state.phase, "running");
        assert_eq!(state.source_quality, SourceQuality::Official);
    }

    #[test]
    fn race_three_hour_cap_from_session_data() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Race", "Race"));
        clock.ingest_session_data(&parse_session_data(&json!({
            "StatusSeries": {"7": {"Utc": "2025-12-07T13:03:27.584Z", "SessionStatus": "Started"}}
        })));

        let state = clock.snapshot_at(utc("2025-12-07T15:03:27.584Z"));
        assert_eq!(state.race_start_utc, Some(utc("2025-12-07T13:03:27.584Z")));
        assert_eq!(state.race_three_hour_cap_utc, Some(utc("2025-12-07T16:03:27.584Z")));
        assert_eq!(state.race_three_hour_remaining_s, Some(3600));
        assert_eq!(state.source_quality, SourceQuality::SessionDataFallback);
    }

    #[test]
    fn race_start_falls_back_to_anchor() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Race", "Race"));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T13:03:28.008Z"),
            remaining_s: 7199,
            extrapolating: true,
        });

        let state = clock.snapshot_at(utc("2025-12-07T13:03:28.008Z"));
        assert_eq!(state.race_start_utc, Some(utc("2025-12-07T13:03:27.008Z")));
        assert_eq!(state.race_three_hour_cap_utc, Some(utc("2025-12-07T16:03:27.008Z")));
        assert_eq!(state.source_quality, SourceQuality::Official);
    }

    #[test]
    fn sprint_has_no_three_hour_cap() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Sprint", "Race"));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T13:00:00Z"),
            remaining_s: 1800,
            extrapolating: true,
        });
        let state = clock.snapshot_at(utc("2025-12-07T13:20:00Z"));
        assert_eq!(state.race_start_utc, None);
        assert_eq!(state.race_three_hour_cap_utc, None);
        assert_eq!(state.race_three_hour_remaining_s, None);
    }

    #[test]
    fn race_default_total_applies_on_restart() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Race", "Race"));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T14:30:00Z"),
            remaining_s: 3600,
            extrapolating: false,
        });
        let state = clock.snapshot_at(utc("2025-12-07T14:30:05Z"));
        assert_eq!(state.total_s, Some(7200));
        assert_eq!(state.remaining_s, Some(3600));
        assert_eq!(state.elapsed_s, Some(3600));
        assert!(!state.running);
    }

    #[test]
    fn practice_total_from_live_window() {
        let clock = SessionClock::new();
        clock.set_window(Some(window(
            "Practice 1",
            "2025-12-07T08:00:00Z",
            "2025-12-07T09:00:00Z",
        )));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T08:40:00Z"),
            remaining_s: 20 * 60,
            extrapolating: false,
        });

        let state = clock.snapshot_at(utc("2025-12-07T08:40:05Z"));
        assert_eq!(state.session_type.as_deref(), Some("Practice"));
        assert_eq!(state.session_name.as_deref(), Some("Practice 1"));
        assert_eq!(state.total_s, Some(3600));
        assert_eq!(state.remaining_s, Some(1200));
        assert_eq!(state.elapsed_s, Some(2400));
    }

    #[test]
    fn elapsed_unavailable_without_total_or_start() {
        let clock = SessionClock::new();
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T08:40:00Z"),
            remaining_s: 20 * 60,
            extrapolating: false,
        });
        let state = clock.snapshot_at(utc("2025-12-07T08:40:05Z"));
        assert_eq!(state.total_s, None);
        assert_eq!(state.remaining_s, Some(1200));
        assert_eq!(state.elapsed_s, None);
    }

    #[test]
    fn elapsed_from_session_data_start_when_total_unknown() {
        let clock = SessionClock::new();
        clock.ingest_session_data(&parse_session_data(&json!({
            "StatusSeries": {"0": {"Utc": "2025-12-07T08:00:00Z", "SessionStatus": "Started"}}
        })));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T08:40:00Z"),
            remaining_s: 20 * 60,
            extrapolating: false,
        });
        let state = clock.snapshot_at(utc("2025-12-07T08:40:05Z"));
        assert_eq!(state.total_s, None);
        assert_eq!(state.session_start_utc, Some(utc("2025-12-07T08:00:00Z")));
        assert_eq!(state.elapsed_s, Some(2405));
    }

    #[test]
    fn elapsed_from_window_start_when_total_unknown() {
        let clock = SessionClock::new();
        clock.set_window(Some(window(
            "Unknown Session",
            "2025-12-07T08:00:00Z",
            "2025-12-07T08:00:00Z",
        )));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T08:40:00Z"),
            remaining_s: 20 * 60,
            extrapolating: false,
        });
        let state = clock.snapshot_at(utc("2025-12-07T08:40:05Z"));
        assert_eq!(state.total_s, None);
        assert_eq!(state.session_start_utc, Some(utc("2025-12-07T08:00:00Z")));
        assert_eq!(state.elapsed_s, Some(2405));
    }

    #[test]
    fn red_flag_and_pause_stop_the_clock() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Race", "Race"));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-07T13:00:00Z"),
            remaining_s: 3600,
            extrapolating: true,
        });
        assert!(clock.snapshot_at(utc("2025-12-07T13:00:10Z")).running);

        clock.set_derived_flag(DerivedFlag::Red);
        assert!(!clock.snapshot_at(utc("2025-12-07T13:00:11Z")).running);

        clock.set_derived_flag(DerivedFlag::Green);
        clock.ingest_session_status("Paused");
        assert!(!clock.snapshot_at(utc("2025-12-07T13:00:12Z")).running);
    }

    #[test]
    fn remaining_is_monotonic_while_running() {
        let clock = SessionClock::new();
        clock.set_session_meta(meta("Qualifying", "Qualifying"));
        clock.ingest_clock(ClockAnchor {
            utc: utc("2025-12-06T14:00:00Z"),
            remaining_s: 900,
            extrapolating: true,
        });
        let mut last_remaining = u32::MAX;
        let mut last_elapsed = 0u32;
        for step in 0..30 {
            let now = utc("2025-12-06T14:00:00Z") + ChronoDuration::seconds(step * 7);
            let state = clock.snapshot_at(now);
            let remaining = state.remaining_s.unwrap();
            let elapsed = state.elapsed_s.unwrap();
            assert!(remaining <= last_remaining);
            assert!(elapsed >= last_elapsed);
            last_remaining = remaining;
            last_elapsed = elapsed;
        }
    }

    #[test]
    fn live_delay_shifts_server_now() {
        let clock = SessionClock::new();
        clock.set_live_delay(30);
        assert_eq!(clock.live_delay(), 30);
        let anchor_utc = Utc::now();
        clock.record_heartbeat(anchor_utc);
        let server_now = clock.server_now();
        let shift = (anchor_utc - server_now).num_seconds();
        // Heartbeat just arrived: server-now sits ~30 s behind it.
        assert!((29..=31).contains(&shift), "shift was {shift}");
    }

    #[test]
    fn live_delay_is_clamped() {
        let clock = SessionClock::new();
        clock.set_live_delay(100_000);
        assert_eq!(clock.live_delay(), MAX_LIVE_DELAY_S);
    }
}
