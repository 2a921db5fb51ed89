//! Replay recording: download, merge, index and cache archived sessions.
//!
//! Every stream of a session is fetched from the static archive, parsed
//! line-by-line, merged into one time-ordered `frames.jsonl` and described
//! by an `index.json` carrying the session-start offset and an initial-state
//! snapshot. The cache is versioned; stale versions are rebuilt.

use chrono::{Datelike, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, TimingError};
use crate::http::ARCHIVE_TIMEOUT;
use crate::jsonstream;
use crate::normalize::top_three::TopThreeState;
use crate::schedule::build_session_windows;
use crate::types::{ReplayFrame, ReplayIndex, ReplaySession, StreamId};

/// Bump when the index format (notably `initial_state`) changes; older
/// caches are discarded and re-downloaded.
pub const CACHE_VERSION: u32 = 2;

/// How long cached sessions are kept, measured by `index.json` mtime.
pub const CACHE_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Upper bound on the session list shown for replay selection.
const MAX_SESSIONS: usize = 150;

/// Streams downloaded for replay.
pub const REPLAY_STREAMS: &[StreamId] = &[
    StreamId::RaceControlMessages,
    StreamId::TrackStatus,
    StreamId::SessionStatus,
    StreamId::SessionInfo,
    StreamId::SessionData,
    StreamId::WeatherData,
    StreamId::LapCount,
    StreamId::Heartbeat,
    StreamId::ExtrapolatedClock,
    StreamId::TimingData,
    StreamId::TimingAppData,
    StreamId::DriverList,
    StreamId::TopThree,
    StreamId::TyreStintSeries,
    StreamId::TeamRadio,
    StreamId::PitStopSeries,
    StreamId::ChampionshipPrediction,
];

/// A recorded session ready for playback.
#[derive(Debug, Clone)]
pub struct LoadedReplay {
    pub index: ReplayIndex,
    pub frames_path: PathBuf,
}

/// Manages discovery, download, caching and indexing of replay sessions.
pub struct ReplayRecorder {
    client: reqwest::Client,
    cache_dir: PathBuf,
    static_base: String,
}

impl ReplayRecorder {
    pub fn new(
        client: reqwest::Client,
        cache_dir: PathBuf,
        static_base: impl Into<String>,
    ) -> Self {
        Self { client, cache_dir, static_base: static_base.into() }
    }

    /// Create the cache directory and drop entries past retention.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| TimingError::cache_error(&self.cache_dir, e))?;
        let cleaned = self.cleanup_old_cache(CACHE_RETENTION).await?;
        if cleaned > 0 {
            info!(cleaned, "removed expired replay cache entries");
        }
        Ok(())
    }

    /// Remove session directories whose `index.json` is older than
    /// `retention`. Returns how many were removed.
    pub async fn cleanup_old_cache(&self, retention: Duration) -> Result<usize> {
        let mut cleaned = 0;
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let session_dir = entry.path();
            if !session_dir.is_dir() {
                continue;
            }
            let index_path = session_dir.join("index.json");
            let Ok(meta) = tokio::fs::metadata(&index_path).await else { continue };
            let expired = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > retention)
                .unwrap_or(false);
            if expired {
                debug!(dir = %session_dir.display(), "removing expired replay cache");
                if tokio::fs::remove_dir_all(&session_dir).await.is_ok() {
                    cleaned += 1;
                }
            }
        }
        Ok(cleaned)
    }

    /// List playable past sessions from the season index, newest first.
    /// Falls back to the previous season around the year rollover.
    pub async fn list_sessions(&self, year: Option<i32>) -> Result<Vec<ReplaySession>> {
        let current_year = Utc::now().year();
        let year = year.unwrap_or(current_year);
        let candidates: &[i32] =
            if year == current_year { &[year, year - 1] } else { &[year] };

        let mut payload = None;
        let mut used_year = year;
        for candidate in candidates {
            let url = format!("{}/{}/Index.json", self.static_base, candidate);
            match self.fetch_archive_text(&url).await {
                Ok(Some(text)) => {
                    match serde_json::from_str::<Value>(text.trim_start_matches('\u{feff}')) {
                        Ok(parsed) => {
                            payload = Some(parsed);
                            used_year = *candidate;
                            break;
                        }
                        Err(err) => warn!(year = candidate, %err, "season index unparsable"),
                    }
                }
                Ok(None) => debug!(year = candidate, "season index not published"),
                Err(err) => warn!(year = candidate, %err, "season index fetch failed"),
            }
        }
        let Some(payload) = payload else {
            return Err(TimingError::schedule_error("no season index available"));
        };

        let now = Utc::now();
        let mut sessions: Vec<ReplaySession> =
            build_session_windows(&payload, chrono::Duration::zero(), chrono::Duration::zero())
                .into_iter()
                .filter(|w| !w.path.is_empty() && w.end_utc < now)
                .map(|w| ReplaySession {
                    year: used_year,
                    meeting_key: w.meeting_key.unwrap_or_default(),
                    meeting_name: w.meeting_name,
                    session_key: w.session_key.unwrap_or_default(),
                    session_name: w.session_name.clone(),
                    session_type: w.session_name,
                    path: w.path.trim_matches('/').to_string(),
                    start_utc: w.start_utc,
                    end_utc: w.end_utc,
                })
                .collect();
        sessions.sort_by(|a, b| b.start_utc.cmp(&a.start_utc));
        sessions.truncate(MAX_SESSIONS);
        info!(sessions = sessions.len(), year = used_year, "replay sessions listed");
        Ok(sessions)
    }

    /// Record a session: reuse a valid cache or download, merge and index
    /// all of its archive streams.
    pub async fn record(&self, session: &ReplaySession) -> Result<LoadedReplay> {
        let session_dir = self.cache_dir.join(session.unique_id());
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(|e| TimingError::cache_error(&session_dir, e))?;
        let frames_path = session_dir.join("frames.jsonl");
        let index_path = session_dir.join("index.json");

        if let Some(index) = self.load_cached_index(&frames_path, &index_path).await {
            debug!(session = %session.unique_id(), "reusing cached replay");
            return Ok(LoadedReplay { index, frames_path });
        }

        let static_root = format!("{}/{}", self.static_base, session.path);
        let mut frames: Vec<ReplayFrame> = Vec::new();
        for stream in REPLAY_STREAMS {
            let url = format!("{static_root}/{}.jsonStream", stream.as_str());
            match self.fetch_archive_text(&url).await {
                Ok(Some(text)) => {
                    let parsed = parse_stream_text(*stream, &text, &static_root);
                    debug!(stream = stream.as_str(), frames = parsed.len(), "stream downloaded");
                    frames.extend(parsed);
                }
                // 404 means the host has not published this stream; fine.
                Ok(None) => {}
                Err(err) => warn!(stream = stream.as_str(), %err, "stream download failed"),
            }
        }
        if frames.is_empty() {
            return Err(TimingError::replay_error(
                "no frames downloaded - session data may not be available yet",
            ));
        }

        frames.sort_by_key(|f| f.timestamp_ms);

        let session_started_at_ms = frames
            .iter()
            .find(|f| {
                f.stream == StreamId::SessionStatus
                    && f.payload.get("Status").and_then(Value::as_str) == Some("Started")
            })
            .map(|f| f.timestamp_ms)
            .unwrap_or(0);
        let formation_start_ms = find_formation_marker(&frames, session_started_at_ms);
        let initial_state = build_initial_state(&frames, session_started_at_ms);

        let duration_ms = frames.last().map(|f| f.timestamp_ms).unwrap_or(0);
        let index = ReplayIndex {
            cache_version: CACHE_VERSION,
            session_id: session.unique_id(),
            total_frames: frames.len(),
            duration_ms,
            session_started_at_ms,
            formation_start_ms,
            initial_state,
            created_at: Utc::now(),
        };

        let mut lines = String::new();
        for frame in &frames {
            lines.push_str(&serde_json::to_string(frame)?);
            lines.push('\n');
        }
        tokio::fs::write(&frames_path, lines)
            .await
            .map_err(|e| TimingError::cache_error(&frames_path, e))?;
        tokio::fs::write(&index_path, serde_json::to_string_pretty(&index)?)
            .await
            .map_err(|e| TimingError::cache_error(&index_path, e))?;

        info!(
            session = %session.unique_id(),
            frames = index.total_frames,
            session_start_ms = session_started_at_ms,
            "replay session recorded"
        );
        Ok(LoadedReplay { index, frames_path })
    }

    /// Delete a session's cache directory.
    pub async fn unload(&self, session_id: &str) -> Result<()> {
        let session_dir = self.cache_dir.join(session_id);
        if tokio::fs::try_exists(&session_dir).await.unwrap_or(false) {
            info!(session = session_id, "deleting replay cache");
            tokio::fs::remove_dir_all(&session_dir)
                .await
                .map_err(|e| TimingError::cache_error(&session_dir, e))?;
        }
        Ok(())
    }

    async fn load_cached_index(
        &self,
        frames_path: &PathBuf,
        index_path: &PathBuf,
    ) -> Option<ReplayIndex> {
        if !tokio::fs::try_exists(frames_path).await.unwrap_or(false) {
            return None;
        }
        let text = tokio::fs::read_to_string(index_path).await.ok()?;
        match serde_json::from_str::<ReplayIndex>(&text) {
            Ok(index) if index.cache_version >= CACHE_VERSION => Some(index),
            Ok(index) => {
                info!(
                    cached = index.cache_version,
                    current = CACHE_VERSION,
                    "replay cache version mismatch; re-downloading"
                );
                None
            }
            Err(err) => {
                warn!(%err, "replay cache index corrupt; re-downloading");
                None
            }
        }
    }

    /// `Ok(None)` on 404: the resource is not published (yet).
    async fn fetch_archive_text(&self, url: &str) -> Result<Option<String>> {
        let response = self.client.get(url).timeout(ARCHIVE_TIMEOUT).send().await?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            return Err(TimingError::status_error(url, status));
        }
        Ok(Some(response.text().await?))
    }
}

/// Parse one downloaded `.jsonStream` body into frames.
fn parse_stream_text(stream: StreamId, text: &str, static_root: &str) -> Vec<ReplayFrame> {
    text.lines()
        .filter_map(|line| {
            let (timestamp_ms, mut payload) = jsonstream::parse_line(line)?;
            // Team-radio clips are relative; remember where they live.
            if stream == StreamId::TeamRadio {
                if let Some(map) = payload.as_object_mut() {
                    map.insert("_static_root".to_string(), Value::String(static_root.to_string()));
                }
            }
            Some(ReplayFrame { timestamp_ms, stream, payload })
        })
        .collect()
}

/// Offset of the last pre-start race-control message announcing the
/// formation lap, if the archive has one.
fn find_formation_marker(frames: &[ReplayFrame], session_started_at_ms: u64) -> Option<u64> {
    frames
        .iter()
        .filter(|f| {
            f.stream == StreamId::RaceControlMessages && f.timestamp_ms <= session_started_at_ms
        })
        .filter(|f| {
            f.payload
                .get("Messages")
                .map(|raw| {
                    jsonstream::indexed_sequence(raw).into_iter().any(|(_, entry)| {
                        entry
                            .get("Message")
                            .and_then(Value::as_str)
                            .map(|m| m.to_ascii_uppercase().contains("FORMATION"))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        })
        .map(|f| f.timestamp_ms)
        .last()
}

/// Last payload of each stream at or before session start. Late-joining
/// streams contribute their first post-start payload instead; TopThree
/// accumulates deltas until all three slots fill.
fn build_initial_state(
    frames: &[ReplayFrame],
    session_started_at_ms: u64,
) -> BTreeMap<String, Value> {
    let mut initial_state: BTreeMap<String, Value> = BTreeMap::new();
    let mut top_three = TopThreeState::default();

    for frame in frames {
        if frame.timestamp_ms > session_started_at_ms {
            break;
        }
        if frame.stream == StreamId::TopThree {
            top_three.merge(&frame.payload);
        } else {
            initial_state.insert(frame.stream.as_str().to_string(), frame.payload.clone());
        }
    }
    if top_three.has_any() {
        initial_state.insert(StreamId::TopThree.as_str().to_string(), top_three.to_payload());
    }

    let mut missing: std::collections::BTreeSet<StreamId> = REPLAY_STREAMS
        .iter()
        .copied()
        .filter(|s| !initial_state.contains_key(s.as_str()))
        .collect();
    if missing.is_empty() {
        return initial_state;
    }
    for frame in frames.iter().filter(|f| f.timestamp_ms > session_started_at_ms) {
        if !missing.contains(&frame.stream) {
            continue;
        }
        if frame.stream == StreamId::TopThree {
            top_three.merge(&frame.payload);
            if top_three.is_complete() {
                initial_state
                    .insert(StreamId::TopThree.as_str().to_string(), top_three.to_payload());
                missing.remove(&StreamId::TopThree);
            }
        } else {
            initial_state.insert(frame.stream.as_str().to_string(), frame.payload.clone());
            missing.remove(&frame.stream);
        }
        if missing.is_empty() {
            break;
        }
    }
    // TopThree never completed: ship the partial accumulation.
    if missing.contains(&StreamId::TopThree) && top_three.has_any() {
        initial_state.insert(StreamId::TopThree.as_str().to_string(), top_three.to_payload());
    }
    initial_state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(t: u64, stream: StreamId, payload: Value) -> ReplayFrame {
        ReplayFrame { timestamp_ms: t, stream, payload }
    }

    #[test]
    fn parses_stream_text_and_annotates_team_radio() {
        let text = concat!(
            "00:00:01.000{\"Captures\":[{\"Path\":\"clip1.mp3\"}]}\n",
            "broken line\n",
            "00:00:02.500{\"Captures\":[{\"Path\":\"clip2.mp3\"}]}\n",
        );
        let frames =
            parse_stream_text(StreamId::TeamRadio, text, "https://example.test/static/2025/race");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp_ms, 1_000);
        assert_eq!(
            frames[0].payload["_static_root"],
            "https://example.test/static/2025/race"
        );
    }

    #[test]
    fn initial_state_keeps_last_value_per_stream() {
        let frames = vec![
            frame(0, StreamId::TrackStatus, json!({"Status": "1"})),
            frame(500, StreamId::TrackStatus, json!({"Status": "2"})),
            frame(800, StreamId::WeatherData, json!({"AirTemp": "24.0"})),
            frame(1_000, StreamId::SessionStatus, json!({"Status": "Started"})),
            frame(1_500, StreamId::TrackStatus, json!({"Status": "5"})),
        ];
        let state = build_initial_state(&frames, 1_000);
        assert_eq!(state["TrackStatus"]["Status"], "2");
        assert_eq!(state["WeatherData"]["AirTemp"], "24.0");
        assert_eq!(state["SessionStatus"]["Status"], "Started");
        assert!(!state.contains_key("TimingData"));
    }

    #[test]
    fn initial_state_accumulates_late_top_three() {
        let frames = vec![
            frame(0, StreamId::SessionStatus, json!({"Status": "Started"})),
            frame(100, StreamId::TopThree, json!({"Lines": {"0": {"Tla": "VER"}}})),
            frame(200, StreamId::TopThree, json!({"Lines": {"1": {"Tla": "NOR"}}})),
            frame(300, StreamId::TopThree, json!({"Lines": {"2": {"Tla": "LEC"}}})),
        ];
        let state = build_initial_state(&frames, 0);
        let lines = state["TopThree"]["Lines"].as_array().unwrap().clone();
        assert_eq!(lines[0]["Tla"], "VER");
        assert_eq!(lines[1]["Tla"], "NOR");
        assert_eq!(lines[2]["Tla"], "LEC");
    }

    #[test]
    fn initial_state_ships_partial_top_three() {
        let frames = vec![
            frame(0, StreamId::SessionStatus, json!({"Status": "Started"})),
            frame(100, StreamId::TopThree, json!({"Lines": {"0": {"Tla": "VER"}}})),
        ];
        let state = build_initial_state(&frames, 0);
        let lines = state["TopThree"]["Lines"].as_array().unwrap().clone();
        assert_eq!(lines[0]["Tla"], "VER");
        assert!(lines[1].is_null());
    }

    #[test]
    fn formation_marker_is_last_pre_start_mention() {
        let frames = vec![
            frame(
                1_000,
                StreamId::RaceControlMessages,
                json!({"Messages": [{"Message": "FORMATION LAP WILL START AT 15:02"}]}),
            ),
            frame(
                5_000,
                StreamId::RaceControlMessages,
                json!({"Messages": {"4": {"Message": "FORMATION LAP STARTED"}}}),
            ),
            frame(9_000, StreamId::SessionStatus, json!({"Status": "Started"})),
            frame(
                12_000,
                StreamId::RaceControlMessages,
                json!({"Messages": [{"Message": "FORMATION (IGNORED, POST START)"}]}),
            ),
        ];
        assert_eq!(find_formation_marker(&frames, 9_000), Some(5_000));
        assert_eq!(find_formation_marker(&frames[2..], 9_000), None);
    }

    #[tokio::test]
    async fn record_round_trips_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ReplayRecorder::new(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
            "http://127.0.0.1:9/static",
        );
        recorder.initialize().await.unwrap();

        let session = ReplaySession {
            year: 2025,
            meeting_key: 1,
            meeting_name: "Test GP".into(),
            session_key: 2,
            session_name: "Race".into(),
            session_type: "Race".into(),
            path: "2025/test/race".into(),
            start_utc: "2025-06-01T13:00:00Z".parse().unwrap(),
            end_utc: "2025-06-01T15:00:00Z".parse().unwrap(),
        };

        // Seed the cache as a prior download would have left it.
        let session_dir = dir.path().join(session.unique_id());
        std::fs::create_dir_all(&session_dir).unwrap();
        let frames = vec![
            frame(0, StreamId::TrackStatus, json!({"Status": "1"})),
            frame(10, StreamId::SessionStatus, json!({"Status": "Started"})),
            frame(20, StreamId::TimingData, json!({"Lines": {}})),
        ];
        let lines: Vec<String> =
            frames.iter().map(|f| serde_json::to_string(f).unwrap()).collect();
        std::fs::write(session_dir.join("frames.jsonl"), lines.join("\n")).unwrap();
        let index = ReplayIndex {
            cache_version: CACHE_VERSION,
            session_id: session.unique_id(),
            total_frames: 3,
            duration_ms: 20,
            session_started_at_ms: 10,
            formation_start_ms: None,
            initial_state: BTreeMap::new(),
            created_at: Utc::now(),
        };
        std::fs::write(
            session_dir.join("index.json"),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();

        // The recorder must serve the cache without touching the network
        // (the static base points at a dead port).
        let loaded = recorder.record(&session).await.unwrap();
        assert_eq!(loaded.index.total_frames, 3);
        assert_eq!(loaded.index.session_started_at_ms, 10);

        recorder.unload(&session.unique_id()).await.unwrap();
        assert!(!session_dir.exists());
    }

    #[tokio::test]
    async fn stale_cache_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ReplayRecorder::new(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
            "http://127.0.0.1:9/static",
        );

        let session_dir = dir.path().join("2025_1_2");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(session_dir.join("frames.jsonl"), "").unwrap();
        let index = json!({
            "cache_version": CACHE_VERSION - 1,
            "session_id": "2025_1_2",
            "total_frames": 0,
            "duration_ms": 0,
            "session_started_at_ms": 0,
            "initial_state": {},
            "created_at": "2025-01-01T00:00:00Z",
        });
        std::fs::write(session_dir.join("index.json"), index.to_string()).unwrap();

        let frames_path = session_dir.join("frames.jsonl");
        let index_path = session_dir.join("index.json");
        assert!(recorder.load_cached_index(&frames_path, &index_path).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_respects_retention() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ReplayRecorder::new(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
            "http://127.0.0.1:9/static",
        );

        let fresh = dir.path().join("2025_9_9");
        std::fs::create_dir_all(&fresh).unwrap();
        std::fs::write(fresh.join("index.json"), "{}").unwrap();

        // Zero retention: everything with an index is expired.
        let cleaned = recorder.cleanup_old_cache(Duration::ZERO).await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(!fresh.exists());
    }
}
