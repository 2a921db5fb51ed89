//! Formation-start detection from the CarData archive.
//!
//! Race and sprint broadcasts begin with the formation lap, which never gets
//! an explicit feed marker. The tracker watches `SessionInfo` for the
//! scheduled start, then shortly before it starts streaming the compressed
//! `CarData.z.jsonStream` archive and picks the telemetry timestamp closest
//! to the scheduled start. Line payloads are base64-wrapped raw-deflate
//! JSON; decoding runs off the async runtime in 50-line chunks.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{LiveBus, Subscription};
use crate::jsonstream;
use crate::normalize::session;
use crate::types::StreamId;

/// Accept markers within this window around the scheduled start.
const SEARCH_WINDOW: ChronoDuration = ChronoDuration::seconds(90);
/// Begin probing this long before the scheduled start.
const PRE_WINDOW: ChronoDuration = ChronoDuration::seconds(60);
const RETRY_DELAY: Duration = Duration::from_secs(20);
const MAX_ATTEMPTS: u32 = 3;
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
/// Decode chunk size handed to the blocking pool.
const PARSE_CHUNK: usize = 50;

/// Probe lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormationStatus {
    #[default]
    Idle,
    /// Session is not a race or sprint.
    NotApplicable,
    /// Waiting for or running the archive probe.
    Pending,
    /// Marker found; session not yet started.
    Ready,
    /// Marker found and the session has gone live.
    Live,
    /// All attempts exhausted.
    Unavailable,
}

/// Why a probe attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    NotFound,
    Timeout,
    /// Archive ends well before the scheduled start.
    NotReached,
    OutOfWindow,
    Empty,
    NoMatch,
    Error,
}

impl ProbeFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeFailure::NotFound => "not_found",
            ProbeFailure::Timeout => "timeout",
            ProbeFailure::NotReached => "not_reached",
            ProbeFailure::OutOfWindow => "out_of_window",
            ProbeFailure::Empty => "empty",
            ProbeFailure::NoMatch => "no_match",
            ProbeFailure::Error => "error",
        }
    }
}

/// Published tracker state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FormationSnapshot {
    pub status: FormationStatus,
    pub session_id: Option<String>,
    pub scheduled_start_utc: Option<DateTime<Utc>>,
    pub formation_start_utc: Option<DateTime<Utc>>,
    pub delta_seconds: Option<f64>,
    pub error: Option<ProbeFailure>,
}

struct TrackerState {
    session_id: Option<String>,
    snapshot: FormationSnapshot,
    probe: Option<JoinHandle<()>>,
}

struct Inner {
    client: reqwest::Client,
    static_base: String,
    state: Mutex<TrackerState>,
    tx: watch::Sender<FormationSnapshot>,
    cancel: CancellationToken,
}

/// Finds the formation start marker near the scheduled session start.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FormationStartTracker {
    inner: Arc<Inner>,
}

/// Decode a batch of CarData archive lines into telemetry timestamps.
/// CPU-bound; run on the blocking pool.
pub fn parse_cardata_lines(lines: &[String]) -> Vec<DateTime<Utc>> {
    let mut utcs = Vec::new();
    for line in lines {
        let Some((_, payload)) = jsonstream::parse_line(line) else { continue };
        let Some(encoded) = payload.as_str() else { continue };
        let Ok(compressed) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            continue;
        };
        let mut decoder = flate2::read::DeflateDecoder::new(compressed.as_slice());
        let mut decoded = String::new();
        if decoder.read_to_string(&mut decoded).is_err() {
            continue;
        }
        let Ok(body) = serde_json::from_str::<Value>(&decoded) else { continue };
        let Some(entries) = body.get("Entries").and_then(Value::as_array) else { continue };
        for entry in entries {
            if let Some(utc) = entry
                .get("Utc")
                .and_then(Value::as_str)
                .and_then(jsonstream::parse_utc)
            {
                utcs.push(utc);
            }
        }
    }
    utcs
}

struct ProbeScan {
    target: DateTime<Utc>,
    best: Option<(DateTime<Utc>, f64)>,
    max_seen: Option<DateTime<Utc>>,
    past_window: bool,
}

impl ProbeScan {
    fn new(target: DateTime<Utc>) -> Self {
        Self { target, best: None, max_seen: None, past_window: false }
    }

    fn feed(&mut self, utcs: &[DateTime<Utc>]) {
        for utc in utcs {
            if self.max_seen.map(|m| *utc > m).unwrap_or(true) {
                self.max_seen = Some(*utc);
            }
            let delta = (*utc - self.target).num_milliseconds().abs() as f64 / 1000.0;
            if self.best.map(|(_, d)| delta < d).unwrap_or(true) {
                self.best = Some((*utc, delta));
            }
            if *utc > self.target + SEARCH_WINDOW {
                self.past_window = true;
                return;
            }
        }
    }

    fn verdict(self) -> Result<(DateTime<Utc>, f64), ProbeFailure> {
        let Some(max_seen) = self.max_seen else { return Err(ProbeFailure::Empty) };
        if max_seen < self.target - ChronoDuration::seconds(1) {
            return Err(ProbeFailure::NotReached);
        }
        let Some((best, delta)) = self.best else { return Err(ProbeFailure::NoMatch) };
        if delta > SEARCH_WINDOW.num_seconds() as f64 {
            return Err(ProbeFailure::OutOfWindow);
        }
        Ok((best, delta))
    }
}

impl FormationStartTracker {
    pub fn new(client: reqwest::Client, static_base: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(FormationSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                client,
                static_base: static_base.into(),
                state: Mutex::new(TrackerState {
                    session_id: None,
                    snapshot: FormationSnapshot::default(),
                    probe: None,
                }),
                tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to the bus streams that drive the tracker. The returned
    /// subscriptions must be kept alive by the caller.
    pub fn attach(&self, bus: &LiveBus) -> Vec<Subscription> {
        let info = {
            let tracker = self.clone();
            bus.subscribe(StreamId::SessionInfo, move |payload| {
                tracker.handle_session_info(payload);
            })
        };
        let status = {
            let tracker = self.clone();
            bus.subscribe(StreamId::SessionStatus, move |payload| {
                tracker.handle_session_status(payload);
            })
        };
        vec![info, status]
    }

    pub fn snapshot(&self) -> FormationSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FormationSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn formation_start_utc(&self) -> Option<DateTime<Utc>> {
        self.inner.tx.borrow().formation_start_utc
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(probe) = state.probe.take() {
            probe.abort();
        }
    }

    pub(crate) fn handle_session_info(&self, payload: &Value) {
        let Some(meta) = session::parse_session_info(payload) else { return };
        let session_id = meta.path.clone().or_else(|| {
            payload.get("Key").and_then(jsonstream::as_i64).map(|k| k.to_string())
        });

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.session_id != session_id {
            debug!(?session_id, "formation tracker reset for new session");
            if let Some(probe) = state.probe.take() {
                probe.abort();
            }
            state.session_id = session_id.clone();
            state.snapshot = FormationSnapshot {
                session_id,
                ..FormationSnapshot::default()
            };
        }
        state.snapshot.scheduled_start_utc =
            meta.scheduled_start_utc.or(state.snapshot.scheduled_start_utc);

        if !meta.is_race_or_sprint() {
            if state.snapshot.status != FormationStatus::NotApplicable {
                if let Some(probe) = state.probe.take() {
                    probe.abort();
                }
                state.snapshot.status = FormationStatus::NotApplicable;
                state.snapshot.formation_start_utc = None;
                state.snapshot.delta_seconds = None;
                state.snapshot.error = None;
                self.inner.tx.send_replace(state.snapshot.clone());
            }
            return;
        }
        if state.snapshot.formation_start_utc.is_some() {
            return;
        }
        let (Some(scheduled), Some(path)) =
            (state.snapshot.scheduled_start_utc, meta.path.clone())
        else {
            return;
        };
        let probe_running = state.probe.as_ref().map(|p| !p.is_finished()).unwrap_or(false);
        if probe_running {
            return;
        }
        state.snapshot.status = FormationStatus::Pending;
        self.inner.tx.send_replace(state.snapshot.clone());

        let inner = Arc::clone(&self.inner);
        let session_id = state.session_id.clone();
        state.probe = Some(tokio::spawn(async move {
            run_probe(inner, session_id, path, scheduled).await;
        }));
    }

    pub(crate) fn handle_session_status(&self, payload: &Value) {
        if !session::is_session_live(payload) {
            return;
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.snapshot.status == FormationStatus::Ready {
            state.snapshot.status = FormationStatus::Live;
            self.inner.tx.send_replace(state.snapshot.clone());
        }
    }
}

fn cardata_url(static_base: &str, path: &str) -> String {
    format!("{}/{}/CarData.z.jsonStream", static_base.trim_end_matches('/'), path.trim_matches('/'))
}

async fn run_probe(
    inner: Arc<Inner>,
    session_id: Option<String>,
    path: String,
    scheduled: DateTime<Utc>,
) {
    let delay = (scheduled - Utc::now() - PRE_WINDOW).num_seconds().max(0);
    if delay > 0 {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(delay as u64)) => {}
        }
    }

    let url = cardata_url(&inner.static_base, &path);
    for attempt in 1..=MAX_ATTEMPTS {
        if inner.cancel.is_cancelled() || !session_matches(&inner, &session_id) {
            return;
        }
        match probe_cardata(&inner, &url, scheduled).await {
            Ok((found, delta)) => {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.session_id != session_id {
                    return;
                }
                info!(formation_start = %found, delta_s = delta, "formation start marker found");
                state.snapshot.formation_start_utc = Some(found);
                state.snapshot.delta_seconds = Some(delta);
                state.snapshot.status = FormationStatus::Ready;
                state.snapshot.error = None;
                inner.tx.send_replace(state.snapshot.clone());
                return;
            }
            Err(failure) => {
                warn!(attempt, failure = failure.as_str(), "formation probe attempt failed");
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.snapshot.error = Some(failure);
                inner.tx.send_replace(state.snapshot.clone());
            }
        }
        if attempt < MAX_ATTEMPTS {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.session_id == session_id && state.snapshot.status == FormationStatus::Pending {
        state.snapshot.status = FormationStatus::Unavailable;
        inner.tx.send_replace(state.snapshot.clone());
    }
}

fn session_matches(inner: &Inner, session_id: &Option<String>) -> bool {
    inner.state.lock().unwrap_or_else(|e| e.into_inner()).session_id == *session_id
}

async fn probe_cardata(
    inner: &Inner,
    url: &str,
    target: DateTime<Utc>,
) -> Result<(DateTime<Utc>, f64), ProbeFailure> {
    let scan = tokio::time::timeout(FETCH_TIMEOUT, async {
        let response = inner
            .client
            .get(url)
            .send()
            .await
            .map_err(|_| ProbeFailure::Error)?;
        if response.status().as_u16() == 404 {
            return Err(ProbeFailure::NotFound);
        }
        if !response.status().is_success() {
            return Err(ProbeFailure::Error);
        }

        let mut scan = ProbeScan::new(target);
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut batch: Vec<String> = Vec::new();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|_| ProbeFailure::Error)?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if !line.is_empty() {
                    batch.push(line);
                }
                if batch.len() >= PARSE_CHUNK {
                    let chunk_lines = std::mem::take(&mut batch);
                    let utcs =
                        tokio::task::spawn_blocking(move || parse_cardata_lines(&chunk_lines))
                            .await
                            .map_err(|_| ProbeFailure::Error)?;
                    scan.feed(&utcs);
                    if scan.past_window {
                        break 'read;
                    }
                }
            }
        }
        if !batch.is_empty() && !scan.past_window {
            let utcs = tokio::task::spawn_blocking(move || parse_cardata_lines(&batch))
                .await
                .map_err(|_| ProbeFailure::Error)?;
            scan.feed(&utcs);
        }
        Ok(scan)
    })
    .await
    .map_err(|_| ProbeFailure::Timeout)??;

    scan.verdict()
}
