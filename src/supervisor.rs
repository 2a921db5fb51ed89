//! Live session supervisor: decides when the bus connects and disconnects.
//!
//! One state machine: Idle -> Waiting(window) -> Armed(window) -> Closed ->
//! Idle. Windows come from the primary (season index) schedule source with
//! an event-tracker fallback; while running from the fallback the primary is
//! probed for recovery once a minute.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::availability::LiveAvailability;
use crate::bus::{LiveBus, HEARTBEAT_DRAIN};
use crate::config::{EngineConfig, OperationMode};
use crate::error::Result;
use crate::http::CachedClient;
use crate::jsonstream;
use crate::normalize::session;
use crate::schedule::{ScheduleResult, ScheduleSource, ScheduleSourceKind};
use crate::transport::TransportFactory;
use crate::types::{SessionWindow, StreamId};

/// Idle schedule poll cadence.
const IDLE_REFRESH: Duration = Duration::from_secs(15 * 60);
/// Minimum sleep before re-checking an upcoming connect time.
const MIN_CONNECT_WAIT: Duration = Duration::from_secs(30);
/// Ceiling on post-window extensions while the feed stays active.
const POST_WINDOW_EXTENSION_CAP: ChronoDuration = ChronoDuration::minutes(30);
const POST_WINDOW_EXTENSION_STEP: ChronoDuration = ChronoDuration::minutes(5);
/// Re-opened window length when the archive still reports an active session.
const FALLBACK_WINDOW_DURATION: ChronoDuration = ChronoDuration::minutes(20);
/// Primary recovery probe cadence while on the fallback source.
const PRIMARY_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);
/// Archive session-finished poll cadence while armed.
const SESSION_FINISH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// TTL for SessionStatus archive probes.
const STATUS_PROBE_TTL: Duration = Duration::from_secs(10);

struct SupState {
    current_window: Option<SessionWindow>,
    window_source: ScheduleSourceKind,
    schedule_source: ScheduleSourceKind,
    index_http_status: Option<u16>,
    fallback_active: bool,
    last_error: Option<String>,
    last_recovery_check: Option<Instant>,
}

struct Inner {
    bus: Arc<LiveBus>,
    availability: Arc<LiveAvailability>,
    http: Arc<CachedClient>,
    primary: Arc<dyn ScheduleSource>,
    secondary: Option<Arc<dyn ScheduleSource>>,
    live_factory: TransportFactory,
    static_base: String,
    pre_window: ChronoDuration,
    post_window: ChronoDuration,
    active_refresh: Duration,
    operation_mode: OperationMode,
    state: Mutex<SupState>,
    window_tx: watch::Sender<Option<SessionWindow>>,
}

/// Coordinates when the live connection runs.
pub struct LiveSupervisor {
    inner: Arc<Inner>,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LiveSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<LiveBus>,
        availability: Arc<LiveAvailability>,
        http: Arc<CachedClient>,
        primary: Arc<dyn ScheduleSource>,
        secondary: Option<Arc<dyn ScheduleSource>>,
        live_factory: TransportFactory,
        config: &EngineConfig,
    ) -> Self {
        let (window_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                bus,
                availability,
                http,
                primary,
                secondary,
                live_factory,
                static_base: config.static_base.clone(),
                pre_window: crate::schedule::DEFAULT_PRE_WINDOW,
                post_window: crate::schedule::DEFAULT_POST_WINDOW,
                active_refresh: Duration::from_secs(config.fast_poll_seconds.max(5)),
                operation_mode: config.operation_mode,
                state: Mutex::new(SupState {
                    current_window: None,
                    window_source: ScheduleSourceKind::None,
                    schedule_source: ScheduleSourceKind::None,
                    index_http_status: None,
                    fallback_active: false,
                    last_error: None,
                    last_recovery_check: None,
                }),
                window_tx,
            }),
            run: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, task)) = run.as_ref() {
            if !task.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(runner(inner, cancel.clone()));
        *run = Some((cancel, task));
    }

    pub async fn close(&self) {
        let handle = {
            let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
            run.take()
        };
        if let Some((cancel, task)) = handle {
            cancel.cancel();
            let _ = task.await;
        }
        self.inner.bus.close().await;
    }

    /// Immutable snapshot of the active window, if armed.
    pub fn current_window(&self) -> Option<SessionWindow> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).current_window.clone()
    }

    /// Watch receiver publishing the active window; the session clock
    /// follows it for practice totals.
    pub fn window_watch(&self) -> watch::Receiver<Option<SessionWindow>> {
        self.inner.window_tx.subscribe()
    }

    /// Which source produced the active window.
    pub fn current_window_source(&self) -> ScheduleSourceKind {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).window_source
    }

    pub fn schedule_source(&self) -> ScheduleSourceKind {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).schedule_source
    }

    pub fn fallback_active(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).fallback_active
    }

    pub fn index_http_status(&self) -> Option<u16> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).index_http_status
    }

    pub fn last_schedule_error(&self) -> Option<String> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).last_error.clone()
    }
}

async fn runner(inner: Arc<Inner>, cancel: CancellationToken) {
    if inner.operation_mode == OperationMode::Development {
        // Development runs from replay; the live transport never arms.
        inner.availability.set_state(false, "development-mode");
        cancel.cancelled().await;
        return;
    }
    while !cancel.is_cancelled() {
        let resolved = resolve_window(&inner).await;
        let Some((window, source)) = resolved else {
            inner.availability.set_state(false, "no-session-found");
            if !sleep_cancellable(&cancel, IDLE_REFRESH).await {
                break;
            }
            continue;
        };
        let now = Utc::now();
        if now < window.connect_at {
            let until_connect = (window.connect_at - now)
                .to_std()
                .unwrap_or(MIN_CONNECT_WAIT)
                .clamp(MIN_CONNECT_WAIT, IDLE_REFRESH);
            debug!(
                window = %window.label(),
                wait_s = until_connect.as_secs(),
                "next session window not yet open"
            );
            inner
                .availability
                .set_state(false, &format!("waiting-{}", window.session_name));
            if !sleep_cancellable(&cancel, until_connect).await {
                break;
            }
            continue;
        }
        activate_window(&inner, &cancel, window, source).await;
    }
    debug!("supervisor runner ended");
}

async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn record_primary_result(inner: &Inner, result: &ScheduleResult) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    state.index_http_status = result.http_status;
    if let Some(error) = &result.last_error {
        state.last_error = Some(error.clone());
    }
}

fn set_schedule_state(inner: &Inner, source: ScheduleSourceKind, fallback_active: bool) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.schedule_source != source {
        info!(source = source.as_str(), "schedule source selected");
    }
    state.schedule_source = source;
    state.fallback_active = fallback_active;
}

async fn resolve_window(inner: &Inner) -> Option<(SessionWindow, ScheduleSourceKind)> {
    let primary =
        inner.primary.fetch_windows(inner.pre_window, inner.post_window, false).await;
    record_primary_result(inner, &primary);

    if let Some(window) = select_window(inner, &primary.windows, ScheduleSourceKind::Index).await
    {
        set_schedule_state(inner, ScheduleSourceKind::Index, false);
        return Some((window, ScheduleSourceKind::Index));
    }

    let index_unavailable = primary.last_error.is_some()
        || primary.http_status.map(|s| s != 200).unwrap_or(true)
        || primary.windows.is_empty();
    if !index_unavailable {
        // The index is healthy, there is just nothing upcoming.
        set_schedule_state(inner, ScheduleSourceKind::None, false);
        return None;
    }

    let Some(secondary) = &inner.secondary else {
        set_schedule_state(inner, ScheduleSourceKind::None, false);
        return None;
    };
    let active = inner.state.lock().unwrap_or_else(|e| e.into_inner()).fallback_active;
    let fallback = secondary.fetch_windows(inner.pre_window, inner.post_window, active).await;
    if let Some(error) = &fallback.last_error {
        inner.state.lock().unwrap_or_else(|e| e.into_inner()).last_error = Some(error.clone());
    }
    if let Some(window) =
        select_window(inner, &fallback.windows, ScheduleSourceKind::EventTracker).await
    {
        set_schedule_state(inner, ScheduleSourceKind::EventTracker, true);
        return Some((window, ScheduleSourceKind::EventTracker));
    }
    set_schedule_state(inner, ScheduleSourceKind::None, false);
    None
}

/// Pick the first window whose disconnect time has not passed. When the
/// index schedule is exhausted but its last session still reports active,
/// re-open that window for a short fallback period.
async fn select_window(
    inner: &Inner,
    windows: &[SessionWindow],
    source: ScheduleSourceKind,
) -> Option<SessionWindow> {
    let now = Utc::now();
    if let Some(window) = windows.iter().find(|w| now <= w.disconnect_at) {
        return Some(window.clone());
    }
    let last = windows.last()?;
    if source == ScheduleSourceKind::Index
        && !last.path.is_empty()
        && session_active(inner, last).await
    {
        let mut extended = last.clone();
        extended.connect_at = extended.connect_at.min(now - ChronoDuration::minutes(5));
        extended.disconnect_at = now + FALLBACK_WINDOW_DURATION;
        info!(
            window = %extended.label(),
            disconnect_at = %extended.disconnect_at,
            "re-opening past window; archive still reports an active session"
        );
        return Some(extended);
    }
    None
}

/// Latest object in a `.jsonStream` archive file, fetched through the cache.
async fn fetch_last_stream_object(
    inner: &Inner,
    window: &SessionWindow,
    stream: StreamId,
) -> Result<Option<serde_json::Value>> {
    let url = format!(
        "{}/{}/{}.jsonStream",
        inner.static_base,
        window.path.trim_matches('/'),
        stream.as_str()
    );
    let text = inner.http.fetch_text(&url, &[], STATUS_PROBE_TTL).await?;
    Ok(text.lines().rev().find_map(|line| jsonstream::parse_line(line).map(|(_, v)| v)))
}

/// Whether the archive reports this window's session as still running.
/// Network failures close to the session keep the optimistic answer.
async fn session_active(inner: &Inner, window: &SessionWindow) -> bool {
    match fetch_last_stream_object(inner, window, StreamId::SessionStatus).await {
        Ok(Some(payload)) => {
            let finished = session::session_status(&payload)
                .map(|s| session::is_session_end(&s))
                .unwrap_or(false);
            !finished
        }
        Ok(None) => false,
        Err(err) => {
            let slack = window.end_utc + ChronoDuration::hours(2);
            if Utc::now() <= slack {
                warn!(%err, window = %window.label(), "SessionStatus probe failed; assuming active");
                true
            } else {
                false
            }
        }
    }
}

async fn session_finished(inner: &Inner, window: &SessionWindow) -> bool {
    match fetch_last_stream_object(inner, window, StreamId::SessionStatus).await {
        Ok(Some(payload)) => session::session_status(&payload)
            .map(|s| session::is_session_end(&s))
            .unwrap_or(false),
        _ => false,
    }
}

/// Prime archive metadata so consumers have session identity before the
/// first push frame arrives.
async fn prime_metadata(inner: &Inner, window: &SessionWindow) {
    for stream in [StreamId::SessionInfo, StreamId::SessionStatus, StreamId::SessionData] {
        match fetch_last_stream_object(inner, window, stream).await {
            Ok(Some(payload)) => {
                debug!(window = %window.label(), stream = stream.as_str(), "metadata primed");
                inner.bus.inject_message(stream, &payload);
            }
            Ok(None) => {}
            Err(err) => {
                debug!(window = %window.label(), stream = stream.as_str(), %err, "metadata priming failed");
            }
        }
    }
}

async fn activate_window(
    inner: &Inner,
    cancel: &CancellationToken,
    window: SessionWindow,
    source: ScheduleSourceKind,
) {
    let label = window.label();
    info!(
        window = %label,
        source = source.as_str(),
        connect_at = %window.connect_at,
        disconnect_at = %window.disconnect_at,
        "arming live timing"
    );
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.current_window = Some(window.clone());
        state.window_source = source;
    }
    inner.window_tx.send_replace(Some(window.clone()));

    inner.bus.set_transport_factory(Some(Arc::clone(&inner.live_factory)));
    inner.bus.start();
    inner.bus.set_heartbeat_expectation(true);
    inner.availability.set_state(true, &format!("live-{}", window.session_name));
    if !window.path.is_empty() {
        prime_metadata(inner, &window).await;
    } else {
        debug!(window = %label, "no archive path; skipping metadata priming");
    }

    let reason = monitor_window(inner, cancel, window.clone(), source).await;

    inner.bus.set_heartbeat_expectation(false);
    inner.bus.close().await;
    inner.availability.set_state(false, &format!("finished-{}", window.session_name));
    info!(window = %label, reason, "live timing closed");
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.current_window = None;
        state.window_source = ScheduleSourceKind::None;
    }
    inner.window_tx.send_replace(None);
}

async fn monitor_window(
    inner: &Inner,
    cancel: &CancellationToken,
    mut window: SessionWindow,
    source: ScheduleSourceKind,
) -> &'static str {
    let max_disconnect_at = if source == ScheduleSourceKind::Index {
        window.disconnect_at + POST_WINDOW_EXTENSION_CAP
    } else {
        window.disconnect_at
    };
    let mut last_finish_check = Instant::now();

    loop {
        if !sleep_cancellable(cancel, inner.active_refresh).await {
            return "cancelled";
        }
        let now = Utc::now();
        let heartbeat_age = inner.bus.last_heartbeat_age();
        let activity_age = inner.bus.last_stream_activity_age(StreamId::LIVE_ACTIVITY);

        if now >= window.disconnect_at {
            let feed_alive = fresh(heartbeat_age) || fresh(activity_age);
            if source == ScheduleSourceKind::Index
                && window.disconnect_at < max_disconnect_at
                && feed_alive
            {
                let extension =
                    POST_WINDOW_EXTENSION_STEP.min(max_disconnect_at - window.disconnect_at);
                window.disconnect_at += extension;
                info!(
                    window = %window.label(),
                    disconnect_at = %window.disconnect_at,
                    "extending disconnect window; feed still active"
                );
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.current_window = Some(window.clone());
                continue;
            }
            return "disconnect-window-expired";
        }

        if let Some(age) = heartbeat_age {
            if age > HEARTBEAT_DRAIN {
                info!(age_s = age.as_secs(), "heartbeat drained; assuming feed idle");
                return "heartbeat-timeout";
            }
        }

        if !inner.bus.is_running() {
            // A replay transport that completed, or a factory that gave up.
            return "bus-stopped";
        }

        if !window.path.is_empty()
            && last_finish_check.elapsed() >= SESSION_FINISH_CHECK_INTERVAL
        {
            last_finish_check = Instant::now();
            if session_finished(inner, &window).await {
                return "session-finished";
            }
        }

        if source == ScheduleSourceKind::EventTracker {
            let due = {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                let due = state
                    .last_recovery_check
                    .map(|at| at.elapsed() >= PRIMARY_RECOVERY_INTERVAL)
                    .unwrap_or(true);
                if due {
                    state.last_recovery_check = Some(Instant::now());
                }
                due
            };
            if due {
                let primary = inner
                    .primary
                    .fetch_windows(inner.pre_window, inner.post_window, false)
                    .await;
                record_primary_result(inner, &primary);
                if select_window(inner, &primary.windows, ScheduleSourceKind::Index)
                    .await
                    .is_some()
                {
                    info!("primary schedule source recovered; re-arming");
                    return "primary-source-recovered";
                }
            }
        }
    }
}

fn fresh(age: Option<Duration>) -> bool {
    age.map(|a| a <= HEARTBEAT_DRAIN).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportEvent};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeSource {
        healthy: Arc<AtomicBool>,
        status_when_down: u16,
        windows: Mutex<Vec<SessionWindow>>,
        kind: ScheduleSourceKind,
    }

    #[async_trait::async_trait]
    impl ScheduleSource for FakeSource {
        async fn fetch_windows(
            &self,
            _pre: ChronoDuration,
            _post: ChronoDuration,
            _active: bool,
        ) -> ScheduleResult {
            if self.healthy.load(Ordering::SeqCst) {
                ScheduleResult {
                    windows: self.windows.lock().unwrap().clone(),
                    source: self.kind,
                    http_status: Some(200),
                    last_error: None,
                }
            } else {
                ScheduleResult {
                    windows: Vec::new(),
                    source: self.kind,
                    http_status: Some(self.status_when_down),
                    last_error: Some(format!("HTTP {}", self.status_when_down)),
                }
            }
        }
    }

    fn window_at(offset_minutes: i64, name: &str) -> SessionWindow {
        let start = Utc::now() + ChronoDuration::minutes(offset_minutes);
        let end = start + ChronoDuration::hours(2);
        SessionWindow {
            meeting_name: "Test GP".into(),
            session_name: name.into(),
            path: String::new(),
            start_utc: start,
            end_utc: end,
            connect_at: start - ChronoDuration::minutes(60),
            disconnect_at: end + ChronoDuration::minutes(15),
            meeting_key: Some(1),
            session_key: Some(2),
        }
    }

    struct PendingTransport;

    #[async_trait::async_trait]
    impl Transport for PendingTransport {
        async fn ensure_connection(&mut self) -> Result<()> {
            Ok(())
        }
        async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
        async fn close(&mut self) {}
    }

    fn pending_factory() -> TransportFactory {
        Arc::new(|| Ok(Box::new(PendingTransport) as Box<dyn Transport>))
    }

    fn supervisor_with(
        primary: Arc<FakeSource>,
        secondary: Option<Arc<FakeSource>>,
    ) -> LiveSupervisor {
        let config = EngineConfig::default();
        LiveSupervisor::new(
            Arc::new(LiveBus::new()),
            Arc::new(LiveAvailability::new()),
            Arc::new(CachedClient::new(reqwest::Client::new(), None)),
            primary as Arc<dyn ScheduleSource>,
            secondary.map(|s| s as Arc<dyn ScheduleSource>),
            pending_factory(),
            &config,
        )
    }

    fn primary_source(healthy: bool, windows: Vec<SessionWindow>) -> Arc<FakeSource> {
        Arc::new(FakeSource {
            healthy: Arc::new(AtomicBool::new(healthy)),
            status_when_down: 403,
            windows: Mutex::new(windows),
            kind: ScheduleSourceKind::Index,
        })
    }

    fn secondary_source(windows: Vec<SessionWindow>) -> Arc<FakeSource> {
        Arc::new(FakeSource {
            healthy: Arc::new(AtomicBool::new(true)),
            status_when_down: 500,
            windows: Mutex::new(windows),
            kind: ScheduleSourceKind::EventTracker,
        })
    }

    #[tokio::test]
    async fn prefers_primary_when_it_has_windows() {
        let primary = primary_source(true, vec![window_at(90, "Qualifying")]);
        let secondary = secondary_source(vec![window_at(30, "ShouldNotWin")]);
        let supervisor = supervisor_with(primary, Some(secondary));

        let (window, source) = resolve_window(&supervisor.inner).await.unwrap();
        assert_eq!(source, ScheduleSourceKind::Index);
        assert_eq!(window.session_name, "Qualifying");
        assert_eq!(supervisor.schedule_source(), ScheduleSourceKind::Index);
        assert!(!supervisor.fallback_active());
    }

    #[tokio::test]
    async fn falls_back_to_event_tracker_on_primary_403() {
        let primary = primary_source(false, Vec::new());
        let secondary = secondary_source(vec![window_at(30, "Race")]);
        let supervisor = supervisor_with(primary, Some(secondary));

        let (window, source) = resolve_window(&supervisor.inner).await.unwrap();
        assert_eq!(source, ScheduleSourceKind::EventTracker);
        assert_eq!(window.session_name, "Race");
        assert_eq!(supervisor.schedule_source(), ScheduleSourceKind::EventTracker);
        assert!(supervisor.fallback_active());
        assert_eq!(supervisor.index_http_status(), Some(403));
    }

    #[tokio::test]
    async fn fails_closed_when_both_sources_are_empty() {
        let primary = primary_source(false, Vec::new());
        let secondary = secondary_source(Vec::new());
        let supervisor = supervisor_with(primary, Some(secondary));

        assert!(resolve_window(&supervisor.inner).await.is_none());
        assert_eq!(supervisor.schedule_source(), ScheduleSourceKind::None);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_to_primary_mid_window() {
        let primary_health = Arc::new(AtomicBool::new(false));
        let primary = Arc::new(FakeSource {
            healthy: Arc::clone(&primary_health),
            status_when_down: 403,
            windows: Mutex::new(vec![window_at(30, "Race")]),
            kind: ScheduleSourceKind::Index,
        });
        // Secondary window is already open so the supervisor arms now.
        let secondary = secondary_source(vec![window_at(30, "Race")]);
        let supervisor = supervisor_with(primary, Some(secondary));
        let availability = Arc::clone(&supervisor.inner.availability);

        supervisor.start();
        tokio::time::timeout(Duration::from_secs(600), async {
            while !availability.is_live() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("supervisor never armed from fallback");
        assert_eq!(supervisor.schedule_source(), ScheduleSourceKind::EventTracker);
        assert!(availability.snapshot().reason.starts_with("live-"));

        // Primary comes back: the recovery probe ends the fallback
        // activation and the supervisor re-arms from the index window.
        primary_health.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(600), async {
            while supervisor.schedule_source() != ScheduleSourceKind::Index {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("supervisor never recovered to the primary source");

        supervisor.close().await;
    }

    #[tokio::test]
    async fn development_mode_never_arms() {
        let mut config = EngineConfig::default();
        config.operation_mode = OperationMode::Development;
        let primary = primary_source(true, vec![window_at(-30, "Race")]);
        let supervisor = LiveSupervisor::new(
            Arc::new(LiveBus::new()),
            Arc::new(LiveAvailability::new()),
            Arc::new(CachedClient::new(reqwest::Client::new(), None)),
            primary as Arc<dyn ScheduleSource>,
            None,
            pending_factory(),
            &config,
        );
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = supervisor.inner.availability.snapshot();
        assert!(!snapshot.is_live);
        assert_eq!(snapshot.reason, "development-mode");
        supervisor.close().await;
    }
}
