//! Secondary schedule source: the event-tracker API.
//!
//! Used when the season index is unreachable. The endpoint sits behind a
//! rotating API key; base URL, endpoint paths and key are re-scraped from a
//! public manifest page whenever the API answers 401/403, then the original
//! request is retried once.

use chrono::Duration;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, info, warn};

use super::{to_utc, ScheduleResult, ScheduleSource, ScheduleSourceKind};
use crate::jsonstream;
use crate::types::SessionWindow;

/// Static defaults; superseded by scraped values at runtime.
#[derive(Debug, Clone)]
pub struct EventTrackerConfig {
    pub enabled: bool,
    pub base_url: String,
    pub endpoint: String,
    pub meeting_endpoint_prefix: String,
    pub api_key: String,
    pub locale: String,
    pub request_timeout: StdDuration,
    pub active_cache_ttl: StdDuration,
    pub idle_cache_ttl: StdDuration,
    pub env_refresh_ttl: StdDuration,
    pub env_source_url: String,
}

impl Default for EventTrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.formula1.com".to_string(),
            endpoint: "/v1/event-tracker".to_string(),
            meeting_endpoint_prefix: "/v1/event-tracker/meeting".to_string(),
            api_key: String::new(),
            locale: "en".to_string(),
            request_timeout: StdDuration::from_secs(10),
            active_cache_ttl: StdDuration::from_secs(60),
            idle_cache_ttl: StdDuration::from_secs(900),
            env_refresh_ttl: StdDuration::from_secs(3600),
            env_source_url: "https://www.formula1.com/en/timing/f1-live-lite".to_string(),
        }
    }
}

struct DynamicConfig {
    base_url: String,
    endpoint: String,
    meeting_endpoint_prefix: String,
    api_key: String,
}

struct EtState {
    dynamic: DynamicConfig,
    cache: Option<(Instant, ScheduleResult)>,
    last_env_refresh: Option<Instant>,
}

/// Schedule source backed by the event-tracker endpoints.
pub struct EventTrackerScheduleSource {
    client: reqwest::Client,
    config: EventTrackerConfig,
    state: Mutex<EtState>,
}

fn normalize_endpoint(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        "/".to_string()
    } else if value.starts_with('/') {
        value.to_string()
    } else {
        format!("/{value}")
    }
}

/// Pull a `"KEY":"value"` pair out of a scraped page. The value may appear
/// plain or JSON-escaped inside a script payload.
fn extract_env_value(text: &str, key: &str) -> Option<String> {
    let plain = (format!("{key}\":\""), "\"");
    let escaped = (format!("{key}\\\":\\\""), "\\\"");
    for (needle, terminator) in [plain, escaped] {
        let Some(pos) = text.find(&needle) else { continue };
        let rest = &text[pos + needle.len()..];
        let Some(end) = rest.find(terminator) else { continue };
        let value = rest[..end].replace("\\/", "/").trim().to_string();
        if !value.is_empty() {
            return Some(value);
        }
    }
    None
}

fn extract_meeting_key(payload: &Value) -> Option<i64> {
    let season = &payload["seasonContext"];
    let meeting = &payload["meetingContext"];
    [&season["currentOrNextMeetingKey"], &meeting["meetingKey"], &payload["fomRaceId"]]
        .into_iter()
        .find_map(jsonstream::as_i64)
}

fn extract_timetables(payload: &Value) -> Vec<&Value> {
    for candidate in [
        &payload["seasonContext"]["timetables"],
        &payload["event"]["timetables"],
        &payload["meetingContext"]["timetables"],
    ] {
        if let Some(rows) = candidate.as_array() {
            let rows: Vec<&Value> = rows.iter().filter(|row| row.is_object()).collect();
            if !rows.is_empty() {
                return rows;
            }
        }
    }
    Vec::new()
}

fn extract_meeting_name(payload: &Value) -> String {
    for candidate in [
        &payload["race"]["meetingOfficialName"],
        &payload["race"]["meetingName"],
        &payload["event"]["meetingOfficialName"],
        &payload["event"]["meetingName"],
    ] {
        if let Some(text) = jsonstream::as_text(candidate) {
            return text.to_string();
        }
    }
    "F1".to_string()
}

fn windows_from_payload(
    payload: &Value,
    pre_window: Duration,
    post_window: Duration,
    meeting_key: Option<i64>,
) -> Vec<SessionWindow> {
    let meeting_name = extract_meeting_name(payload);
    let meeting_key = meeting_key.or_else(|| extract_meeting_key(payload));
    let mut windows = Vec::new();
    for item in extract_timetables(payload) {
        let gmt_offset = item.get("gmtOffset").and_then(Value::as_str);
        let Some(start) = item
            .get("startTime")
            .and_then(Value::as_str)
            .and_then(|d| to_utc(d, gmt_offset))
        else {
            continue;
        };
        let end = item
            .get("endTime")
            .and_then(Value::as_str)
            .and_then(|d| to_utc(d, gmt_offset))
            .filter(|end| *end > start)
            .unwrap_or(start + Duration::hours(2));
        let session_name = [
            item.get("description"),
            item.get("shortName"),
            item.get("sessionType"),
            item.get("session"),
        ]
        .into_iter()
        .flatten()
        .find_map(jsonstream::as_text)
        .unwrap_or("Session")
        .to_string();

        windows.push(SessionWindow {
            meeting_name: meeting_name.clone(),
            session_name,
            // The tracker has no archive paths; metadata priming is skipped.
            path: String::new(),
            start_utc: start,
            end_utc: end,
            connect_at: start - pre_window,
            disconnect_at: end + post_window,
            meeting_key,
            session_key: item.get("meetingSessionKey").and_then(jsonstream::as_i64),
        });
    }
    windows.sort_by_key(|w| w.start_utc);
    windows
}

enum EndpointKind {
    Root,
    Meeting(i64),
}

impl EventTrackerScheduleSource {
    pub fn new(client: reqwest::Client, config: EventTrackerConfig) -> Self {
        let dynamic = DynamicConfig {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            endpoint: normalize_endpoint(&config.endpoint),
            meeting_endpoint_prefix: normalize_endpoint(&config.meeting_endpoint_prefix),
            api_key: config.api_key.trim().to_string(),
        };
        Self {
            client,
            config,
            state: Mutex::new(EtState { dynamic, cache: None, last_env_refresh: None }),
        }
    }

    fn meeting_endpoint(prefix: &str, meeting_key: i64) -> String {
        if prefix.contains("{meeting_key}") {
            prefix.replace("{meeting_key}", &meeting_key.to_string())
        } else if prefix.ends_with('/') {
            format!("{prefix}{meeting_key}")
        } else {
            format!("{prefix}/{meeting_key}")
        }
    }

    /// Re-scrape base URL, endpoints and API key from the manifest page.
    /// Rate limited by `env_refresh_ttl` unless forced.
    async fn refresh_dynamic_config(&self, force: bool) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let fresh = state
                .last_env_refresh
                .map(|at| at.elapsed() < self.config.env_refresh_ttl)
                .unwrap_or(false);
            if !force && fresh {
                return;
            }
            state.last_env_refresh = Some(Instant::now());
        }
        if self.config.env_source_url.is_empty() {
            return;
        }
        let text = match self
            .client
            .get(&self.config.env_source_url)
            .timeout(self.config.request_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(text) => text,
                Err(_) => return,
            },
            _ => return,
        };

        let base_url = extract_env_value(&text, "PUBLIC_GLOBAL_APIGEE_BASEURL");
        let endpoint = extract_env_value(&text, "PUBLIC_GLOBAL_EVENTTRACKER_ENDPOINT");
        let meeting_prefix =
            extract_env_value(&text, "PUBLIC_GLOBAL_EVENTTRACKER_MEETINGENDPOINT");
        let api_key = extract_env_value(&text, "PUBLIC_GLOBAL_EVENTTRACKER_APIKEY");

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = false;
        if let Some(base_url) = base_url {
            state.dynamic.base_url = base_url.trim_end_matches('/').to_string();
            updated = true;
        }
        if let Some(endpoint) = endpoint {
            state.dynamic.endpoint = normalize_endpoint(&endpoint);
            updated = true;
        }
        if let Some(meeting_prefix) = meeting_prefix {
            state.dynamic.meeting_endpoint_prefix = normalize_endpoint(&meeting_prefix);
            updated = true;
        }
        if let Some(api_key) = api_key {
            state.dynamic.api_key = api_key;
            updated = true;
        }
        if updated {
            info!("event-tracker configuration refreshed from manifest");
        }
    }

    fn snapshot_dynamic(&self) -> (String, String, String, String) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (
            state.dynamic.base_url.clone(),
            state.dynamic.endpoint.clone(),
            state.dynamic.meeting_endpoint_prefix.clone(),
            state.dynamic.api_key.clone(),
        )
    }

    async fn fetch_tracker_json(&self, kind: EndpointKind) -> Result<Value, String> {
        let mut allow_retry = true;
        loop {
            let (base_url, endpoint, meeting_prefix, api_key) = self.snapshot_dynamic();
            let endpoint = match &kind {
                EndpointKind::Root => endpoint,
                EndpointKind::Meeting(key) => Self::meeting_endpoint(&meeting_prefix, *key),
            };
            let url = format!("{base_url}{endpoint}");
            let response = self
                .client
                .get(&url)
                .header("apiKey", api_key)
                .header("locale", self.config.locale.as_str())
                .timeout(self.config.request_timeout)
                .send()
                .await
                .map_err(|e| format!("{url}: {e}"))?;
            let status = response.status().as_u16();
            if status != 200 {
                if allow_retry && (status == 401 || status == 403) {
                    // Key rotated out from under us: refresh once and retry.
                    debug!(url, status, "event-tracker auth drift; refreshing config");
                    allow_retry = false;
                    self.refresh_dynamic_config(true).await;
                    continue;
                }
                return Err(format!("{url}: HTTP {status}"));
            }
            let text = response.text().await.map_err(|e| format!("{url}: {e}"))?;
            let payload: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))
                .map_err(|e| format!("{url}: {e}"))?;
            if !payload.is_object() {
                return Err(format!("{url}: payload is not an object"));
            }
            return Ok(payload);
        }
    }
}

#[async_trait::async_trait]
impl ScheduleSource for EventTrackerScheduleSource {
    async fn fetch_windows(
        &self,
        pre_window: Duration,
        post_window: Duration,
        active: bool,
    ) -> ScheduleResult {
        if !self.config.enabled {
            let mut result = ScheduleResult::empty(ScheduleSourceKind::EventTracker);
            result.last_error = Some("fallback-disabled".to_string());
            return result;
        }

        if let Some((expires, cached)) =
            &self.state.lock().unwrap_or_else(|e| e.into_inner()).cache
        {
            if *expires > Instant::now() {
                return cached.clone();
            }
        }

        let ttl =
            if active { self.config.active_cache_ttl } else { self.config.idle_cache_ttl };
        self.refresh_dynamic_config(false).await;

        let mut errors: Vec<String> = Vec::new();
        let mut windows = Vec::new();
        let mut meeting_key = None;

        match self.fetch_tracker_json(EndpointKind::Root).await {
            Ok(payload) => {
                meeting_key = extract_meeting_key(&payload);
                windows = windows_from_payload(&payload, pre_window, post_window, meeting_key);
            }
            Err(err) => {
                warn!(%err, "event-tracker root fetch failed");
                errors.push(format!("root:{err}"));
            }
        }

        if windows.is_empty() {
            if let Some(key) = meeting_key {
                match self.fetch_tracker_json(EndpointKind::Meeting(key)).await {
                    Ok(payload) => {
                        windows =
                            windows_from_payload(&payload, pre_window, post_window, Some(key));
                    }
                    Err(err) => errors.push(format!("meeting:{err}")),
                }
            }
        }

        let result = ScheduleResult {
            windows,
            source: ScheduleSourceKind::EventTracker,
            http_status: None,
            last_error: if errors.is_empty() { None } else { Some(errors.join("; ")) },
        };
        self.state.lock().unwrap_or_else(|e| e.into_inner()).cache =
            Some((Instant::now() + ttl, result.clone()));
        result
    }
}
