//! Cached HTTP helpers: TTL caching, in-flight coalescing, rate-limit
//! back-off and an on-disk persistence layer.
//!
//! Intended for the static archive, schedule endpoints and the REST mirror;
//! the live WebSocket never goes through here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{Result, TimingError};

/// Default wall-clock timeout for JSON endpoints.
pub const JSON_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for scraped HTML pages.
pub const TEXT_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout for full archive stream downloads.
pub const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// 429 retry schedule: 1 s, 2 s, 4 s.
const RATE_LIMIT_ATTEMPTS: u32 = 3;

const SAVE_DEBOUNCE: Duration = Duration::from_millis(100);

struct CacheEntry {
    expires: Instant,
    value: Value,
}

struct State {
    entries: HashMap<String, CacheEntry>,
    /// Completion signals for requests currently on the wire, keyed like the
    /// cache. Followers await the signal and re-check the cache.
    inflight: HashMap<String, watch::Receiver<bool>>,
    /// Persisted `key -> {data, saved_at}` map mirrored to disk.
    persisted: serde_json::Map<String, Value>,
}

/// HTTP client wrapper with TTL caching and request coalescing.
pub struct CachedClient {
    client: reqwest::Client,
    state: Arc<Mutex<State>>,
    disk_path: Option<PathBuf>,
    save_pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Stable cache key: URL plus sorted query parameters.
fn cache_key(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort();
    let query: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{url}?{}", query.join("&"))
}

enum Role {
    Leader(watch::Sender<bool>),
    Follower(watch::Receiver<bool>),
}

impl CachedClient {
    pub fn new(client: reqwest::Client, disk_path: Option<PathBuf>) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                persisted: serde_json::Map::new(),
            })),
            disk_path,
            save_pending: Mutex::new(None),
        }
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Load the persisted map from disk. Unreadable files start empty.
    pub async fn load_persisted(&self) {
        let Some(path) = &self.disk_path else { return };
        match tokio::fs::read_to_string(path).await {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => {
                    debug!(entries = map.len(), "loaded persisted http cache");
                    self.state.lock().unwrap_or_else(|e| e.into_inner()).persisted = map;
                }
                _ => warn!(path = %path.display(), "persisted http cache unreadable"),
            },
            Err(_) => {}
        }
    }

    /// Fetch parsed JSON with TTL caching and in-flight coalescing.
    ///
    /// Concurrent calls for the same key issue exactly one outbound request;
    /// followers wait for the leader and read the cache. HTTP 429 retries up
    /// to three times with exponential back-off.
    pub async fn fetch_json(
        &self,
        url: &str,
        params: &[(&str, &str)],
        ttl: Duration,
    ) -> Result<Value> {
        let key = cache_key(url, params);
        loop {
            let role = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = state.entries.get(&key) {
                    if entry.expires > Instant::now() {
                        trace!(key, "http cache hit");
                        return Ok(entry.value.clone());
                    }
                }
                match state.inflight.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        state.inflight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };
            match role {
                Role::Follower(mut rx) => {
                    trace!(key, "coalescing onto in-flight request");
                    // Wakes when the leader finishes (or is dropped); either
                    // way, loop and re-evaluate the cache.
                    let _ = rx.changed().await;
                }
                Role::Leader(tx) => {
                    let result = self.fetch_json_uncached(url, params, JSON_TIMEOUT).await;
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.inflight.remove(&key);
                        if let Ok(value) = &result {
                            state.entries.insert(
                                key.clone(),
                                CacheEntry { expires: Instant::now() + ttl, value: value.clone() },
                            );
                            state.persisted.insert(
                                key.clone(),
                                json!({ "data": value, "saved_at": unix_now() }),
                            );
                        }
                    }
                    if result.is_ok() {
                        self.schedule_save();
                    }
                    let _ = tx.send(true);
                    return result;
                }
            }
        }
    }

    /// Fetch raw text with the same caching and coalescing, under a
    /// `text::`-prefixed key.
    pub async fn fetch_text(
        &self,
        url: &str,
        params: &[(&str, &str)],
        ttl: Duration,
    ) -> Result<String> {
        let key = format!("text::{}", cache_key(url, params));
        loop {
            let role = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = state.entries.get(&key) {
                    if entry.expires > Instant::now() {
                        if let Some(text) = entry.value.as_str() {
                            return Ok(text.to_string());
                        }
                    }
                }
                match state.inflight.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        state.inflight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };
            match role {
                Role::Follower(mut rx) => {
                    let _ = rx.changed().await;
                }
                Role::Leader(tx) => {
                    let result = self.fetch_text_uncached(url, params, TEXT_TIMEOUT).await;
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.inflight.remove(&key);
                        if let Ok(text) = &result {
                            state.entries.insert(
                                key.clone(),
                                CacheEntry {
                                    expires: Instant::now() + ttl,
                                    value: Value::String(text.clone()),
                                },
                            );
                            state.persisted.insert(
                                key.clone(),
                                json!({ "data": text, "saved_at": unix_now() }),
                            );
                        }
                    }
                    if result.is_ok() {
                        self.schedule_save();
                    }
                    let _ = tx.send(true);
                    return result;
                }
            }
        }
    }

    async fn fetch_json_uncached(
        &self,
        url: &str,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value> {
        let text = self.get_with_retry(url, params, timeout).await?;
        let trimmed = text.trim_start_matches('\u{feff}');
        serde_json::from_str(trimmed)
            .map_err(|e| TimingError::parse_error(url.to_string(), e.to_string()))
    }

    async fn fetch_text_uncached(
        &self,
        url: &str,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String> {
        self.get_with_retry(url, params, timeout).await
    }

    async fn get_with_retry(
        &self,
        url: &str,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .get(url)
                .query(params)
                .timeout(timeout)
                .send()
                .await?;
            let status = response.status().as_u16();
            if status == 429 && attempt < RATE_LIMIT_ATTEMPTS {
                let backoff = Duration::from_secs(1 << (attempt - 1));
                warn!(url, attempt, ?backoff, "rate limited; backing off");
                tokio::time::sleep(backoff).await;
                continue;
            }
            if !(200..300).contains(&status) {
                return Err(TimingError::status_error(url, status));
            }
            return Ok(response.text().await?);
        }
    }

    /// Fetch an Ergast-style paginated collection until the race list covers
    /// `MRData.total`.
    pub async fn fetch_paginated_races(&self, url: &str, ttl: Duration) -> Result<Vec<Value>> {
        let mut races: Vec<Value> = Vec::new();
        loop {
            let offset_s = races.len().to_string();
            let page = self
                .fetch_json(url, &[("limit", "100"), ("offset", offset_s.as_str())], ttl)
                .await?;
            let mrdata = &page["MRData"];
            let total: usize = mrdata["total"]
                .as_str()
                .and_then(|t| t.parse().ok())
                .or_else(|| mrdata["total"].as_u64().map(|t| t as usize))
                .ok_or_else(|| TimingError::parse_error(url.to_string(), "MRData.total missing"))?;
            let page_races = mrdata["RaceTable"]["Races"].as_array().cloned().unwrap_or_default();
            let got = page_races.len();
            races.extend(page_races);
            if races.len() >= total || got == 0 {
                races.truncate(total);
                return Ok(races);
            }
        }
    }

    /// Debounced persistence of the on-disk map.
    fn schedule_save(&self) {
        let Some(path) = self.disk_path.clone() else { return };
        let mut pending = self.save_pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = pending.as_ref() {
            if !task.is_finished() {
                return;
            }
        }
        let state = Arc::clone(&self.state);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            let body = {
                let state = state.lock().unwrap_or_else(|e| e.into_inner());
                Value::Object(state.persisted.clone()).to_string()
            };
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(err) = tokio::fs::write(&path, body).await {
                warn!(path = %path.display(), %err, "failed persisting http cache");
            }
        }));
    }

    /// A previously persisted value, if any. Startup consumers use this to
    /// render last-known data before the network is up.
    pub fn persisted_value(&self, url: &str, params: &[(&str, &str)]) -> Option<Value> {
        let key = cache_key(url, params);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.persisted.get(&key).and_then(|entry| entry.get("data")).cloned()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 responder that counts requests.
    async fn spawn_server(body: &'static str, hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                // A small artificial delay keeps the request in flight long
                // enough for followers to coalesce onto it.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/data")
    }

    #[tokio::test]
    async fn concurrent_fetches_coalesce_into_one_request() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(r#"{"ok": true}"#, Arc::clone(&hits)).await;
        let client = Arc::new(CachedClient::new(reqwest::Client::new(), None));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            let url = url.clone();
            tasks.push(tokio::spawn(async move {
                client.fetch_json(&url, &[], Duration::from_secs(30)).await
            }));
        }
        for task in tasks {
            let value = task.await.unwrap().unwrap();
            assert_eq!(value["ok"], true);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_cache_serves_repeat_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(r#"{"n": 7}"#, Arc::clone(&hits)).await;
        let client = CachedClient::new(reqwest::Client::new(), None);

        for _ in 0..3 {
            let value = client.fetch_json(&url, &[], Duration::from_secs(30)).await.unwrap();
            assert_eq!(value["n"], 7);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persists_to_disk_and_reloads() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(r#"{"kept": 1}"#, Arc::clone(&hits)).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("http_cache").join("v1.json");

        let client = CachedClient::new(reqwest::Client::new(), Some(path.clone()));
        client.fetch_json(&url, &[], Duration::from_secs(30)).await.unwrap();
        // Wait out the debounce.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(path.exists());

        let reloaded = CachedClient::new(reqwest::Client::new(), Some(path));
        reloaded.load_persisted().await;
        let value = reloaded.persisted_value(&url, &[]).unwrap();
        assert_eq!(value["kept"], 1);
    }

    #[test]
    fn cache_key_sorts_params() {
        assert_eq!(
            cache_key("http://x/api", &[("b", "2"), ("a", "1")]),
            "http://x/api?a=1&b=2"
        );
        assert_eq!(cache_key("http://x/api", &[]), "http://x/api");
    }

    #[tokio::test]
    async fn paginated_fetch_covers_total() {
        // Serve a paginated MRData endpoint: total 5, page size honored via
        // the offset param.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let offset: usize = request
                    .split("offset=")
                    .nth(1)
                    .and_then(|rest| {
                        rest.split(|c: char| !c.is_ascii_digit()).next()?.parse().ok()
                    })
                    .unwrap_or(0);
                let races: Vec<Value> = (offset..(offset + 3).min(5))
                    .map(|i| json!({ "round": i.to_string() }))
                    .collect();
                let body = json!({
                    "MRData": {
                        "total": "5",
                        "RaceTable": { "Races": races }
                    }
                })
                .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        let client = CachedClient::new(reqwest::Client::new(), None);
        let races = client
            .fetch_paginated_races(&format!("http://{addr}/current.json"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(races.len(), 5);
    }
}
