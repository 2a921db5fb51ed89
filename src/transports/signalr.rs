//! SignalR transport for the live push feed.
//!
//! The legacy ASP.NET SignalR handshake: a GET to the negotiate endpoint
//! yields a connection token and a cookie, then the WebSocket connect reuses
//! both. The first frame sent is the hub Subscribe call listing every wanted
//! stream; the subscription is renewed every five minutes because the hub
//! group otherwise evicts idle members.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::config::LIVETIMING_BASE;
use crate::error::{Result, TimingError};
use crate::jsonstream;
use crate::transport::{Transport, TransportEvent};
use crate::types::StreamId;

const HUB_DATA: &str = r#"[{"name":"Streaming"}]"#;
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Empirical: the hub drops group members after ~20 minutes without a
/// Subscribe call.
const SUBSCRIBE_RENEWAL: Duration = Duration::from_secs(300);
/// Race-control backlog older than this at connect time is dropped.
const STARTUP_BACKLOG: chrono::Duration = chrono::Duration::seconds(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live transport speaking the F1 SignalR dialect.
pub struct SignalRTransport {
    client: reqwest::Client,
    ws: Option<WsStream>,
    pending: VecDeque<TransportEvent>,
    renewal: Option<tokio::time::Interval>,
    startup_cutoff: Option<DateTime<Utc>>,
}

impl SignalRTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, ws: None, pending: VecDeque::new(), renewal: None, startup_cutoff: None }
    }

    async fn negotiate(&self) -> Result<(String, Option<String>)> {
        let url = format!("{LIVETIMING_BASE}/signalr/negotiate");
        let response = self
            .client
            .get(&url)
            .query(&[("clientProtocol", "1.5"), ("connectionData", HUB_DATA)])
            .timeout(NEGOTIATE_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TimingError::status_error(url, status.as_u16()));
        }
        let cookie = response
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Value = response.json().await?;
        let token = body["ConnectionToken"]
            .as_str()
            .ok_or_else(|| TimingError::negotiate_error("response has no ConnectionToken"))?
            .to_string();
        Ok((token, cookie))
    }

    fn subscribe_frame() -> String {
        let streams: Vec<&str> = StreamId::SUBSCRIBED.iter().map(|s| s.as_str()).collect();
        json!({
            "H": "Streaming",
            "M": "Subscribe",
            "A": [streams],
            "I": 1,
        })
        .to_string()
    }

    async fn send_subscribe(&mut self) -> Result<()> {
        let ws = self
            .ws
            .as_mut()
            .ok_or_else(|| TimingError::transport_unavailable("websocket not connected"))?;
        ws.send(Message::text(Self::subscribe_frame())).await?;
        Ok(())
    }

    /// Decode one TEXT frame into zero or more events.
    fn decode_frame(&mut self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                trace!(%err, "skipping undecodable frame");
                return;
            }
        };
        // Initial snapshot: one payload per stream under "R".
        if let Some(snapshot) = payload.get("R").and_then(Value::as_object) {
            for (name, value) in snapshot {
                self.push_event(name, value.clone());
            }
        }
        // Message batch: hub "feed" calls with A = [stream, payload, utc].
        if let Some(batch) = payload.get("M").and_then(Value::as_array) {
            for hub_msg in batch {
                if hub_msg.get("M").and_then(Value::as_str) != Some("feed") {
                    continue;
                }
                let Some(args) = hub_msg.get("A").and_then(Value::as_array) else {
                    continue;
                };
                if args.len() < 2 {
                    continue;
                }
                if let Some(name) = args[0].as_str() {
                    self.push_event(name, args[1].clone());
                }
            }
        }
    }

    fn push_event(&mut self, name: &str, mut payload: Value) {
        let Some(stream) = StreamId::parse(name) else {
            trace!(stream = name, "ignoring unknown stream");
            return;
        };
        if stream == StreamId::RaceControlMessages {
            if let Some(cutoff) = self.startup_cutoff {
                drop_race_control_backlog(&mut payload, cutoff);
            }
        }
        self.pending.push_back(TransportEvent { stream, payload });
    }
}

/// Remove race-control entries that predate `cutoff` so a fresh connection
/// does not replay the whole session's message history into the pipeline.
/// Entries without a parseable timestamp are kept.
fn drop_race_control_backlog(payload: &mut Value, cutoff: DateTime<Utc>) {
    let is_stale = |entry: &Value| -> bool {
        entry
            .get("Utc")
            .and_then(Value::as_str)
            .and_then(jsonstream::parse_utc)
            .map(|utc| utc < cutoff)
            .unwrap_or(false)
    };
    match payload.get_mut("Messages") {
        Some(Value::Array(entries)) => entries.retain(|entry| !is_stale(entry)),
        Some(Value::Object(entries)) => entries.retain(|_, entry| !is_stale(entry)),
        _ => {}
    }
}

#[async_trait::async_trait]
impl Transport for SignalRTransport {
    async fn ensure_connection(&mut self) -> Result<()> {
        debug!("negotiating SignalR connection");
        let (token, cookie) = self.negotiate().await?;

        let mut url = reqwest::Url::parse(&format!(
            "{}/signalr/connect",
            LIVETIMING_BASE.replacen("https", "wss", 1)
        ))
        .map_err(|e| TimingError::negotiate_error(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("transport", "webSockets")
            .append_pair("clientProtocol", "1.5")
            .append_pair("connectionToken", &token)
            .append_pair("connectionData", HUB_DATA);

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("User-Agent", HeaderValue::from_static("BestHTTP"));
        headers.insert("Accept-Encoding", HeaderValue::from_static("gzip,identity"));
        if let Some(cookie) = cookie {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert("Cookie", value);
            }
        }

        let (ws, _response) = connect_async(request).await?;
        self.ws = Some(ws);
        self.send_subscribe().await?;

        let mut renewal =
            tokio::time::interval_at(tokio::time::Instant::now() + SUBSCRIBE_RENEWAL, SUBSCRIBE_RENEWAL);
        renewal.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.renewal = Some(renewal);
        self.startup_cutoff = Some(Utc::now() - STARTUP_BACKLOG);
        debug!(streams = StreamId::SUBSCRIBED.len(), "SignalR connection established");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
        enum Step {
            Renew,
            Frame(Option<tokio_tungstenite::tungstenite::Result<Message>>),
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let step = {
                let Some(ws) = self.ws.as_mut() else {
                    return Err(TimingError::transport_unavailable("websocket not connected"));
                };
                let renewal = self.renewal.as_mut();
                let renew = async {
                    match renewal {
                        Some(renewal) => {
                            renewal.tick().await;
                        }
                        None => futures::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = renew => Step::Renew,
                    frame = ws.next() => Step::Frame(frame),
                }
            };
            match step {
                Step::Renew => {
                    debug!("renewing stream subscription");
                    if let Err(err) = self.send_subscribe().await {
                        warn!(%err, "subscription renewal failed");
                        return Ok(None);
                    }
                }
                Step::Frame(frame) => match frame {
                    Some(Ok(Message::Text(text))) => self.decode_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
    }

    async fn close(&mut self) {
        self.renewal = None;
        if let Some(mut ws) = self.ws.take() {
            if let Err(err) = ws.close(None).await {
                debug!(%err, "websocket close failed");
            }
        }
    }
}
