//! Live bus: transport supervision and per-stream fan-out.
//!
//! The bus owns the active [`Transport`], produced by a swappable factory.
//! A supervision task drives the connect/read loop, reconnecting with
//! exponential back-off on failure, and dispatches every received event to
//! the subscribers of its stream. Delivery is per-stream FIFO; no ordering
//! is guaranteed between distinct streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{TransportEvent, TransportFactory};
use crate::types::StreamId;

/// First reconnect delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
/// Reconnect delay ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Heartbeat age beyond which an expected-live feed counts as drained.
pub const HEARTBEAT_DRAIN: Duration = Duration::from_secs(60);

const WATCHDOG_TICK: Duration = Duration::from_secs(5);

/// Next reconnect delay: doubles until it saturates at [`MAX_BACKOFF`].
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Inner {
    factory: Mutex<Option<TransportFactory>>,
    subscribers: Mutex<HashMap<StreamId, Vec<(u64, Callback)>>>,
    next_sub_id: AtomicU64,
    heartbeat: Mutex<Option<(DateTime<Utc>, Instant)>>,
    activity: Mutex<HashMap<StreamId, Instant>>,
    expect_heartbeat: AtomicBool,
    running: AtomicBool,
    /// Poked by `swap_transport` to make the loop drop the current transport.
    interrupt: Notify,
}

/// Pluggable transport driver with pub/sub fan-out.
pub struct LiveBus {
    inner: Arc<Inner>,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Default for LiveBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                factory: Mutex::new(None),
                subscribers: Mutex::new(HashMap::new()),
                next_sub_id: AtomicU64::new(0),
                heartbeat: Mutex::new(None),
                activity: Mutex::new(HashMap::new()),
                expect_heartbeat: AtomicBool::new(false),
                running: AtomicBool::new(false),
                interrupt: Notify::new(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Replace the transport factory without touching a running loop.
    pub fn set_transport_factory(&self, factory: Option<TransportFactory>) {
        *self.inner.factory.lock().unwrap_or_else(|e| e.into_inner()) = factory;
    }

    /// Current factory, for save/restore around replay playback.
    pub fn transport_factory(&self) -> Option<TransportFactory> {
        self.inner.factory.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Atomically swap the factory and close the current transport; the
    /// supervision loop then produces the new one. Starts the loop if it is
    /// not running.
    pub fn swap_transport(&self, factory: Option<TransportFactory>) {
        self.set_transport_factory(factory);
        self.inner.interrupt.notify_one();
        if !self.is_running() {
            self.start();
        }
    }

    /// Spawn the supervision task if it is not already running.
    pub fn start(&self) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, task)) = run.as_ref() {
            if !task.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        inner.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(supervise(inner, cancel.clone()));
        *run = Some((cancel, task));
    }

    /// Stop the supervision task and wait for it to release the transport.
    pub async fn close(&self) {
        let handle = {
            let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
            run.take()
        };
        if let Some((cancel, task)) = handle {
            cancel.cancel();
            if let Err(err) = task.await {
                debug!(%err, "bus supervision task join failed");
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribe to one stream. Payloads arrive in wire order for that
    /// stream. The subscription ends when the returned guard drops.
    pub fn subscribe<F>(&self, stream: StreamId, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(stream)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription { inner: Arc::downgrade(&self.inner), stream, id }
    }

    /// Deliver a synthesized payload to subscribers synchronously, as if it
    /// had arrived on the wire. Used for replay initial-state injection.
    pub fn inject_message(&self, stream: StreamId, payload: &Value) {
        self.inner.dispatch(stream, payload);
    }

    /// While set, the supervision loop drops the transport when the
    /// heartbeat ages past [`HEARTBEAT_DRAIN`].
    pub fn set_heartbeat_expectation(&self, expect: bool) {
        self.inner.expect_heartbeat.store(expect, Ordering::SeqCst);
    }

    pub fn last_heartbeat_age(&self) -> Option<Duration> {
        self.inner
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|(_, mono)| mono.elapsed())
    }

    pub fn last_heartbeat_utc(&self) -> Option<DateTime<Utc>> {
        self.inner.heartbeat.lock().unwrap_or_else(|e| e.into_inner()).map(|(utc, _)| utc)
    }

    /// Minimum age across the named streams, or across all streams when the
    /// slice is empty. `None` when nothing has been received yet.
    pub fn last_stream_activity_age(&self, streams: &[StreamId]) -> Option<Duration> {
        let activity = self.inner.activity.lock().unwrap_or_else(|e| e.into_inner());
        let ages = activity
            .iter()
            .filter(|(stream, _)| streams.is_empty() || streams.contains(stream))
            .map(|(_, at)| at.elapsed());
        ages.min()
    }
}

impl Inner {
    fn dispatch(&self, stream: StreamId, payload: &Value) {
        self.activity.lock().unwrap_or_else(|e| e.into_inner()).insert(stream, Instant::now());
        if stream == StreamId::Heartbeat {
            *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) =
                Some((Utc::now(), Instant::now()));
        }
        let callbacks: Vec<Callback> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            match subscribers.get(&stream) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(payload);
        }
    }

    fn heartbeat_drained(&self) -> bool {
        if !self.expect_heartbeat.load(Ordering::SeqCst) {
            return false;
        }
        match *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) {
            Some((_, mono)) => mono.elapsed() > HEARTBEAT_DRAIN,
            None => false,
        }
    }
}

async fn supervise(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut delay = INITIAL_BACKOFF;
    'outer: while !cancel.is_cancelled() {
        let factory = inner.factory.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(factory) = factory else {
            debug!("no transport factory set; bus loop ends");
            break;
        };
        let mut transport = match factory() {
            Ok(transport) => transport,
            Err(err) => {
                info!(%err, "transport factory unavailable; bus loop ends");
                break;
            }
        };

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.ensure_connection() => result,
        };
        if let Err(err) = connected {
            warn!(%err, retry_in = ?delay, "transport connect failed");
            transport.close().await;
            if !sleep_backoff(&cancel, delay).await {
                break;
            }
            delay = next_backoff(delay);
            continue;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    transport.close().await;
                    break 'outer;
                }
                _ = inner.interrupt.notified() => {
                    debug!("transport swap requested; dropping current transport");
                    transport.close().await;
                    delay = INITIAL_BACKOFF;
                    continue 'outer;
                }
                _ = tokio::time::sleep(WATCHDOG_TICK) => {
                    if inner.heartbeat_drained() {
                        warn!("heartbeat drained; closing transport");
                        transport.close().await;
                        break;
                    }
                }
                event = transport.next_event() => match event {
                    Ok(Some(TransportEvent { stream, payload })) => {
                        delay = INITIAL_BACKOFF;
                        inner.dispatch(stream, &payload);
                    }
                    Ok(None) => {
                        info!("transport stream ended");
                        transport.close().await;
                        break;
                    }
                    Err(err) => {
                        warn!(%err, retry_in = ?delay, "transport read failed");
                        transport.close().await;
                        break;
                    }
                }
            }
        }

        if !sleep_backoff(&cancel, delay).await {
            break;
        }
        delay = next_backoff(delay);
    }
    inner.running.store(false, Ordering::SeqCst);
    debug!("bus supervision task ended");
}

/// Returns `false` when cancelled during the wait.
async fn sleep_backoff(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Removes its stream subscription on drop.
pub struct Subscription {
    inner: Weak<Inner>,
    stream: StreamId,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut subscribers = inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = subscribers.get_mut(&self.stream) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TimingError};
    use crate::transport::Transport;
    use serde_json::json;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        events: VecDeque<TransportEvent>,
        hold_open: bool,
    }

    impl ScriptedTransport {
        fn new(events: Vec<TransportEvent>, hold_open: bool) -> Self {
            Self { events: events.into(), hold_open }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn ensure_connection(&mut self) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
            match self.events.pop_front() {
                Some(event) => Ok(Some(event)),
                None if self.hold_open => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                None => Ok(None),
            }
        }

        async fn close(&mut self) {}
    }

    fn event(stream: StreamId, n: u64) -> TransportEvent {
        TransportEvent { stream, payload: json!({ "n": n }) }
    }

    fn scripted_factory(events: Vec<TransportEvent>) -> TransportFactory {
        let slot = Mutex::new(Some(events));
        Arc::new(move || {
            match slot.lock().unwrap().take() {
                Some(events) => {
                    Ok(Box::new(ScriptedTransport::new(events, true)) as Box<dyn Transport>)
                }
                // Second call means the bus tried to reconnect; stop it.
                None => Err(TimingError::transport_unavailable("script exhausted")),
            }
        })
    }

    #[tokio::test]
    async fn per_stream_fifo_delivery() {
        let bus = LiveBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = bus.subscribe(StreamId::TimingData, move |payload| {
            seen2.lock().unwrap().push(payload["n"].as_u64().unwrap());
        });

        bus.set_transport_factory(Some(scripted_factory(vec![
            event(StreamId::TimingData, 1),
            event(StreamId::TrackStatus, 99),
            event(StreamId::TimingData, 2),
            event(StreamId::TimingData, 3),
        ])));
        bus.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if seen.lock().unwrap().len() == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("events not delivered");

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        bus.close().await;
    }

    #[tokio::test]
    async fn factory_error_ends_loop() {
        let bus = LiveBus::new();
        bus.set_transport_factory(Some(Arc::new(|| {
            Err(TimingError::replay_error("playback complete"))
        })));
        bus.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("loop did not stop");
    }

    #[tokio::test]
    async fn inject_message_is_synchronous() {
        let bus = LiveBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = bus.subscribe(StreamId::TopThree, move |payload| {
            seen2.lock().unwrap().push(payload.clone());
        });

        bus.inject_message(StreamId::TopThree, &json!({"Withheld": false}));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(bus.last_stream_activity_age(&[StreamId::TopThree]).is_some());
        assert!(bus.last_stream_activity_age(&[StreamId::WeatherData]).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = LiveBus::new();
        let seen = Arc::new(Mutex::new(0u32));
        let seen2 = Arc::clone(&seen);
        let sub = bus.subscribe(StreamId::LapCount, move |_| {
            *seen2.lock().unwrap() += 1;
        });
        bus.inject_message(StreamId::LapCount, &json!({"CurrentLap": 1}));
        drop(sub);
        bus.inject_message(StreamId::LapCount, &json!({"CurrentLap": 2}));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn swap_transport_switches_source() {
        let bus = LiveBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = bus.subscribe(StreamId::SessionStatus, move |payload| {
            seen2.lock().unwrap().push(payload["n"].as_u64().unwrap());
        });

        bus.set_transport_factory(Some(scripted_factory(vec![event(
            StreamId::SessionStatus,
            1,
        )])));
        bus.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("first transport event missing");

        bus.swap_transport(Some(scripted_factory(vec![event(StreamId::SessionStatus, 2)])));

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("swapped transport event missing");

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        bus.close().await;
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut delay = INITIAL_BACKOFF;
        let mut observed = Vec::new();
        for _ in 0..6 {
            observed.push(delay);
            assert!(delay >= INITIAL_BACKOFF && delay <= MAX_BACKOFF);
            delay = next_backoff(delay);
        }
        assert_eq!(
            observed,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40),
                Duration::from_secs(60),
                Duration::from_secs(60),
            ]
        );
    }
}
