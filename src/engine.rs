//! Engine assembly: one registry owning every component and the wiring
//! between them.
//!
//! Collaborators never own each other; the engine holds the handles and
//! routes events (bus -> normalizer -> flag machine / session clock,
//! formation -> calibration, supervisor window -> clock). This keeps the
//! ownership graph acyclic while the calibration and replay managers still
//! see each other through their interface traits.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::availability::LiveAvailability;
use crate::bus::{LiveBus, Subscription};
use crate::calibration::CalibrationManager;
use crate::clock::SessionClock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::flags::{FlagInput, FlagSensor};
use crate::formation::FormationStartTracker;
use crate::http::CachedClient;
use crate::normalize::{NormalizedEvent, Normalizer};
use crate::reference::{ReferenceKind, ReferenceStore};
use crate::replay::{ReplayController, ReplayRecorder};
use crate::schedule::{EventTrackerConfig, EventTrackerScheduleSource, IndexScheduleSource};
use crate::supervisor::LiveSupervisor;
use crate::transport::TransportFactory;
use crate::transports::signalr::SignalRTransport;
use crate::types::StreamId;

/// Streams the engine routes through the normalizer.
const NORMALIZED_STREAMS: &[StreamId] = &[
    StreamId::RaceControlMessages,
    StreamId::TrackStatus,
    StreamId::SessionStatus,
    StreamId::SessionInfo,
    StreamId::SessionData,
    StreamId::ExtrapolatedClock,
    StreamId::TimingData,
    StreamId::DriverList,
    StreamId::TopThree,
    StreamId::LapCount,
    StreamId::WeatherData,
];

/// The fully wired live-timing engine.
pub struct Engine {
    config: EngineConfig,
    http: Arc<CachedClient>,
    bus: Arc<LiveBus>,
    availability: Arc<LiveAvailability>,
    normalizer: Arc<Normalizer>,
    clock: Arc<SessionClock>,
    flags: FlagSensor,
    formation: FormationStartTracker,
    calibration: CalibrationManager,
    replay: ReplayController,
    supervisor: LiveSupervisor,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Assemble the engine. No network traffic happens here; connections
    /// start with [`Engine::start`].
    pub async fn new(config: EngineConfig) -> Result<Engine> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gantry/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let http = Arc::new(CachedClient::new(client.clone(), Some(config.http_cache_path())));
        http.load_persisted().await;

        let bus = Arc::new(LiveBus::new());
        let availability = Arc::new(LiveAvailability::new());
        let normalizer = Arc::new(Normalizer::new());
        let clock = Arc::new(SessionClock::new());
        clock.set_live_delay(config.live_delay_seconds);
        let flags = FlagSensor::spawn();
        let formation =
            FormationStartTracker::new(client.clone(), config.static_base.clone());

        let recorder = Arc::new(ReplayRecorder::new(
            client.clone(),
            config.replay_cache_dir(),
            config.static_base.clone(),
        ));
        let replay =
            ReplayController::new(recorder, Arc::clone(&bus), Arc::clone(&availability));

        let calibration =
            CalibrationManager::new(Arc::clone(&clock) as Arc<dyn crate::calibration::DelayCommit>);
        calibration.set_replay_query(Arc::new(replay.clone()));

        // Persisted reference selections.
        let delay_reference = ReferenceStore::new(config.live_delay_reference_path())
            .load(config.live_delay_reference)
            .await;
        calibration.set_reference(delay_reference);
        let start_reference = ReferenceStore::new(config.replay_start_reference_path())
            .load(config.replay_start_reference)
            .await;
        replay.set_start_reference(start_reference);

        let primary = Arc::new(IndexScheduleSource::new(
            Arc::clone(&http),
            config.static_base.clone(),
        ));
        let secondary = Arc::new(EventTrackerScheduleSource::new(
            client.clone(),
            EventTrackerConfig::default(),
        ));
        let live_factory: TransportFactory = {
            let client = client.clone();
            Arc::new(move || {
                Ok(Box::new(SignalRTransport::new(client.clone()))
                    as Box<dyn crate::transport::Transport>)
            })
        };
        let supervisor = LiveSupervisor::new(
            Arc::clone(&bus),
            Arc::clone(&availability),
            Arc::clone(&http),
            primary,
            Some(secondary),
            live_factory,
            &config,
        );

        let mut engine = Engine {
            config,
            http,
            bus,
            availability,
            normalizer,
            clock,
            flags,
            formation,
            calibration,
            replay,
            supervisor,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        };
        engine.wire();
        Ok(engine)
    }

    /// Bus subscriptions and cross-component bridges.
    fn wire(&mut self) {
        let flag_input = self.flags.input();
        let race_control_enabled = self.config.enable_race_control;

        for stream in NORMALIZED_STREAMS {
            let normalizer = Arc::clone(&self.normalizer);
            let clock = Arc::clone(&self.clock);
            let flag_input = flag_input.clone();
            let stream = *stream;
            let subscription = self.bus.subscribe(stream, move |payload| {
                for event in normalizer.apply(stream, payload) {
                    match event {
                        NormalizedEvent::RaceControl(msg) => {
                            if race_control_enabled {
                                let _ = flag_input.send(FlagInput::RaceControl(msg));
                            }
                        }
                        NormalizedEvent::TrackStatus(track) => {
                            if race_control_enabled {
                                let _ = flag_input.send(FlagInput::TrackStatus(track));
                            }
                        }
                        NormalizedEvent::SessionStatus(status) => {
                            clock.ingest_session_status(&status);
                        }
                        NormalizedEvent::SessionInfo(meta) => {
                            clock.set_session_meta(meta);
                        }
                        NormalizedEvent::SessionData(update) => {
                            clock.ingest_session_data(&update);
                        }
                        NormalizedEvent::Clock(anchor) => {
                            clock.ingest_clock(anchor);
                        }
                    }
                }
            });
            self.subscriptions.push(subscription);
        }

        // Heartbeats anchor server-now for the clock.
        {
            let clock = Arc::clone(&self.clock);
            let subscription = self.bus.subscribe(StreamId::Heartbeat, move |payload| {
                let utc = payload
                    .get("Utc")
                    .and_then(serde_json::Value::as_str)
                    .and_then(crate::jsonstream::parse_utc)
                    .unwrap_or_else(chrono::Utc::now);
                clock.record_heartbeat(utc);
            });
            self.subscriptions.push(subscription);
        }

        self.subscriptions.extend(self.formation.attach(&self.bus));
        self.subscriptions.push(self.calibration.attach(&self.bus));

        // Published flag changes gate the clock (red stops it).
        {
            let clock = Arc::clone(&self.clock);
            let mut watch = self.flags.watch();
            self.tasks.push(tokio::spawn(async move {
                while watch.changed().await.is_ok() {
                    let derived = watch.borrow().derived;
                    clock.set_derived_flag(derived);
                }
            }));
        }

        // Formation markers feed formation-referenced calibration.
        {
            let calibration = self.calibration.clone();
            let mut watch = self.formation.watch();
            self.tasks.push(tokio::spawn(async move {
                while watch.changed().await.is_ok() {
                    let marker = watch.borrow().formation_start_utc;
                    calibration.handle_formation(marker);
                }
            }));
        }

        // The active window gives the clock practice totals and a start
        // fallback.
        {
            let clock = Arc::clone(&self.clock);
            let mut watch = self.supervisor.window_watch();
            self.tasks.push(tokio::spawn(async move {
                while watch.changed().await.is_ok() {
                    let window = watch.borrow().clone();
                    clock.set_window(window);
                }
            }));
        }
    }

    /// Initialize the replay cache and start supervising session windows.
    pub async fn start(&self) -> Result<()> {
        info!(mode = ?self.config.operation_mode, "engine starting");
        self.replay.initialize().await?;
        self.supervisor.start();
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        info!("engine shutting down");
        self.supervisor.close().await;
        self.replay.stop().await;
        self.calibration.close();
        self.formation.close();
        self.bus.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn http(&self) -> Arc<CachedClient> {
        Arc::clone(&self.http)
    }

    pub fn bus(&self) -> Arc<LiveBus> {
        Arc::clone(&self.bus)
    }

    pub fn availability(&self) -> Arc<LiveAvailability> {
        Arc::clone(&self.availability)
    }

    pub fn normalizer(&self) -> Arc<Normalizer> {
        Arc::clone(&self.normalizer)
    }

    pub fn clock(&self) -> Arc<SessionClock> {
        Arc::clone(&self.clock)
    }

    pub fn flags(&self) -> &FlagSensor {
        &self.flags
    }

    pub fn formation(&self) -> &FormationStartTracker {
        &self.formation
    }

    pub fn calibration(&self) -> &CalibrationManager {
        &self.calibration
    }

    pub fn replay(&self) -> &ReplayController {
        &self.replay
    }

    pub fn supervisor(&self) -> &LiveSupervisor {
        &self.supervisor
    }

    /// Change and persist the calibration reference.
    pub async fn set_live_delay_reference(&self, reference: ReferenceKind) -> Result<()> {
        self.calibration.set_reference(reference);
        ReferenceStore::new(self.config.live_delay_reference_path()).save(reference).await
    }

    /// Change and persist the replay start reference.
    pub async fn set_replay_start_reference(&self, reference: ReferenceKind) -> Result<()> {
        self.replay.set_start_reference(reference);
        ReferenceStore::new(self.config.replay_start_reference_path()).save(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::DerivedFlag;
    use crate::normalize::TrackState;
    use serde_json::json;
    use std::time::Duration;

    async fn engine() -> Engine {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            // Tests never reach the real host; a dead local port makes any
            // accidental fetch fail fast instead.
            static_base: "http://127.0.0.1:9/static".to_string(),
            ..EngineConfig::default()
        };
        Engine::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn injected_events_flow_to_merged_state_and_clock() {
        let mut e = engine().await;
        let bus = e.bus();

        bus.inject_message(
            StreamId::SessionInfo,
            &json!({"Name": "Qualifying", "Type": "Qualifying"}),
        );
        bus.inject_message(StreamId::SessionStatus, &json!({"Status": "Started"}));
        bus.inject_message(
            StreamId::ExtrapolatedClock,
            &json!({"Utc": "2025-12-06T14:00:01Z", "Remaining": "0:17:59", "Extrapolating": true}),
        );

        let merged = e.normalizer().snapshot();
        assert_eq!(merged.session.as_ref().unwrap().name, "Qualifying");
        assert_eq!(merged.session_status.as_deref(), Some("Started"));

        let clock = e.clock().snapshot_at("2025-12-06T14:00:11Z".parse().unwrap());
        assert_eq!(clock.remaining_s, Some(1069));
        assert_eq!(clock.session_type.as_deref(), Some("Qualifying"));

        e.shutdown().await;
    }

    #[tokio::test]
    async fn track_status_reaches_flag_sensor_and_merged_state() {
        let mut e = engine().await;
        let bus = e.bus();

        // SC publishes without debounce.
        bus.inject_message(StreamId::TrackStatus, &json!({"Status": "4"}));
        tokio::time::timeout(Duration::from_secs(2), async {
            while e.flags().snapshot().derived != DerivedFlag::Sc {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("flag sensor never saw the safety car");
        assert!(e.flags().snapshot().derived.safety_car_active());
        assert_eq!(e.normalizer().snapshot().track_status, Some(TrackState::Sc));

        e.shutdown().await;
    }

    #[tokio::test]
    async fn calibration_is_blocked_while_replay_engaged() {
        let mut e = engine().await;
        // Force the replay controller into an engaged state via selection.
        let session = crate::types::ReplaySession {
            year: 2025,
            meeting_key: 1,
            meeting_name: "Test".into(),
            session_key: 1,
            session_name: "Race".into(),
            session_type: "Race".into(),
            path: "2025/test/race".into(),
            start_utc: chrono::Utc::now() - chrono::Duration::days(1),
            end_utc: chrono::Utc::now() - chrono::Duration::days(1),
        };
        // Loading fails (no network), which leaves the controller Selected.
        let _ = e.replay().prepare_and_load(session).await;
        assert!(e.replay().state().engages_replay());
        assert_eq!(
            e.calibration().prepare("test"),
            crate::calibration::CalibrationOutcome::BlockedByReplay
        );
        e.shutdown().await;
    }
}
