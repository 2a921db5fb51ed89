//! Async engine for Formula 1 live timing.
//!
//! Gantry joins the push-style SignalR feed and the pull-style static
//! archive, normalizes both into one event vocabulary, and fans per-stream
//! events out to consumers. On top of the raw streams it derives a canonical
//! flag state, an extrapolated session clock, formation-start detection and
//! live-delay calibration - and it can record a past session from the
//! archive and replay it as if it were live, with consumers none the wiser.
//!
//! # Features
//!
//! - **Schedule-driven supervision**: connects an hour before each session,
//!   disconnects when the feed drains
//! - **Pluggable transports**: live SignalR or deterministic local replay
//!   behind one bus
//! - **Normalization**: the feed's list-or-map payload shapes merged into
//!   stable per-stream state
//! - **Derived signals**: flag state machine, session clock with the
//!   three-hour race cap, formation-start probe
//!
//! # Quick start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use gantry::{Engine, EngineConfig, StreamId};
//! use tokio_stream::wrappers::WatchStream;
//!
//! #[tokio::main]
//! async fn main() -> gantry::Result<()> {
//!     let mut engine = Engine::new(EngineConfig::default()).await?;
//!     engine.start().await?;
//!
//!     // React to canonical flag changes.
//!     let mut flags = WatchStream::new(engine.flags().watch());
//!     // Or tap a raw stream directly.
//!     let _sub = engine.bus().subscribe(StreamId::TimingData, |payload| {
//!         println!("timing delta: {payload}");
//!     });
//!
//!     while let Some(snapshot) = flags.next().await {
//!         println!("flag: {}", snapshot.derived.as_str());
//!     }
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core plumbing
pub mod bus;
mod error;
pub mod jsonstream;
pub mod transport;
pub mod transports;
pub mod types;

// Scheduling and supervision
pub mod availability;
pub mod schedule;
pub mod supervisor;

// Normalization and derived state
pub mod clock;
pub mod flags;
pub mod formation;
pub mod normalize;

// Calibration and replay
pub mod calibration;
pub mod replay;

// Ambient services
pub mod config;
pub mod engine;
pub mod http;
pub mod reference;
pub mod stream;

// Core exports
pub use availability::{AvailabilitySnapshot, LiveAvailability};
pub use bus::{LiveBus, Subscription};
pub use calibration::{CalibrationManager, CalibrationOutcome, CalibrationSnapshot};
pub use clock::{SessionClock, SessionClockSnapshot, SourceQuality};
pub use config::{EngineConfig, OperationMode, RaceWeekStartDay};
pub use engine::Engine;
pub use error::{Result, TimingError};
pub use flags::{DerivedFlag, FlagSensor, FlagSnapshot, FlagStateMachine};
pub use formation::{FormationSnapshot, FormationStartTracker, FormationStatus};
pub use normalize::{MergedState, Normalizer};
pub use reference::ReferenceKind;
pub use replay::{ReplayController, ReplayRecorder};
pub use supervisor::LiveSupervisor;
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use types::{
    RaceControlMsg, ReplayFrame, ReplayIndex, ReplaySession, ReplayState, SessionWindow,
    StreamId,
};
