//! Replay: recording archived sessions and playing them back as live.

mod controller;
mod recorder;

pub use controller::{ReplayController, ReplayControllerSnapshot};
pub use recorder::{LoadedReplay, ReplayRecorder, CACHE_RETENTION, CACHE_VERSION, REPLAY_STREAMS};
