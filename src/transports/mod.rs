//! Transport implementations: the live SignalR feed and local replay.

pub mod replay;
pub mod signalr;

pub use replay::{PlaybackHandle, PlaybackStatus, ReplayTransport};
pub use signalr::SignalRTransport;
