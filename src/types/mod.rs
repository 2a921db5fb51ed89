//! Core data types shared across the engine.

mod race_control;
mod replay;
mod stream;
mod window;

pub use race_control::{RaceControlMsg, RcCategory, RcFlag, RcScope};
pub use replay::{ReplayFrame, ReplayIndex, ReplaySession, ReplayState};
pub use stream::StreamId;
pub use window::SessionWindow;
