//! Stream combinators for UI-facing projections.

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
