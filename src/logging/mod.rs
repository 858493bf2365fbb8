//! Logging helpers.
//!
//! - `LogThrottle` / `KeyedLogThrottle` - keep warnings emitted every tick
//!   (stale prices, missing credentials) from flooding the log

pub mod throttle;

pub use throttle::{KeyedLogThrottle, LogThrottle};
