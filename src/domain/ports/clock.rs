//! Time port.
//!
//! Production uses the wall clock; tests inject fixed time so staleness and
//! timeout logic can be exercised deterministically.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch, used for correlation ids.
    fn unix_seconds(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall-clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle with the production default.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
