pub mod env;
pub mod telemetry;

use core::fmt;

use chrono::{DateTime, Utc};

/// Wall-clock source; cooldowns, day rollover and record timestamps all read through this.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
