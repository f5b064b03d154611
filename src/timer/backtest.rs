//! Virtual-clock timer for deterministic replay

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

use super::{TimerCallback, TimerProvider, check_duration};
use crate::core::Result;

/// Shared, manually advanced clock
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    pub fn advance(&self, by: chrono::Duration) -> DateTime<Utc> {
        let mut now = self.now.write();
        *now += by;
        *now
    }

    /// Move forward to `t`; never moves backwards
    pub fn advance_to(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let mut now = self.now.write();
        if t > *now {
            *now = t;
        }
        *now
    }
}

/// Timer that jumps the clock by the full duration and fires in the same call
#[derive(Debug, Clone)]
pub struct BacktestTimer {
    clock: VirtualClock,
}

impl BacktestTimer {
    pub fn new(clock: VirtualClock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }
}

impl TimerProvider for BacktestTimer {
    fn current_time(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn set_timer(&self, duration: chrono::Duration, callback: TimerCallback) -> Result<()> {
        check_duration(duration)?;
        let now = self.clock.advance(duration);
        trace!(%now, "virtual timer elapsed");
        callback();
        Ok(())
    }

    // Nothing is ever pending
    fn stop_timer(&self) {}
}
