//! Timers - One-shot delayed callbacks on a wall or virtual clock
//!
//! Each algorithm owns one [`TimerProvider`]; arming a timer replaces the
//! pending one so at most one callback is outstanding at any time.

pub mod backtest;
pub mod live;

pub use backtest::{BacktestTimer, VirtualClock};
pub use live::LiveTimer;

use chrono::{DateTime, Utc};

use crate::core::{Error, Result};

/// Callback invoked when a timer elapses
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait TimerProvider: Send + Sync {
    /// Current time of the clock this provider schedules against
    fn current_time(&self) -> DateTime<Utc>;

    /// Arm a one-shot timer, cancelling any pending one
    fn set_timer(&self, duration: chrono::Duration, callback: TimerCallback) -> Result<()>;

    /// Cancel the pending timer, if any
    fn stop_timer(&self);
}

pub(crate) fn check_duration(duration: chrono::Duration) -> Result<()> {
    if duration < chrono::Duration::zero() {
        return Err(Error::TimerRange(format!(
            "timer duration must not be negative, got {} ms",
            duration.num_milliseconds()
        )));
    }
    Ok(())
}
