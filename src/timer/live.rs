//! Wall-clock timer backed by a tokio sleep task

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{TimerCallback, TimerProvider, check_duration};
use crate::core::{Error, Result};

pub struct LiveTimer {
    handle: Handle,
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl LiveTimer {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
        }
    }

    /// Bind to the runtime of the calling context
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("Live timer needs a tokio runtime: {}", e)))?;
        Ok(Self::new(handle))
    }

    fn cancel_pending(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
    }
}

impl TimerProvider for LiveTimer {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn set_timer(&self, duration: chrono::Duration, callback: TimerCallback) -> Result<()> {
        check_duration(duration)?;
        let delay = duration
            .to_std()
            .map_err(|e| Error::TimerRange(e.to_string()))?;

        self.cancel_pending();
        let armed = self.generation.load(Ordering::SeqCst);
        let generation = Arc::clone(&self.generation);

        trace!(delay_ms = delay.as_millis() as u64, "arming live timer");
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // Re-armed or stopped while sleeping
            if generation.load(Ordering::SeqCst) == armed {
                callback();
            }
        });
        *self.pending.lock() = Some(task);
        Ok(())
    }

    fn stop_timer(&self) {
        self.cancel_pending();
    }
}

impl Drop for LiveTimer {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
