/// Progress reporting and cooperative cancellation
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Callback surface supplied by the caller of a bulk operation
pub trait ProgressSink: Send + Sync {
    /// New bounds for the current stage; progress so far is kept
    fn set_range(&self, min: u64, max: u64);
    /// A new stage starts at `min`
    fn restart(&self, min: u64, max: u64) {
        self.set_range(min, max);
    }
    fn advance(&self, delta: u64);
    fn set_status(&self, text: &str);
    fn log_info(&self, text: &str);
    fn log_warning(&self, text: &str);
    fn log_error(&self, text: &str);
    fn is_cancellation_requested(&self) -> bool;
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// min / max / current progress values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressPosition {
    pub min: u64,
    pub max: u64,
    pub current: u64,
}

impl ProgressPosition {
    pub fn percent(&self) -> f64 {
        let span = self.max.saturating_sub(self.min);
        if span == 0 {
            return 100.0;
        }
        (self.current.saturating_sub(self.min) as f64 / span as f64) * 100.0
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Progress sink that writes to `tracing` and cancels through a `CancelToken`
pub struct TracingProgress {
    cancel: CancelToken,
    position: Mutex<ProgressPosition>,
    last_logged_decile: Mutex<u64>,
}

impl TracingProgress {
    pub fn new(cancel: CancelToken) -> Self {
        TracingProgress {
            cancel,
            position: Mutex::new(ProgressPosition::default()),
            last_logged_decile: Mutex::new(0),
        }
    }

    pub fn position(&self) -> ProgressPosition {
        *lock(&self.position)
    }
}

impl ProgressSink for TracingProgress {
    fn set_range(&self, min: u64, max: u64) {
        let mut position = lock(&self.position);
        position.min = min;
        position.max = max;
    }

    fn restart(&self, min: u64, max: u64) {
        *lock(&self.position) = ProgressPosition { min, max, current: min };
        *lock(&self.last_logged_decile) = 0;
    }

    fn advance(&self, delta: u64) {
        let position = {
            let mut position = lock(&self.position);
            position.current += delta;
            *position
        };

        let decile = (position.percent() / 10.0).floor() as u64;
        let mut last = lock(&self.last_logged_decile);
        if decile > *last {
            *last = decile;
            info!("Progress {:.0}% ({}/{})", position.percent(), position.current, position.max);
        } else {
            debug!("Progress {}/{}", position.current, position.max);
        }
    }

    fn set_status(&self, text: &str) {
        info!("{}", text);
    }

    fn log_info(&self, text: &str) {
        info!("{}", text);
    }

    fn log_warning(&self, text: &str) {
        warn!("{}", text);
    }

    fn log_error(&self, text: &str) {
        error!("{}", text);
    }

    fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Scheduler-side progress accounting forwarded to a sink
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    position: Mutex<ProgressPosition>,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        ProgressTracker {
            sink,
            position: Mutex::new(ProgressPosition::default()),
        }
    }

    pub fn sink(&self) -> &Arc<dyn ProgressSink> {
        &self.sink
    }

    /// Start a stage of `max` items
    pub fn reset(&self, max: u64) {
        let mut position = lock(&self.position);
        *position = ProgressPosition { min: 0, max, current: 0 };
        self.sink.restart(0, max);
    }

    /// Raise the maximum so a retried attempt does not skew the percentage
    pub fn extend(&self, extra: u64) {
        let mut position = lock(&self.position);
        position.max += extra;
        self.sink.set_range(position.min, position.max);
    }

    pub fn advance(&self) {
        let mut position = lock(&self.position);
        position.current += 1;
        self.sink.advance(1);
    }

    pub fn position(&self) -> ProgressPosition {
        *lock(&self.position)
    }
}
