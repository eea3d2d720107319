use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::time::Instant;

pub(crate) type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// How scheduled callbacks are driven. Chosen explicitly at `Executor`
/// construction by the embedding application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerStrategy {
    /// All logical timers multiplex over the execution context's shared
    /// ~100 ms tick. Default; no per-timer tasks.
    Cooperative,
    /// Each timer gets its own sleeping task which posts the fire back onto
    /// the execution context.
    Dedicated,
}

/// Handle for one scheduled callback.
///
/// `stop()` is idempotent and may be called from within the timer's own
/// callback. Callbacks only ever fire on the execution context, and the
/// stopped flag is checked immediately before each fire, so a `stop()` issued
/// on that context guarantees no further fire after it returns.
#[derive(Clone)]
pub struct Timer {
    stopped: Arc<AtomicBool>,
}

impl Timer {
    pub(crate) fn new(stopped: Arc<AtomicBool>) -> Self {
        Self { stopped }
    }

    /// A handle that is already stopped. Returned when scheduling fails so
    /// callers always get a usable handle.
    pub(crate) fn defunct() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub(crate) struct TimerEntry {
    pub(crate) due: Instant,
    pub(crate) interval: Option<Duration>,
    pub(crate) callback: TimerCallback,
    pub(crate) stopped: Arc<AtomicBool>,
}
