use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::common::error::TradewindError;
use crate::sched::timer::{Timer, TimerCallback, TimerEntry, TimerStrategy};

/// Shared low-frequency tick all cooperative timers multiplex over.
pub const TICK_INTERVAL_MS: u64 = 100;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum ExecutorRequest {
    Execute { job: Job },
    Schedule { entry: TimerEntry },
    Shutdown { rsp_tx: oneshot::Sender<()> },
}

/// The single logical execution context. All trade-state mutation, task
/// execution, and timer callbacks run here, strictly one at a time — this is
/// the sole concurrency-safety mechanism for trade state; no locks elsewhere.
///
/// Explicitly owned, constructed-once service with start/stop lifecycle.
pub struct Executor {
    tx: mpsc::UnboundedSender<ExecutorRequest>,
    strategy: TimerStrategy,
    task_handle: tokio::task::JoinHandle<()>,
}

impl Executor {
    pub fn start(strategy: TimerStrategy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<ExecutorRequest>();
        let actor = ExecutorActor {
            rx,
            timers: Vec::new(),
        };
        let task_handle = tokio::spawn(async move { actor.run().await });
        Self {
            tx,
            strategy,
            task_handle,
        }
    }

    pub fn new_accessor(&self) -> ExecutorAccess {
        ExecutorAccess {
            tx: self.tx.clone(),
            strategy: self.strategy,
        }
    }

    pub async fn shutdown(self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<()>();
        self.tx.send(ExecutorRequest::Shutdown { rsp_tx })?;
        rsp_rx.await?;
        self.task_handle.await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ExecutorAccess {
    tx: mpsc::UnboundedSender<ExecutorRequest>,
    strategy: TimerStrategy,
}

impl ExecutorAccess {
    /// Post `job` onto the execution context. Jobs run in posting order.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), TradewindError> {
        self.tx
            .send(ExecutorRequest::Execute { job: Box::new(job) })?;
        Ok(())
    }

    /// One-shot delayed execution on the execution context.
    ///
    /// `Timer::stop()` from the execution context itself guarantees no fire
    /// after it returns. From any other task the stop takes effect at the
    /// next fire check, so a fire already in flight may still complete;
    /// callers off the context must tolerate one late fire (the protocol
    /// layer does this with expectation ids).
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> Timer {
        self.schedule(delay, None, Box::new(callback))
    }

    /// Fixed-interval periodic execution on the execution context. The same
    /// `stop()` scoping as [`run_after`](Self::run_after) applies.
    pub fn run_periodically(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Timer {
        self.schedule(interval, Some(interval), Box::new(callback))
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> Timer {
        let stopped = Arc::new(AtomicBool::new(false));
        let timer = Timer::new(stopped.clone());

        match self.strategy {
            TimerStrategy::Cooperative => {
                let entry = TimerEntry {
                    due: Instant::now() + delay,
                    interval,
                    callback,
                    stopped,
                };
                if self
                    .tx
                    .send(ExecutorRequest::Schedule { entry })
                    .is_err()
                {
                    warn!("Execution context is gone, timer will never fire");
                    return Timer::defunct();
                }
            }
            TimerStrategy::Dedicated => {
                self.schedule_dedicated(delay, interval, callback, stopped);
            }
        }
        timer
    }

    // Dedicated strategy: a sleeping task per timer. The callback itself
    // still runs on the execution context.
    fn schedule_dedicated(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: TimerCallback,
        stopped: Arc<AtomicBool>,
    ) {
        let callback = Arc::new(Mutex::new(callback));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut wait = delay;
            loop {
                tokio::time::sleep(wait).await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let callback = callback.clone();
                let stopped_at_fire = stopped.clone();
                let one_shot = interval.is_none();
                let job: Job = Box::new(move || {
                    if stopped_at_fire.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Ok(mut callback) = callback.lock() {
                        (callback)();
                    }
                    if one_shot {
                        stopped_at_fire.store(true, Ordering::SeqCst);
                    }
                });
                if tx.send(ExecutorRequest::Execute { job }).is_err() {
                    break;
                }
                match interval {
                    Some(iv) => wait = iv,
                    None => break,
                }
            }
        });
    }
}

struct ExecutorActor {
    rx: mpsc::UnboundedReceiver<ExecutorRequest>,
    timers: Vec<TimerEntry>,
}

impl ExecutorActor {
    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_request = self.rx.recv() => {
                    match maybe_request {
                        Some(ExecutorRequest::Execute { job }) => {
                            Self::run_isolated("posted job", || job());
                        }
                        Some(ExecutorRequest::Schedule { entry }) => {
                            self.timers.push(entry);
                        }
                        Some(ExecutorRequest::Shutdown { rsp_tx }) => {
                            let _ = rsp_tx.send(());
                            break;
                        }
                        None => break,
                    }
                },
                _ = ticker.tick() => {
                    self.fire_due_timers();
                }
            }
        }
        info!("Execution context terminating");
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        self.timers.retain_mut(|entry| {
            if entry.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if now < entry.due {
                return true;
            }
            Self::run_isolated("timer callback", &mut entry.callback);
            // The callback may have stopped its own timer.
            if entry.stopped.load(Ordering::SeqCst) {
                return false;
            }
            match entry.interval {
                Some(interval) => {
                    entry.due = now + interval;
                    true
                }
                None => {
                    entry.stopped.store(true, Ordering::SeqCst);
                    false
                }
            }
        });
    }

    // One misbehaving callback must not take down the whole context.
    fn run_isolated<F: FnOnce()>(what: &str, f: F) {
        debug!("Running {} on execution context", what);
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!("{} panicked; execution context continues", what);
        }
    }
}
