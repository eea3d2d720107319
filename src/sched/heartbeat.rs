use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::common::utils;
use crate::sched::executor::ExecutorAccess;
use crate::sched::timer::Timer;

/// If a second tick arrives this much later than expected, the process was
/// suspended or stalled and in-flight timeouts must be re-validated.
pub const MISSED_TICK_TOLERANCE_MS: u64 = 20_000;

const SECOND_MS: u64 = 1_000;
const SECONDS_PER_MINUTE: u64 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    SecondTick { count: u64 },
    MinuteTick { count: u64 },
    MissedSecondTick { overrun_ms: u64 },
}

struct HeartbeatState {
    last_tick_ms: Option<u64>,
    second_count: u64,
    minute_count: u64,
    listeners: Vec<mpsc::UnboundedSender<HeartbeatEvent>>,
}

/// Once-per-second / once-per-minute ticker built on the execution context's
/// timer primitive. Compares wall-clock elapsed time between second ticks
/// against the expected 1000 ms and reports large overruns as missed ticks.
pub struct Heartbeat {
    state: Arc<Mutex<HeartbeatState>>,
    timer: Mutex<Option<Timer>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HeartbeatState {
                last_tick_ms: None,
                second_count: 0,
                minute_count: 0,
                listeners: Vec::new(),
            })),
            timer: Mutex::new(None),
        }
    }

    pub fn start(&self, exec: &ExecutorAccess) {
        let state = self.state.clone();
        let timer = exec.run_periodically(Duration::from_millis(SECOND_MS), move || {
            Self::tick(&state, utils::now_ms());
        });
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(previous) = slot.take() {
                previous.stop();
            }
            *slot = Some(timer);
        }
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(timer) = slot.take() {
                timer.stop();
            }
        }
    }

    pub fn add_listener(&self) -> mpsc::UnboundedReceiver<HeartbeatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.listeners.push(tx);
        }
        rx
    }

    pub fn second_count(&self) -> u64 {
        self.state.lock().map(|s| s.second_count).unwrap_or(0)
    }

    pub fn minute_count(&self) -> u64 {
        self.state.lock().map(|s| s.minute_count).unwrap_or(0)
    }

    /// Drive one tick with an explicit clock reading. The periodic timer
    /// calls this with the real wall clock; tests inject their own.
    pub fn tick_at(&self, now_ms: u64) {
        Self::tick(&self.state, now_ms);
    }

    fn tick(state: &Arc<Mutex<HeartbeatState>>, now_ms: u64) {
        let mut state = match state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        if let Some(last_tick_ms) = state.last_tick_ms {
            let elapsed_ms = now_ms.saturating_sub(last_tick_ms);
            if elapsed_ms > SECOND_MS + MISSED_TICK_TOLERANCE_MS {
                let overrun_ms = elapsed_ms - SECOND_MS;
                warn!(
                    "Heartbeat overran its second tick by {} ms, process was likely suspended",
                    overrun_ms
                );
                Self::emit(&mut state, HeartbeatEvent::MissedSecondTick { overrun_ms });
            }
        }
        state.last_tick_ms = Some(now_ms);

        state.second_count += 1;
        let second_count = state.second_count;
        Self::emit(&mut state, HeartbeatEvent::SecondTick { count: second_count });

        if second_count % SECONDS_PER_MINUTE == 0 {
            state.minute_count += 1;
            let minute_count = state.minute_count;
            Self::emit(&mut state, HeartbeatEvent::MinuteTick { count: minute_count });
        }
    }

    fn emit(state: &mut HeartbeatState, event: HeartbeatEvent) {
        state
            .listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<HeartbeatEvent>) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn minute_tick_rolls_over_every_sixty_second_ticks() {
        let heartbeat = Heartbeat::new();
        let mut rx = heartbeat.add_listener();

        for i in 0..120u64 {
            heartbeat.tick_at(i * 1_000);
        }

        assert_eq!(heartbeat.second_count(), 120);
        assert_eq!(heartbeat.minute_count(), 2);
        let minute_ticks = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, HeartbeatEvent::MinuteTick { .. }))
            .count();
        assert_eq!(minute_ticks, 2);
    }

    #[tokio::test]
    async fn clock_jump_beyond_tolerance_reports_missed_tick() {
        let heartbeat = Heartbeat::new();
        let mut rx = heartbeat.add_listener();

        heartbeat.tick_at(0);
        heartbeat.tick_at(1_000);
        // Process suspended: next tick lands 25 s after the previous one.
        heartbeat.tick_at(26_000);

        let events = drain(&mut rx);
        let overruns: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                HeartbeatEvent::MissedSecondTick { overrun_ms } => Some(*overrun_ms),
                _ => None,
            })
            .collect();
        assert_eq!(overruns.len(), 1);
        assert!(overruns[0] >= MISSED_TICK_TOLERANCE_MS);
        // Counters keep counting through the jump.
        assert_eq!(heartbeat.second_count(), 3);
    }

    #[tokio::test]
    async fn jump_within_tolerance_is_not_reported() {
        let heartbeat = Heartbeat::new();
        let mut rx = heartbeat.add_listener();

        heartbeat.tick_at(0);
        heartbeat.tick_at(15_000); // late, but under the 20 s tolerance

        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, HeartbeatEvent::MissedSecondTick { .. })));
    }

    #[tokio::test]
    async fn missed_tick_does_not_corrupt_minute_rollover() {
        let heartbeat = Heartbeat::new();

        for i in 0..59u64 {
            heartbeat.tick_at(i * 1_000);
        }
        heartbeat.tick_at(59 * 1_000 + 25_000); // 60th tick arrives late

        assert_eq!(heartbeat.second_count(), 60);
        assert_eq!(heartbeat.minute_count(), 1);
    }
}
