pub mod executor;
pub mod heartbeat;
pub mod timer;

pub use executor::{Executor, ExecutorAccess, TICK_INTERVAL_MS};
pub use heartbeat::{Heartbeat, HeartbeatEvent, MISSED_TICK_TOLERANCE_MS};
pub use timer::{Timer, TimerStrategy};
