pub mod common;
pub mod delivery;
pub mod envelope;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod sched;
pub mod task;
pub mod trade;
pub mod wallet;
