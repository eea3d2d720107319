pub mod harness;
pub mod logger;
