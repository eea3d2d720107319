pub mod runner;

pub use runner::{PipelineFailure, Task, TaskRunner};
