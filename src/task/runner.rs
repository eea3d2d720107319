use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error};

use crate::common::error::TradewindError;

/// One unit of protocol work. Stateless apart from what it reads and writes
/// through the shared model; completes or fails exactly once per pipeline
/// invocation.
#[async_trait]
pub trait Task<M: Send>: Send {
    fn name(&self) -> &'static str;
    async fn run(&mut self, model: &mut M) -> Result<(), TradewindError>;
}

/// Why a pipeline stopped: the task that failed and its error.
#[derive(Debug)]
pub struct PipelineFailure {
    pub pipeline: &'static str,
    pub task: &'static str,
    pub error: TradewindError,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pipeline {} failed at task {} - {}",
            self.pipeline, self.task, self.error
        )
    }
}

type Interceptor<M> = Box<dyn FnMut(&'static str) -> Option<Box<dyn Task<M>>> + Send>;

/// Ordered task pipeline over a shared per-trade model.
///
/// `run` consumes the runner, so a pipeline invocation cannot be restarted,
/// and its single `Result` is the exactly-once success-or-failure outcome.
/// A panic inside a task is caught at this boundary and converted into the
/// same failure path; it never reaches the execution context.
pub struct TaskRunner<M: Send> {
    name: &'static str,
    tasks: Vec<Box<dyn Task<M>>>,
    interceptor: Option<Interceptor<M>>,
}

impl<M: Send> TaskRunner<M> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Vec::new(),
            interceptor: None,
        }
    }

    pub fn add(mut self, task: impl Task<M> + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Test/debug seam: called with each task's name before it runs; may
    /// substitute an alternate task instance.
    pub fn set_interceptor(
        &mut self,
        interceptor: impl FnMut(&'static str) -> Option<Box<dyn Task<M>>> + Send + 'static,
    ) {
        self.interceptor = Some(Box::new(interceptor));
    }

    pub async fn run(mut self, model: &mut M) -> Result<(), PipelineFailure> {
        debug!(
            "Running pipeline {} with tasks {:?}",
            self.name,
            self.tasks.iter().map(|t| t.name()).collect::<Vec<_>>()
        );

        for task in self.tasks {
            let mut task = match self.interceptor.as_mut().and_then(|i| i(task.name())) {
                Some(substitute) => substitute,
                None => task,
            };
            let task_name = task.name();
            debug!("Pipeline {} running task {}", self.name, task_name);

            let outcome = AssertUnwindSafe(task.run(model)).catch_unwind().await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => Err(TradewindError::Simple(format!(
                    "task {} panicked",
                    task_name
                ))),
            };
            if let Err(error) = result {
                error!(
                    "Pipeline {} halted at task {} - {}",
                    self.name, task_name, error
                );
                return Err(PipelineFailure {
                    pipeline: self.name,
                    task: task_name,
                    error,
                });
            }
        }
        debug!("Pipeline {} completed", self.name);
        Ok(())
    }
}
