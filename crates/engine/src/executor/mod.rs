//! Workflow execution backends.
//!
//! Every backend implements [`Executor`]. The local and process backends
//! share the wave scheduler in [`wave`]; they differ only in how a single
//! step attempt is dispatched.

use std::time::Duration;

use async_trait::async_trait;
use tools::ToolRegistry;

use crate::guards::GuardsRegistry;
use crate::models::{RetryPolicy, Workflow};
use crate::result::ExecutionResult;
use crate::RunError;

pub mod local;
pub mod process;
pub(crate) mod wave;

pub use local::LocalExecutor;
pub use process::{ProcessExecutor, WorkerCommand};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs shared by the local and process backends.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running actions (or worker processes).
    pub max_workers: usize,
    /// Maximum number of times a retryable step failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl ExecutorConfig {
    /// Retry policy applied to steps that carry none of their own.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// A strategy for running a validated workflow.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `workflow` to completion.
    ///
    /// # Errors
    /// [`RunError::StepsFailed`] carries the full partial result when any
    /// step failed; other variants abort the run.
    async fn run(
        &self,
        workflow: &Workflow,
        tools: &ToolRegistry,
        guards: &GuardsRegistry,
    ) -> Result<ExecutionResult, RunError>;
}
