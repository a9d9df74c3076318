//! In-process backend: actions run as tokio tasks on a bounded pool.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tools::{Args, InvocationContext, ResolvedTool, ToolRegistry};
use tracing::instrument;

use crate::error::StepError;
use crate::guards::GuardsRegistry;
use crate::models::Workflow;
use crate::result::ExecutionResult;
use crate::RunError;

use super::{wave, Executor, ExecutorConfig};

/// Runs every step in the current process.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    config: ExecutorConfig,
}

impl LocalExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    #[instrument(skip_all, fields(workflow_id = %workflow.id(), backend = "local"))]
    async fn run(
        &self,
        workflow: &Workflow,
        tools: &ToolRegistry,
        guards: &GuardsRegistry,
    ) -> Result<ExecutionResult, RunError> {
        wave::run(Arc::new(InProcess), workflow, tools, guards, &self.config).await
    }
}

struct InProcess;

#[async_trait]
impl wave::Dispatch for InProcess {
    async fn attempt(
        &self,
        tool: &ResolvedTool,
        args: Args,
        ctx: &InvocationContext,
    ) -> Result<Value, StepError> {
        let action = Arc::clone(&tool.action);
        let task_ctx = ctx.clone();

        // A separate task keeps a panicking action from tearing down the wave.
        let mut task = AbortOnDrop(tokio::spawn(async move { action.invoke(args, &task_ctx).await }));
        let joined = (&mut task.0).await;

        let cause = match joined {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                return Err(StepError::Execution {
                    step_id: ctx.step_id.clone(),
                    cause: err.message().to_owned(),
                    retryable: err.is_retryable(),
                })
            }
            Err(err) if err.is_panic() => {
                format!("action panicked: {}", panic_message(err.into_panic().as_ref()))
            }
            Err(err) => err.to_string(),
        };

        Err(StepError::Execution {
            step_id: ctx.step_id.clone(),
            cause,
            retryable: false,
        })
    }
}

/// Aborts the action task if the attempt is abandoned, e.g. on timeout.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
