//! Multi-process backend: every dispatched step runs in a fresh worker
//! process speaking the JSON protocol in [`crate::worker`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tools::{Args, InvocationContext, ResolvedTool, ToolRegistry};
use tracing::{debug, instrument};

use crate::error::StepError;
use crate::guards::GuardsRegistry;
use crate::models::Workflow;
use crate::result::ExecutionResult;
use crate::worker::{WorkerRequest, WorkerResponse};
use crate::RunError;

use super::{wave, Executor, ExecutorConfig};

/// Program and arguments that start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable with the `worker` sub-command.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }
}

/// Runs every step in its own worker process.
///
/// Workers rebuild their registry from constructors, so actions registered
/// as shared instances are rejected with [`StepError::NotPortable`].
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: ExecutorConfig,
    command: WorkerCommand,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig, command: WorkerCommand) -> Self {
        Self { config, command }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    #[instrument(skip_all, fields(workflow_id = %workflow.id(), backend = "process"))]
    async fn run(
        &self,
        workflow: &Workflow,
        tools: &ToolRegistry,
        guards: &GuardsRegistry,
    ) -> Result<ExecutionResult, RunError> {
        let dispatch = Subprocess {
            command: self.command.clone(),
        };
        wave::run(Arc::new(dispatch), workflow, tools, guards, &self.config).await
    }
}

struct Subprocess {
    command: WorkerCommand,
}

impl Subprocess {
    fn crashed(step_id: &str, detail: impl Into<String>) -> StepError {
        StepError::WorkerCrashed {
            step_id: step_id.to_owned(),
            detail: detail.into(),
        }
    }
}

#[async_trait]
impl wave::Dispatch for Subprocess {
    fn admit(&self, step_id: &str, tool: &ResolvedTool) -> Result<(), StepError> {
        if tool.portable {
            Ok(())
        } else {
            Err(StepError::NotPortable {
                step_id: step_id.to_owned(),
                action: tool.name.clone(),
            })
        }
    }

    async fn attempt(
        &self,
        tool: &ResolvedTool,
        args: Args,
        ctx: &InvocationContext,
    ) -> Result<Value, StepError> {
        let step_id = ctx.step_id.as_str();
        let request = WorkerRequest {
            run_id: ctx.run_id,
            step_id: ctx.step_id.clone(),
            action: tool.name.clone(),
            args,
            attempt: ctx.attempt,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| Self::crashed(step_id, format!("cannot encode request: {e}")))?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::crashed(step_id, format!("cannot start worker: {e}")))?;
        debug!(pid = ?child.id(), "worker started");

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that exits early closes the pipe; its exit status
            // below is the better diagnostic.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "could not write worker request");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Self::crashed(step_id, format!("lost worker: {e}")))?;

        if !output.status.success() {
            return Err(Self::crashed(step_id, format!("worker exited with {}", output.status)));
        }

        let response: WorkerResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| Self::crashed(step_id, format!("unreadable worker response: {e}")))?;

        match response {
            WorkerResponse::Ok { value } => Ok(value),
            WorkerResponse::Error { message, retryable } => Err(StepError::Execution {
                step_id: step_id.to_owned(),
                cause: message,
                retryable,
            }),
        }
    }
}
