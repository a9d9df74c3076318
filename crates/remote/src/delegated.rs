//! Delegated backend: hand the whole workflow to a remote orchestrator and
//! wait for it to finish.

use std::time::Duration;

use async_trait::async_trait;
use engine::{
    ExecutionResult, Executor, GuardContext, GuardsRegistry, RunError, RunFailure, StepError,
    StepOutcome, Workflow,
};
use serde_json::{json, Value};
use tools::ToolRegistry;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::airflow;
use crate::clock::{Clock, TokioClock};
use crate::platform::{RemotePlatform, RemoteRunStatus};
use crate::RemoteError;

/// Status queries are never closer together than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polling behaviour of [`DelegatedExecutor`].
#[derive(Debug, Clone)]
pub struct DelegatedConfig {
    /// Delay between status queries, at least [`MIN_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Give up waiting after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Passed to the orchestrator as the run's `conf`.
    pub run_conf: Option<Value>,
}

impl Default for DelegatedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(300)),
            run_conf: None,
        }
    }
}

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Submitted,
    Polling { attempts: u32 },
    Terminal(RemoteRunStatus),
    TimedOut { waited: Duration },
}

/// Runs a workflow on a [`RemotePlatform`].
pub struct DelegatedExecutor<P, C = TokioClock> {
    platform: P,
    clock: C,
    config: DelegatedConfig,
}

impl<P: RemotePlatform> DelegatedExecutor<P> {
    pub fn new(platform: P, config: DelegatedConfig) -> Self {
        Self::with_clock(platform, TokioClock, config)
    }
}

impl<P: RemotePlatform, C: Clock> DelegatedExecutor<P, C> {
    pub fn with_clock(platform: P, clock: C, config: DelegatedConfig) -> Self {
        Self {
            platform,
            clock,
            config,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &DelegatedConfig {
        &self.config
    }

    /// Drive [`PollPhase`] until the run is terminal or the timeout expires.
    async fn poll(&self, dag_id: &str, run_id: &str) -> Result<RemoteRunStatus, RunError> {
        let started = self.clock.now();
        let mut phase = PollPhase::Submitted;

        loop {
            phase = match phase {
                PollPhase::Submitted => PollPhase::Polling { attempts: 0 },
                PollPhase::Polling { attempts } => {
                    let status = self
                        .platform
                        .run_status(dag_id, run_id)
                        .await
                        .map_err(|e| submission_error("status query failed", e))?;
                    debug!(attempts, %status, "polled remote run");

                    if status.is_terminal() {
                        PollPhase::Terminal(status)
                    } else {
                        let waited = self.clock.now().duration_since(started);
                        match self.config.timeout {
                            Some(limit) if waited >= limit => PollPhase::TimedOut { waited },
                            limit => {
                                let interval = self.config.poll_interval.max(MIN_POLL_INTERVAL);
                                let nap = limit.map_or(interval, |l| interval.min(l - waited));
                                self.clock.sleep(nap).await;
                                PollPhase::Polling {
                                    attempts: attempts + 1,
                                }
                            }
                        }
                    }
                }
                PollPhase::Terminal(status) => return Ok(status),
                PollPhase::TimedOut { waited } => {
                    warn!(run_id, ?waited, "remote run timed out; leaving it running");
                    return Err(RunError::RemoteTimeout {
                        run_id: run_id.to_owned(),
                        waited,
                    });
                }
            };
        }
    }

    /// Build the outcome map from the per-step outputs of a finished run.
    ///
    /// A step without output whose dependency did not succeed is recorded as
    /// skipped, the same way the local backends report it. Post-guards run
    /// on every collected value.
    async fn collect(
        &self,
        workflow: &Workflow,
        guards: &GuardsRegistry,
        dag_id: &str,
        run_id: &str,
        status: RemoteRunStatus,
    ) -> Result<ExecutionResult, RunError> {
        let mut result = ExecutionResult::new(Uuid::new_v4(), workflow.id());

        for step_id in workflow.topological_order() {
            let output = self
                .platform
                .task_output(dag_id, run_id, step_id)
                .await
                .map_err(|e| submission_error("output fetch failed", e))?;

            let blocked_by = workflow
                .dependencies(step_id)
                .find(|dep| !result.get(dep).is_some_and(StepOutcome::is_success))
                .map(str::to_owned);

            let outcome = match (output, blocked_by, status) {
                (Some(value), _, _) => self.check_output(workflow, guards, step_id, value),
                (None, Some(upstream), _) => {
                    debug!(step_id = %step_id, upstream = %upstream, "step skipped remotely");
                    StepOutcome::Skipped { upstream }
                }
                (None, None, RemoteRunStatus::Succeeded) => {
                    self.check_output(workflow, guards, step_id, Value::Null)
                }
                (None, None, _) => StepOutcome::failed(StepError::Remote {
                    step_id: step_id.clone(),
                    detail: format!("no output in remote run '{run_id}' ({status})"),
                }),
            };
            result.record(step_id.clone(), outcome);
        }

        result.finish();
        if result.succeeded() {
            Ok(result)
        } else {
            let failures = result.failures();
            Err(RunError::StepsFailed(Box::new(RunFailure { result, failures })))
        }
    }
}

impl<P, C> DelegatedExecutor<P, C> {
    fn check_output(
        &self,
        workflow: &Workflow,
        guards: &GuardsRegistry,
        step_id: &str,
        value: Value,
    ) -> StepOutcome {
        let action = workflow.step(step_id).map(|s| s.action.as_str()).unwrap_or_default();
        match guards.run_post(&GuardContext::new(step_id, action), &value) {
            Ok(()) => StepOutcome::success(value),
            Err(err) => {
                warn!(step_id = %step_id, error = %err, "remote output rejected by guard");
                StepOutcome::failed(StepError::from(err))
            }
        }
    }
}

fn submission_error(message: &str, err: RemoteError) -> RunError {
    RunError::RemoteSubmission {
        message: message.to_owned(),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl<P: RemotePlatform, C: Clock> Executor for DelegatedExecutor<P, C> {
    #[instrument(skip_all, fields(workflow_id = %workflow.id(), backend = "delegated"))]
    async fn run(
        &self,
        workflow: &Workflow,
        tools: &ToolRegistry,
        guards: &GuardsRegistry,
    ) -> Result<ExecutionResult, RunError> {
        let guarded: Vec<&str> = workflow
            .steps()
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| guards.guards(id))
            .collect();
        if !guarded.is_empty() {
            warn!(steps = ?guarded, "pre-guards are not evaluated by the delegated backend");
        }

        let artifact = airflow::generate(workflow, tools)?;
        self.platform
            .submit_artifact(&artifact)
            .await
            .map_err(|e| submission_error("artifact submission failed", e))?;

        let conf = self.config.run_conf.clone().unwrap_or_else(|| json!({}));
        let run_id = self
            .platform
            .trigger_run(&artifact.dag_id, &conf)
            .await
            .map_err(|e| submission_error("run trigger failed", e))?;
        info!(dag_id = %artifact.dag_id, run_id = %run_id, "remote run started");

        let status = self.poll(&artifact.dag_id, &run_id).await?;
        info!(run_id = %run_id, %status, "remote run finished");

        self.collect(workflow, guards, &artifact.dag_id, &run_id, status).await
    }
}
