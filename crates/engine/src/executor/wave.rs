//! Wave scheduler shared by the local and process backends.
//!
//! Each wave takes every unsettled step whose dependencies have all settled,
//! records those with a failed or skipped dependency as skipped, and
//! dispatches the rest concurrently on a bounded pool. The coordinator waits
//! for the whole wave before computing the next one, and is the only writer
//! of the result map: workers hand their values back through the join set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tools::{Args, InvocationContext, ResolvedTool, ToolRegistry};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{RunFailure, StepError};
use crate::guards::{GuardContext, GuardsRegistry};
use crate::models::{RetryPolicy, Step, Workflow};
use crate::resolver::resolve_args;
use crate::result::{ExecutionResult, StepOutcome};
use crate::RunError;

use super::ExecutorConfig;

/// How one attempt of one step is carried out.
#[async_trait]
pub(crate) trait Dispatch: Send + Sync + 'static {
    /// Reject a tool before anything is dispatched.
    fn admit(&self, _step_id: &str, _tool: &ResolvedTool) -> Result<(), StepError> {
        Ok(())
    }

    /// Run a single attempt.
    async fn attempt(
        &self,
        tool: &ResolvedTool,
        args: Args,
        ctx: &InvocationContext,
    ) -> Result<Value, StepError>;
}

/// Run `workflow` wave by wave through `dispatch`.
pub(crate) async fn run<D: Dispatch>(
    dispatch: Arc<D>,
    workflow: &Workflow,
    tools: &ToolRegistry,
    guards: &GuardsRegistry,
    config: &ExecutorConfig,
) -> Result<ExecutionResult, RunError> {
    let run_id = Uuid::new_v4();
    let mut result = ExecutionResult::new(run_id, workflow.id());
    let pool = Arc::new(Semaphore::new(config.max_workers.max(1)));
    let default_policy = config.retry_policy();

    info!(
        workflow_id = %workflow.id(),
        %run_id,
        steps = workflow.len(),
        max_workers = config.max_workers,
        "workflow run started"
    );

    let mut wave = 0usize;
    loop {
        let eligible: Vec<&Step> = workflow
            .steps()
            .iter()
            .filter(|s| {
                !result.is_settled(&s.id) && workflow.dependencies(&s.id).all(|d| result.is_settled(d))
            })
            .collect();
        if eligible.is_empty() {
            break;
        }
        wave += 1;
        debug!(wave, eligible = eligible.len(), "wave started");

        let mut tasks = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        for step in eligible {
            let upstream = workflow
                .dependencies(&step.id)
                .find(|d| !result.get(d).is_some_and(StepOutcome::is_success));
            if let Some(upstream) = upstream {
                info!(step_id = %step.id, %upstream, "step skipped");
                result.record(
                    step.id.clone(),
                    StepOutcome::Skipped {
                        upstream: upstream.to_owned(),
                    },
                );
                continue;
            }

            let prepared = prepare(dispatch.as_ref(), step, &result, tools, guards);
            let (tool, args) = match prepared {
                Ok(ready) => ready,
                Err(err @ StepError::UnresolvedReference { .. }) => {
                    error!(step_id = %step.id, error = %err, "dispatched a step with an unsettled reference");
                    return Err(RunError::Invariant(err));
                }
                Err(err) => {
                    warn!(step_id = %step.id, error = %err, "step failed before dispatch");
                    result.record(step.id.clone(), StepOutcome::failed(err));
                    continue;
                }
            };

            let policy = step.retry.unwrap_or(default_policy);
            let limit = step.timeout();
            let step_id = step.id.clone();
            let span = info_span!("step", step_id = %step.id, action = %step.action, wave);
            let pool = Arc::clone(&pool);
            let dispatch = Arc::clone(&dispatch);

            in_flight.insert(step_id.clone());
            tasks.spawn(
                async move {
                    // The pool is never closed, so acquiring cannot fail.
                    let _permit = pool.acquire_owned().await.ok();
                    let outcome =
                        attempt_with_retry(dispatch.as_ref(), &tool, args, run_id, &step_id, policy, limit)
                            .await;
                    (step_id, outcome)
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            let (step_id, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    error!(error = %err, "step task ended abnormally");
                    continue;
                }
            };
            in_flight.remove(&step_id);

            let outcome = outcome.and_then(|value| {
                let action = workflow.step(&step_id).map(|s| s.action.as_str()).unwrap_or_default();
                guards
                    .run_post(&GuardContext::new(step_id.as_str(), action), &value)
                    .map(|()| value)
                    .map_err(StepError::from)
            });

            match outcome {
                Ok(value) => {
                    info!(step_id = %step_id, "step succeeded");
                    result.record(step_id, StepOutcome::success(value));
                }
                Err(err) => {
                    warn!(step_id = %step_id, error = %err, "step failed");
                    result.record(step_id, StepOutcome::failed(err));
                }
            }
        }

        for step_id in in_flight.drain() {
            result.record(
                step_id.clone(),
                StepOutcome::failed(StepError::Execution {
                    step_id,
                    cause: "step task ended without reporting a result".into(),
                    retryable: false,
                }),
            );
        }
    }

    result.finish();
    let failures = result.failures();

    if failures.is_empty() {
        info!(workflow_id = %workflow.id(), %run_id, waves = wave, "workflow run succeeded");
        Ok(result)
    } else {
        error!(
            workflow_id = %workflow.id(),
            %run_id,
            failed = failures.len(),
            skipped = result.skipped().len(),
            "workflow run failed"
        );
        Err(RunError::StepsFailed(Box::new(RunFailure { result, failures })))
    }
}

/// Resolve arguments and action, then run the pre-guards.
fn prepare<D: Dispatch>(
    dispatch: &D,
    step: &Step,
    result: &ExecutionResult,
    tools: &ToolRegistry,
    guards: &GuardsRegistry,
) -> Result<(ResolvedTool, Args), StepError> {
    let args = resolve_args(step, result)?;
    let tool = tools.resolve(&step.action).map_err(|_| StepError::UnknownAction {
        step_id: step.id.clone(),
        action: step.action.clone(),
    })?;
    dispatch.admit(&step.id, &tool)?;
    guards.run_pre(&GuardContext::new(step.id.as_str(), step.action.as_str()), &args)?;
    Ok((tool, args))
}

/// Retry retryable failures with exponential back-off. Each attempt is
/// bounded by `limit`; running past it fails the step without a retry.
async fn attempt_with_retry<D: Dispatch>(
    dispatch: &D,
    tool: &ResolvedTool,
    args: Args,
    run_id: Uuid,
    step_id: &str,
    policy: RetryPolicy,
    limit: Option<Duration>,
) -> Result<Value, StepError> {
    let mut ctx = InvocationContext::new(run_id, step_id);

    loop {
        let attempt = dispatch.attempt(tool, args.clone(), &ctx);
        let outcome = match limit {
            Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                warn!(attempt = ctx.attempt, ?limit, "step attempt timed out");
                Err(StepError::TimedOut {
                    step_id: step_id.to_owned(),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }),
            None => attempt.await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && ctx.attempt <= policy.max_retries => {
                let delay = policy.delay_for(ctx.attempt);
                warn!(
                    attempt = ctx.attempt,
                    max_retries = policy.max_retries,
                    ?delay,
                    error = %err,
                    "retryable step failure, retrying"
                );
                tokio::time::sleep(delay).await;
                ctx.attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
