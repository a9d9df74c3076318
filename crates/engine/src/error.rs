//! Engine-level error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::result::ExecutionResult;

/// Structural errors raised while building a workflow or state machine.
///
/// No partial graph is ever returned alongside one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    // ------ Workflow graph ------

    /// Two steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),

    /// The dependency relation contains a cycle. `cycle` lists the step IDs
    /// along the cycle, with the first ID repeated at the end.
    #[error("workflow graph contains a cycle: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A step depends on, or references the result of, a step that was never added.
    #[error("step '{step_id}' references unknown step '{target}'")]
    UnknownReference { step_id: String, target: String },

    // ------ State machine ------

    /// Two states share the same ID.
    #[error("duplicate state ID: '{0}'")]
    DuplicateState(String),

    /// A transition points at a state that does not exist.
    #[error("state '{state_id}' transitions on '{event}' to unknown state '{target}'")]
    UnknownState {
        state_id: String,
        event: String,
        target: String,
    },

    /// The designated start state does not exist.
    #[error("unknown start state '{0}'")]
    UnknownStartState(String),

    /// A state machine needs at least one state.
    #[error("state machine '{0}' has no states")]
    EmptyStateMachine(String),

    // ------ Definitions ------

    /// A serialized definition could not be decoded.
    #[error("invalid definition: {0}")]
    Definition(String),
}

/// Which side of an action invocation a guard ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardPhase {
    Pre,
    Post,
}

impl std::fmt::Display for GuardPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// A guard rejected a step's arguments (pre) or result (post).
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{phase}-guard rejected step '{step_id}': {}", .reason.as_deref().unwrap_or("no reason given"))]
pub struct GuardError {
    pub step_id: String,
    pub phase: GuardPhase,
    pub reason: Option<String>,
}

/// Why a single step did not succeed. Recorded in the result map rather than
/// propagated out of the run.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// A reference pointed at a step that has not settled successfully.
    /// Unreachable under correct wave scheduling.
    #[error("step '{step_id}' references '{target}', which has no successful result")]
    UnresolvedReference { step_id: String, target: String },

    /// A field path inside a referenced result could not be followed.
    #[error("step '{step_id}': cannot follow path '{path}': {reason}")]
    ReferencePath {
        step_id: String,
        path: String,
        reason: String,
    },

    /// The step's action is not in the tool registry.
    #[error("step '{step_id}': no action registered under '{action}'")]
    UnknownAction { step_id: String, action: String },

    #[error(transparent)]
    Guard(#[from] GuardError),

    /// The action itself failed.
    #[error("step '{step_id}' failed: {cause}")]
    Execution {
        step_id: String,
        cause: String,
        retryable: bool,
    },

    /// The action is registered as a live instance and cannot run in a worker process.
    #[error("step '{step_id}': action '{action}' cannot be rebuilt in a worker process")]
    NotPortable { step_id: String, action: String },

    /// An attempt ran past the step's time limit.
    #[error("step '{step_id}' timed out after {timeout_ms} ms")]
    TimedOut { step_id: String, timeout_ms: u64 },

    /// The worker process died or broke the wire protocol.
    #[error("step '{step_id}': worker process crashed: {detail}")]
    WorkerCrashed { step_id: String, detail: String },

    /// The remote orchestrator reported the step as not completed.
    #[error("step '{step_id}' did not complete remotely: {detail}")]
    Remote { step_id: String, detail: String },
}

impl StepError {
    pub fn step_id(&self) -> &str {
        match self {
            Self::UnresolvedReference { step_id, .. }
            | Self::ReferencePath { step_id, .. }
            | Self::UnknownAction { step_id, .. }
            | Self::Execution { step_id, .. }
            | Self::NotPortable { step_id, .. }
            | Self::TimedOut { step_id, .. }
            | Self::WorkerCrashed { step_id, .. }
            | Self::Remote { step_id, .. } => step_id,
            Self::Guard(g) => &g.step_id,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { retryable: true, .. })
    }
}

/// Aggregate failure of a run: the full partial result plus every failed step.
#[derive(Debug)]
pub struct RunFailure {
    pub result: ExecutionResult,
    pub failures: Vec<(String, StepError)>,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} step(s) failed", self.failures.len())?;
        for (step_id, cause) in &self.failures {
            write!(f, "; {step_id}: {cause}")?;
        }
        Ok(())
    }
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// One or more steps failed. Read `result` for the partial outcome map.
    #[error("workflow run failed: {0}")]
    StepsFailed(Box<RunFailure>),

    /// The scheduler broke one of its own invariants.
    #[error("engine invariant violated: {0}")]
    Invariant(StepError),

    /// A workflow names an action the registry does not know (delegated backend).
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// The remote orchestrator rejected the artifact or the run trigger.
    #[error("remote submission failed: {message}")]
    RemoteSubmission {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The remote run did not reach a terminal state in time.
    #[error("remote run '{run_id}' did not finish within {waited:?}")]
    RemoteTimeout { run_id: String, waited: Duration },
}

impl RunError {
    pub fn submission(message: impl Into<String>) -> Self {
        Self::RemoteSubmission {
            message: message.into(),
            source: None,
        }
    }

    /// The partial result of a run that failed step-wise, if any.
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::StepsFailed(failure) => Some(&failure.result),
            _ => None,
        }
    }
}
