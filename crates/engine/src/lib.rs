//! `engine` crate: workflow graphs, their validation and execution, and the
//! event-driven state machine alternative.
//!
//! A [`Workflow`] is built with [`WorkflowBuilder`] and run by an
//! [`Executor`] against a [`tools::ToolRegistry`] and a [`GuardsRegistry`].

pub mod builder;
pub mod dag;
pub mod error;
pub mod executor;
pub mod expr;
pub mod guards;
pub mod machine;
pub mod models;
pub mod resolver;
pub mod result;
pub mod worker;

pub use builder::WorkflowBuilder;
pub use error::{EngineError, GuardError, GuardPhase, RunError, RunFailure, StepError};
pub use executor::{Executor, ExecutorConfig, LocalExecutor, ProcessExecutor, WorkerCommand};
pub use expr::ArgValue;
pub use guards::{GuardContext, GuardOutcome, GuardsRegistry, PostGuard, PreGuard, SchemaGuard};
pub use machine::{
    MachineError, MachineRun, State, StateMachine, StateMachineBuilder, StateMachineDefinition,
    StateMachineRunner, Transition,
};
pub use models::{RetryPolicy, Step, Workflow, WorkflowDefinition};
pub use result::{ExecutionResult, StepOutcome};
