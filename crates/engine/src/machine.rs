//! Event-driven state machines.
//!
//! A [`StateMachine`] is a set of states, each with an optional action and an
//! event → next-state table. [`StateMachineRunner`] consumes an ordered list
//! of events one at a time: it invokes the current state's action, records
//! the value under the state ID, then follows the transition for the event
//! (or stays put when the state has none). Execution is strictly sequential.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tools::{Args, InvocationContext, ToolRegistry};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::guards::{GuardContext, GuardsRegistry};
use crate::models::DEFAULT_VERSION;
use crate::{EngineError, StepError};

/// Implicit argument carrying the event being consumed.
pub const EVENT_ARG: &str = "event";
/// Implicit argument carrying the current state ID.
pub const STATE_ARG: &str = "state";

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One state. A state without transitions is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Static arguments passed to the action alongside `event` and `state`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
    /// Event → next state ID.
    #[serde(default)]
    pub on: BTreeMap<String, String>,
}

impl State {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: None,
            args: BTreeMap::new(),
            on: BTreeMap::new(),
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Move to `target` when `event` is consumed in this state.
    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.on.insert(event.into(), target.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.on.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// A validated state machine. Every transition target exists.
#[derive(Debug, Clone)]
pub struct StateMachine {
    id: String,
    version: String,
    states: Vec<State>,
    index: HashMap<String, usize>,
    start: String,
}

impl StateMachine {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    /// States in insertion order.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.index.get(id).map(|&i| &self.states[i])
    }

    pub fn definition(&self) -> StateMachineDefinition {
        StateMachineDefinition {
            id: self.id.clone(),
            version: self.version.clone(),
            start_state: Some(self.start.clone()),
            states: self.states.clone(),
        }
    }
}

/// Fluent construction of a [`StateMachine`].
#[derive(Debug, Clone)]
pub struct StateMachineBuilder {
    id: String,
    version: String,
    states: Vec<State>,
    index: HashMap<String, usize>,
    start: Option<String>,
}

impl StateMachineBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: DEFAULT_VERSION.to_owned(),
            states: Vec::new(),
            index: HashMap::new(),
            start: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// # Errors
    /// [`EngineError::DuplicateState`] if the ID is already taken.
    pub fn add_state(mut self, state: State) -> Result<Self, EngineError> {
        if self.index.contains_key(&state.id) {
            return Err(EngineError::DuplicateState(state.id));
        }
        self.index.insert(state.id.clone(), self.states.len());
        self.states.push(state);
        Ok(self)
    }

    /// Start somewhere other than the first state added.
    pub fn start(mut self, state_id: impl Into<String>) -> Self {
        self.start = Some(state_id.into());
        self
    }

    /// # Errors
    /// - [`EngineError::EmptyStateMachine`] when no state was added.
    /// - [`EngineError::UnknownState`] for a transition to a missing state.
    /// - [`EngineError::UnknownStartState`] for a missing start state.
    pub fn build(self) -> Result<StateMachine, EngineError> {
        let Some(first) = self.states.first() else {
            return Err(EngineError::EmptyStateMachine(self.id));
        };
        let start = self.start.clone().unwrap_or_else(|| first.id.clone());

        for state in &self.states {
            for (event, target) in &state.on {
                if !self.index.contains_key(target) {
                    return Err(EngineError::UnknownState {
                        state_id: state.id.clone(),
                        event: event.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        if !self.index.contains_key(&start) {
            return Err(EngineError::UnknownStartState(start));
        }

        Ok(StateMachine {
            id: self.id,
            version: self.version,
            states: self.states,
            index: self.index,
            start,
        })
    }
}

/// Serialisable state machine document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_state: Option<String>,
    #[serde(default)]
    pub states: Vec<State>,
}

impl StateMachineDefinition {
    /// Validate through [`StateMachineBuilder`].
    pub fn build(self) -> Result<StateMachine, EngineError> {
        let mut builder = StateMachineBuilder::new(self.id).version(self.version);
        for state in self.states {
            builder = builder.add_state(state)?;
        }
        if let Some(start) = self.start_state {
            builder = builder.start(start);
        }
        builder.build()
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Definition(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// A state change caused by an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub event: String,
    pub to: String,
}

/// Everything a state machine run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRun {
    pub run_id: Uuid,
    pub machine_id: String,
    /// Action results keyed by state ID, in first-entry order. Re-entering a
    /// state replaces its value but keeps its position.
    pub results: Vec<(String, Value)>,
    pub final_state: String,
    pub transitions: Vec<Transition>,
    /// Events that had no transition from the state they were consumed in.
    pub ignored: Vec<String>,
}

impl MachineRun {
    fn new(run_id: Uuid, machine_id: &str, start: &str) -> Self {
        Self {
            run_id,
            machine_id: machine_id.to_owned(),
            results: Vec::new(),
            final_state: start.to_owned(),
            transitions: Vec::new(),
            ignored: Vec::new(),
        }
    }

    pub fn get(&self, state_id: &str) -> Option<&Value> {
        self.results.iter().find(|(id, _)| id == state_id).map(|(_, v)| v)
    }

    /// State IDs with a recorded result, in first-entry order.
    pub fn entered(&self) -> Vec<&str> {
        self.results.iter().map(|(id, _)| id.as_str()).collect()
    }

    fn record(&mut self, state_id: &str, value: Value) {
        match self.results.iter_mut().find(|(id, _)| id == state_id) {
            Some(slot) => slot.1 = value,
            None => self.results.push((state_id.to_owned(), value)),
        }
    }
}

/// Errors that end a state machine run.
#[derive(Debug, Error)]
pub enum MachineError {
    /// A state's action or guard failed. `run` holds everything recorded
    /// before the failure.
    #[error("state '{state_id}' failed: {cause}")]
    StateFailed {
        state_id: String,
        cause: StepError,
        run: Box<MachineRun>,
    },

    /// `run_from` named a state the machine does not have.
    #[error("unknown start state '{0}'")]
    UnknownStartState(String),
}

/// Drives a [`StateMachine`] through a sequence of events.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachineRunner;

impl StateMachineRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run from the machine's designated start state.
    pub async fn run<I, E>(
        &self,
        machine: &StateMachine,
        events: I,
        tools: &ToolRegistry,
        guards: &GuardsRegistry,
    ) -> Result<MachineRun, MachineError>
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        self.run_from(machine, machine.start(), events, tools, guards).await
    }

    /// Run from `start` instead of the designated start state.
    ///
    /// # Errors
    /// - [`MachineError::UnknownStartState`] if `start` does not exist.
    /// - [`MachineError::StateFailed`] on the first failing action or guard.
    #[instrument(skip_all, fields(machine_id = %machine.id(), start = %start))]
    pub async fn run_from<I, E>(
        &self,
        machine: &StateMachine,
        start: &str,
        events: I,
        tools: &ToolRegistry,
        guards: &GuardsRegistry,
    ) -> Result<MachineRun, MachineError>
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        let Some(mut current) = machine.state(start) else {
            return Err(MachineError::UnknownStartState(start.to_owned()));
        };
        let run_id = Uuid::new_v4();
        let mut run = MachineRun::new(run_id, machine.id(), start);
        info!(%run_id, "state machine run started");

        for event in events {
            let event: String = event.into();

            if let Some(action) = &current.action {
                match invoke(run_id, current, action, &event, tools, guards).await {
                    Ok(value) => run.record(&current.id, value),
                    Err(cause) => {
                        warn!(state_id = %current.id, %event, error = %cause, "state action failed");
                        run.final_state = current.id.clone();
                        return Err(MachineError::StateFailed {
                            state_id: current.id.clone(),
                            cause,
                            run: Box::new(run),
                        });
                    }
                }
            }

            let next = current.on.get(&event).and_then(|target| machine.state(target));
            match next {
                Some(next) => {
                    debug!(from = %current.id, %event, to = %next.id, "transition");
                    run.transitions.push(Transition {
                        from: current.id.clone(),
                        event,
                        to: next.id.clone(),
                    });
                    current = next;
                }
                None => {
                    debug!(state_id = %current.id, %event, "event ignored");
                    run.ignored.push(event);
                }
            }
        }

        run.final_state = current.id.clone();
        info!(final_state = %run.final_state, transitions = run.transitions.len(), "state machine run finished");
        Ok(run)
    }
}

async fn invoke(
    run_id: Uuid,
    state: &State,
    action: &str,
    event: &str,
    tools: &ToolRegistry,
    guards: &GuardsRegistry,
) -> Result<Value, StepError> {
    let tool = tools.resolve(action).map_err(|_| StepError::UnknownAction {
        step_id: state.id.clone(),
        action: action.to_owned(),
    })?;

    let mut args: Args = state.args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    args.insert(EVENT_ARG.to_owned(), Value::String(event.to_owned()));
    args.insert(STATE_ARG.to_owned(), Value::String(state.id.clone()));

    let ctx = GuardContext::new(state.id.as_str(), action);
    guards.run_pre(&ctx, &args)?;

    let value = tool
        .action
        .invoke(args, &InvocationContext::new(run_id, state.id.as_str()))
        .await
        .map_err(|e| StepError::Execution {
            step_id: state.id.clone(),
            cause: e.message().to_owned(),
            retryable: e.is_retryable(),
        })?;

    guards.run_post(&ctx, &value)?;
    Ok(value)
}
