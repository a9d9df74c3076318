//! Core domain models for the workflow engine.
//!
//! A [`Workflow`] is only ever produced by [`crate::WorkflowBuilder`], so every
//! instance in memory is known to be acyclic with resolvable references.
//! [`WorkflowDefinition`] is the serialisable form; it goes back through the
//! builder when loaded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::ArgValue;
use crate::EngineError;

/// Default version stamped on new workflows and state machines.
pub const DEFAULT_VERSION: &str = "0.1.0";

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How often a retryable action failure is re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay_ms: u64,
}

/// Upper bound on a single back-off delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
        }
    }

    /// Back-off before retry number `retry` (1-based), capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        Duration::from_millis(self.base_delay_ms)
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single named unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Name looked up in the tool registry when the step runs.
    pub action: String,
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
    /// Explicit dependencies, in addition to those implied by references.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Overrides the executor's retry policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt time limit. An attempt that runs longer fails the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            args: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    /// Attach an argument. Strings of the form `$result.<step>[.<path>]`
    /// become references.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), ArgValue::parse(value.into()));
        self
    }

    /// Attach every `(name, value)` pair.
    pub fn args<K, V>(mut self, args: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        for (k, v) in args {
            self.args.insert(k.into(), ArgValue::parse(v.into()));
        }
        self
    }

    /// Declare an explicit dependency.
    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.insert(step_id.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Step IDs referenced from this step's arguments.
    pub fn implicit_dependencies(&self) -> BTreeSet<&str> {
        self.args
            .values()
            .filter_map(ArgValue::referenced_step)
            .collect()
    }

    /// Explicit ∪ implicit dependencies.
    pub fn all_dependencies(&self) -> BTreeSet<&str> {
        let mut deps = self.implicit_dependencies();
        deps.extend(self.depends_on.iter().map(String::as_str));
        deps
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A validated, immutable workflow graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub(crate) id: String,
    pub(crate) version: String,
    pub(crate) steps: Vec<Step>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) dependencies: HashMap<String, BTreeSet<String>>,
    pub(crate) dependents: HashMap<String, Vec<String>>,
    pub(crate) order: Vec<String>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Steps in insertion order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Full dependency set (explicit ∪ implicit) of `id`.
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Steps that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every `(dependency, dependent)` pair, ordered by dependent insertion.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .flat_map(|s| self.dependencies(&s.id).map(move |d| (d, s.id.as_str())))
            .collect()
    }

    /// A topological order: every step appears after all of its dependencies.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            id: self.id.clone(),
            version: self.version.clone(),
            steps: self.steps.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Serialisable workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Validate through [`crate::WorkflowBuilder`].
    pub fn build(self) -> Result<Workflow, EngineError> {
        let mut builder = crate::WorkflowBuilder::new(self.id).version(self.version);
        for step in self.steps {
            builder = builder.add_step(step)?;
        }
        builder.build()
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Definition(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Every field is a plain string, map or list; serialisation cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
