//! Fluent construction of validated [`Workflow`]s.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::dag;
use crate::models::{Step, Workflow, DEFAULT_VERSION};
use crate::EngineError;

/// Accumulates steps, then validates the whole graph in [`build`](Self::build).
///
/// ```
/// use engine::{Step, WorkflowBuilder};
///
/// let wf = WorkflowBuilder::new("etl")
///     .add_step(Step::new("load", "const").arg("value", 3))?
///     .add_step(Step::new("double", "multiply").arg("a", "$result.load").arg("b", 2))?
///     .build()?;
/// assert_eq!(wf.topological_order(), ["load", "double"]);
/// # Ok::<(), engine::EngineError>(())
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    id: String,
    version: String,
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: DEFAULT_VERSION.to_owned(),
            steps: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Append a step. References may point at steps added later; they are
    /// checked in [`build`](Self::build).
    ///
    /// # Errors
    /// [`EngineError::DuplicateStep`] if the ID is already taken.
    pub fn add_step(mut self, step: Step) -> Result<Self, EngineError> {
        if self.index.contains_key(&step.id) {
            return Err(EngineError::DuplicateStep(step.id));
        }
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(self)
    }

    /// Validate and freeze the graph.
    ///
    /// # Errors
    /// - [`EngineError::UnknownReference`] if a dependency or reference names
    ///   a step that was never added.
    /// - [`EngineError::CycleDetected`] if the dependency relation has a cycle.
    pub fn build(self) -> Result<Workflow, EngineError> {
        let mut dependencies: HashMap<String, BTreeSet<String>> =
            HashMap::with_capacity(self.steps.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for step in &self.steps {
            let explicit = step.depends_on.iter().map(String::as_str);
            let implicit = step.args.values().filter_map(|a| a.referenced_step());

            let mut deps = BTreeSet::new();
            for target in explicit.chain(implicit) {
                if !self.index.contains_key(target) {
                    return Err(EngineError::UnknownReference {
                        step_id: step.id.clone(),
                        target: target.to_owned(),
                    });
                }
                deps.insert(target.to_owned());
            }

            for dep in &deps {
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
            dependencies.insert(step.id.clone(), deps);
        }

        let order = dag::topological_order(&self.steps, &dependencies)?;

        debug!(
            workflow_id = %self.id,
            steps = self.steps.len(),
            "workflow graph validated"
        );

        Ok(Workflow {
            id: self.id,
            version: self.version,
            steps: self.steps,
            index: self.index,
            dependencies,
            dependents,
            order,
        })
    }
}
