//! DAG analysis: cycle detection, topological order and execution levels.
//!
//! Cycle detection is a depth-first traversal with three-colour marking
//! (unvisited / in-progress / done), driven by an explicit stack so long
//! dependency chains cannot exhaust the thread's stack. Steps are visited in
//! insertion order and dependencies in sorted order, so both the topological
//! order and the reported cycle are deterministic.

use std::collections::{BTreeSet, HashMap};

use crate::models::{Step, Workflow};
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

type PendingDeps<'a> = std::iter::Flatten<std::option::IntoIter<&'a BTreeSet<String>>>;

struct Dfs<'a> {
    deps: &'a HashMap<String, BTreeSet<String>>,
    marks: HashMap<&'a str, Mark>,
    path: Vec<&'a str>,
    order: Vec<String>,
}

impl<'a> Dfs<'a> {
    fn visit(&mut self, root: &'a str) -> Result<(), EngineError> {
        if !self.enter(root)? {
            return Ok(());
        }
        let mut stack: Vec<(&'a str, PendingDeps<'a>)> = vec![(root, self.pending(root))];

        while let Some((id, pending)) = stack.last_mut() {
            match pending.next() {
                Some(dep) => {
                    if self.enter(dep)? {
                        stack.push((dep.as_str(), self.pending(dep)));
                    }
                }
                None => {
                    let id = *id;
                    stack.pop();
                    self.path.pop();
                    self.marks.insert(id, Mark::Done);
                    self.order.push(id.to_owned());
                }
            }
        }
        Ok(())
    }

    /// Mark `id` in progress. `false` if it is already done.
    fn enter(&mut self, id: &'a str) -> Result<bool, EngineError> {
        match self.marks.get(id) {
            Some(Mark::Done) => Ok(false),
            Some(Mark::InProgress) => Err(self.cycle_through(id)),
            None => {
                self.marks.insert(id, Mark::InProgress);
                self.path.push(id);
                Ok(true)
            }
        }
    }

    fn pending(&self, id: &str) -> PendingDeps<'a> {
        self.deps.get(id).into_iter().flatten()
    }

    /// The back-edge to `id` closes a cycle. `path` runs against the
    /// direction of execution, so it is reversed: each reported step runs
    /// before the next one.
    fn cycle_through(&self, id: &str) -> EngineError {
        let start = self.path.iter().position(|&p| p == id).unwrap_or(0);
        let mut cycle: Vec<String> = vec![id.to_owned()];
        cycle.extend(self.path[start..].iter().rev().map(|s| (*s).to_owned()));
        EngineError::CycleDetected { cycle }
    }
}

/// Topologically order `steps` given each step's full dependency set.
///
/// # Errors
/// [`EngineError::CycleDetected`] on the first back-edge found.
pub(crate) fn topological_order(
    steps: &[Step],
    deps: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, EngineError> {
    let mut dfs = Dfs {
        deps,
        marks: HashMap::with_capacity(steps.len()),
        path: Vec::new(),
        order: Vec::with_capacity(steps.len()),
    };

    for step in steps {
        dfs.visit(&step.id)?;
    }

    Ok(dfs.order)
}

/// Group steps into execution levels: level 0 has no dependencies, level `n`
/// holds steps whose deepest dependency sits on level `n - 1`. Within a level
/// steps keep insertion order.
pub fn levels(workflow: &Workflow) -> Vec<Vec<String>> {
    let mut depth: HashMap<&str, usize> = HashMap::with_capacity(workflow.len());

    for id in workflow.topological_order() {
        let d = workflow
            .dependencies(id)
            .filter_map(|dep| depth.get(dep))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(id.as_str(), d);
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    for step in workflow.steps() {
        let d = depth.get(step.id.as_str()).copied().unwrap_or(0);
        if levels.len() <= d {
            levels.resize_with(d + 1, Vec::new);
        }
        levels[d].push(step.id.clone());
    }
    levels
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Step, WorkflowBuilder};

    fn build(steps: Vec<Step>) -> Result<Workflow, EngineError> {
        let mut builder = WorkflowBuilder::new("test");
        for step in steps {
            builder = builder.add_step(step)?;
        }
        builder.build()
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let wf = build(vec![
            Step::new("a", "noop"),
            Step::new("b", "noop").arg("x", "$result.a"),
            Step::new("c", "noop").after("b"),
        ])
        .expect("should be valid");

        assert_eq!(wf.topological_order(), ["a", "b", "c"]);
        assert_eq!(levels(&wf), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let wf = build(vec![
            Step::new("a", "noop"),
            Step::new("b", "noop").after("a"),
            Step::new("c", "noop").arg("in", "$result.a"),
            Step::new("d", "noop").arg("l", "$result.b").arg("r", "$result.c"),
        ])
        .expect("should be valid");

        let order = wf.topological_order();
        assert_eq!(order.first().unwrap(), "a");
        assert_eq!(order.last().unwrap(), "d");
        assert_eq!(levels(&wf), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn dependencies_may_be_declared_before_they_are_added() {
        let wf = build(vec![
            Step::new("report", "noop").arg("x", "$result.load"),
            Step::new("load", "noop"),
        ])
        .unwrap();
        assert_eq!(wf.topological_order(), ["load", "report"]);
        assert_eq!(levels(&wf), vec![vec!["load"], vec!["report"]]);
    }

    #[test]
    fn cycle_is_detected_with_its_path() {
        // A → B → C → A
        let err = build(vec![
            Step::new("a", "noop").after("c"),
            Step::new("b", "noop").after("a"),
            Step::new("c", "noop").arg("x", "$result.b"),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            EngineError::CycleDetected {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = build(vec![Step::new("a", "noop").arg("me", "$result.a")]).unwrap_err();
        assert_eq!(
            err,
            EngineError::CycleDetected {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let wf = build(vec![Step::new("solo", "noop")]).expect("single step should be valid");
        assert_eq!(wf.topological_order(), ["solo"]);
    }

    #[test]
    fn independent_steps_share_level_zero() {
        let wf = build(vec![Step::new("x", "noop"), Step::new("y", "noop")]).unwrap();
        assert_eq!(levels(&wf), vec![vec!["x", "y"]]);
    }

    #[test]
    fn long_chain_does_not_exhaust_the_stack() {
        const LEN: usize = 100_000;
        // Added last-first, so the traversal starts at the deep end.
        let mut steps: Vec<Step> = (1..LEN)
            .rev()
            .map(|i| Step::new(format!("s{i}"), "noop").after(format!("s{}", i - 1)))
            .collect();
        steps.push(Step::new("s0", "noop"));

        let wf = build(steps).unwrap();
        let order = wf.topological_order();
        assert_eq!(order.len(), LEN);
        assert_eq!(order[0], "s0");
        assert_eq!(order[LEN - 1], format!("s{}", LEN - 1));
        assert_eq!(levels(&wf).len(), LEN);
    }
}
