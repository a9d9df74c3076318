//! Airflow DAG file generation.
//!
//! The generated module is self-contained: it embeds the remote source of
//! every action the workflow uses, the step table as JSON, a resolver for
//! `$result.` references backed by XCom, and one `PythonOperator` per step
//! wired along the workflow's dependency edges.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use engine::expr::REFERENCE_MARKER;
use engine::{RunError, Workflow};
use serde_json::{json, Map, Value};
use tools::ToolRegistry;

use crate::platform::Artifact;

/// Prefix of generated DAG file names.
pub const FILE_PREFIX: &str = "flowgraph_";

/// Longest DAG or task id Airflow accepts.
pub const MAX_ID_LEN: usize = 250;

/// Render `workflow` as an Airflow DAG module.
///
/// # Errors
/// - [`RunError::UnknownAction`] if a step's action is not registered.
/// - [`RunError::RemoteSubmission`] if an action has no remote source, or
///   the workflow id or a step id is not a valid Airflow id.
pub fn generate(workflow: &Workflow, tools: &ToolRegistry) -> Result<Artifact, RunError> {
    check_id("workflow", workflow.id())?;
    for step in workflow.steps() {
        check_id("step", &step.id)?;
    }

    let actions: BTreeSet<&str> = workflow.steps().iter().map(|s| s.action.as_str()).collect();

    let mut sources = String::new();
    let mut table: Vec<(&str, &str)> = Vec::with_capacity(actions.len());
    for &action in &actions {
        if !tools.contains(action) {
            return Err(RunError::UnknownAction(action.to_owned()));
        }
        let remote = tools.remote_source(action).ok_or_else(|| {
            RunError::submission(format!("action '{action}' has no remote implementation"))
        })?;
        let _ = writeln!(sources, "# action: {action}");
        sources.push_str(remote.code.trim_end());
        sources.push_str("\n\n\n");
        table.push((action, remote.entrypoint.as_str()));
    }

    let steps: Map<String, Value> = workflow
        .steps()
        .iter()
        .map(|step| {
            let args: Map<String, Value> = step
                .args
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect();
            (step.id.clone(), json!({ "action": step.action, "args": args }))
        })
        .collect();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Generated by flowgraph from workflow {} (version {}). Do not edit.",
        py_str(workflow.id()),
        py_str(workflow.version())
    );
    out.push_str(HEADER);
    out.push_str(&sources);

    out.push_str("ACTIONS = {\n");
    for (action, entrypoint) in &table {
        let _ = writeln!(out, "    {}: {},", py_str(action), entrypoint);
    }
    out.push_str("}\n\n");

    let _ = writeln!(out, "STEPS = json.loads({})", py_str(&Value::Object(steps).to_string()));
    let _ = writeln!(out, "REFERENCE_MARKER = {}", py_str(REFERENCE_MARKER));
    out.push_str(RUNTIME);

    let _ = writeln!(
        out,
        "with DAG(\n    dag_id={},\n    schedule=None,\n    start_date=datetime(2024, 1, 1),\n    catchup=False,\n    tags=[\"flowgraph\"],\n) as dag:",
        py_str(workflow.id())
    );
    out.push_str("    tasks = {}\n");
    for step in workflow.steps() {
        let id = py_str(&step.id);
        let timeout = step
            .timeout_ms
            .map(|ms| format!(", execution_timeout=timedelta(milliseconds={ms})"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "    tasks[{id}] = PythonOperator(task_id={id}, python_callable=_run_step, op_kwargs={{\"step_id\": {id}}}{timeout})"
        );
    }
    for (upstream, downstream) in workflow.edges() {
        let _ = writeln!(out, "    tasks[{}] >> tasks[{}]", py_str(upstream), py_str(downstream));
    }

    Ok(Artifact {
        dag_id: workflow.id().to_owned(),
        file_name: file_name(workflow.id()),
        source: out,
    })
}

/// Airflow ids are limited to `[A-Za-z0-9_.-]`.
fn check_id(kind: &str, id: &str) -> Result<(), RunError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-');
    if !id.is_empty() && id.len() <= MAX_ID_LEN && id.chars().all(allowed) {
        return Ok(());
    }
    Err(RunError::submission(format!(
        "{kind} id '{id}' cannot be used on Airflow: use 1 to {MAX_ID_LEN} letters, digits, '_', '.' or '-'"
    )))
}

/// `flowgraph_<id>.py`, with characters outside `[A-Za-z0-9_]` replaced.
pub fn file_name(dag_id: &str) -> String {
    let safe: String = dag_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{FILE_PREFIX}{safe}.py")
}

/// A Python string literal. JSON string escapes are valid Python escapes.
fn py_str(s: &str) -> String {
    Value::String(s.to_owned()).to_string()
}

const HEADER: &str = r#"
import json
from datetime import datetime, timedelta

from airflow import DAG
from airflow.operators.python import PythonOperator


"#;

const RUNTIME: &str = r#"

def _resolve(value, ti):
    if not isinstance(value, str) or not value.startswith(REFERENCE_MARKER):
        return value
    step_id, _, path = value[len(REFERENCE_MARKER):].partition(".")
    result = ti.xcom_pull(task_ids=step_id)
    for segment in path.split(".") if path else []:
        result = result[int(segment)] if isinstance(result, list) else result[segment]
    return result


def _run_step(step_id, **context):
    step = STEPS[step_id]
    ti = context["ti"]
    args = {name: _resolve(value, ti) for name, value in step["args"].items()}
    return ACTIONS[step["action"]](**args)


"#;

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{Step, WorkflowBuilder};

    fn pipeline() -> Workflow {
        WorkflowBuilder::new("etl-daily")
            .add_step(Step::new("load", "const").arg("value", json!({ "key": "value", "n": 42 })))
            .unwrap()
            .add_step(Step::new("sum", "add").arg("a", "$result.load.n").arg("b", 1))
            .unwrap()
            .add_step(Step::new("report", "echo").after("sum"))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn artifact_embeds_sources_steps_and_edges() {
        let artifact = generate(&pipeline(), &tools::builtin::registry()).unwrap();
        let src = &artifact.source;

        assert_eq!(artifact.dag_id, "etl-daily");
        assert_eq!(artifact.file_name, "flowgraph_etl_daily.py");
        assert!(src.contains("dag_id=\"etl-daily\""));

        // Each used action once, with its entry point in the dispatch table.
        assert!(src.contains("def flowgraph_add("));
        assert!(src.contains("def flowgraph_const("));
        assert!(src.contains("def flowgraph_echo("));
        assert!(!src.contains("def flowgraph_multiply("));
        assert!(src.contains("\"add\": flowgraph_add,"));

        assert!(src.contains("tasks[\"load\"] = PythonOperator(task_id=\"load\""));
        assert!(src.contains("tasks[\"load\"] >> tasks[\"sum\"]"));
        assert!(src.contains("tasks[\"sum\"] >> tasks[\"report\"]"));

        // References survive as text for the XCom resolver.
        assert!(src.contains("$result.load.n"));
        assert!(src.contains("xcom_pull"));
    }

    #[test]
    fn step_table_is_valid_json_inside_the_python_literal() {
        let artifact = generate(&pipeline(), &tools::builtin::registry()).unwrap();
        let line = artifact
            .source
            .lines()
            .find(|l| l.starts_with("STEPS = json.loads("))
            .unwrap();
        let literal = line.trim_start_matches("STEPS = json.loads(").trim_end_matches(')');
        let text: String = serde_json::from_str(literal).unwrap();
        let steps: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(steps["load"]["args"]["value"], json!({ "key": "value", "n": 42 }));
        assert_eq!(steps["sum"]["action"], "add");
    }

    #[test]
    fn unknown_action_is_rejected() {
        let wf = WorkflowBuilder::new("w")
            .add_step(Step::new("a", "ghost"))
            .unwrap()
            .build()
            .unwrap();
        let err = generate(&wf, &tools::builtin::registry()).unwrap_err();
        assert!(matches!(err, RunError::UnknownAction(a) if a == "ghost"));
    }

    #[test]
    fn action_without_remote_source_is_a_submission_error() {
        fn answer() -> std::sync::Arc<dyn tools::Action> {
            std::sync::Arc::new(tools::mock::MockAction::returning("answer", json!(42)))
        }
        let mut registry = ToolRegistry::new();
        registry.register("answer", answer, tools::ToolSchema::default());

        let wf = WorkflowBuilder::new("w")
            .add_step(Step::new("a", "answer"))
            .unwrap()
            .build()
            .unwrap();
        let err = generate(&wf, &registry).unwrap_err();
        assert!(matches!(err, RunError::RemoteSubmission { .. }));
    }

    #[test]
    fn ids_outside_the_airflow_alphabet_are_rejected() {
        let registry = tools::builtin::registry();

        let bad_dag = WorkflowBuilder::new("daily report")
            .add_step(Step::new("a", "const"))
            .unwrap()
            .build()
            .unwrap();
        let err = generate(&bad_dag, &registry).unwrap_err();
        assert!(matches!(&err, RunError::RemoteSubmission { message, .. } if message.contains("workflow id 'daily report'")));

        let bad_step = WorkflowBuilder::new("etl")
            .add_step(Step::new("load/raw", "const"))
            .unwrap()
            .build()
            .unwrap();
        let err = generate(&bad_step, &registry).unwrap_err();
        assert!(matches!(&err, RunError::RemoteSubmission { message, .. } if message.contains("step id 'load/raw'")));

        let dotted = WorkflowBuilder::new("etl.v2")
            .add_step(Step::new("load-raw_1", "const"))
            .unwrap()
            .build()
            .unwrap();
        assert!(generate(&dotted, &registry).is_ok());
    }

    #[test]
    fn step_timeout_becomes_execution_timeout() {
        let wf = WorkflowBuilder::new("etl")
            .add_step(Step::new("slow", "sleep").with_timeout(std::time::Duration::from_secs(90)))
            .unwrap()
            .add_step(Step::new("fast", "const"))
            .unwrap()
            .build()
            .unwrap();
        let src = generate(&wf, &tools::builtin::registry()).unwrap().source;

        assert!(src.contains("from datetime import datetime, timedelta"));
        let slow = src.lines().find(|l| l.contains("task_id=\"slow\"")).unwrap();
        assert!(slow.ends_with(", execution_timeout=timedelta(milliseconds=90000))"));
        let fast = src.lines().find(|l| l.contains("task_id=\"fast\"")).unwrap();
        assert!(!fast.contains("execution_timeout"));
    }
}
