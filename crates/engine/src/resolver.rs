//! Argument resolution: turn a step's [`ArgValue`]s into concrete JSON.

use serde_json::Value;
use tools::Args;

use crate::expr::ArgValue;
use crate::models::Step;
use crate::result::ExecutionResult;
use crate::StepError;

/// Resolve every argument of `step` against the results settled so far.
///
/// # Errors
/// - [`StepError::UnresolvedReference`] if a referenced step has no
///   successful result. The scheduler never dispatches such a step, so this
///   signals a broken invariant.
/// - [`StepError::ReferencePath`] if a field path cannot be followed.
pub fn resolve_args(step: &Step, results: &ExecutionResult) -> Result<Args, StepError> {
    let mut args = Args::new();
    for (name, arg) in &step.args {
        args.insert(name.clone(), resolve_value(&step.id, arg, results)?);
    }
    Ok(args)
}

fn resolve_value(step_id: &str, arg: &ArgValue, results: &ExecutionResult) -> Result<Value, StepError> {
    let (target, path): (&String, &[String]) = match arg {
        ArgValue::Literal(v) => return Ok(v.clone()),
        ArgValue::StepRef { step_id: target } => (target, &[]),
        ArgValue::FieldRef { step_id: target, path } => (target, path),
    };

    let root = results
        .value(target)
        .ok_or_else(|| StepError::UnresolvedReference {
            step_id: step_id.to_owned(),
            target: target.clone(),
        })?;

    follow_path(root, path)
        .cloned()
        .map_err(|reason| StepError::ReferencePath {
            step_id: step_id.to_owned(),
            path: format!("{target}.{}", path.join(".")),
            reason,
        })
}

/// Walk `path` into `root`: object keys, or decimal indices into arrays.
pub fn follow_path<'v>(root: &'v Value, path: &[String]) -> Result<&'v Value, String> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| format!("no field '{segment}'"))?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| format!("'{segment}' is not an array index"))?;
                items
                    .get(index)
                    .ok_or_else(|| format!("index {index} out of range (len {})", items.len()))?
            }
            other => {
                return Err(format!(
                    "cannot look up '{segment}' in {}",
                    kind_of(other)
                ))
            }
        };
    }
    Ok(current)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::StepOutcome;
    use serde_json::json;
    use uuid::Uuid;

    fn results() -> ExecutionResult {
        let mut r = ExecutionResult::new(Uuid::new_v4(), "w");
        r.record("fetch", StepOutcome::success(json!({ "body": { "items": [10, 20] } })));
        r.record("count", StepOutcome::success(json!(2)));
        r.record("broken", StepOutcome::Skipped { upstream: "x".into() });
        r
    }

    #[test]
    fn literals_pass_through_and_references_are_substituted() {
        let step = Step::new("s", "noop")
            .arg("lit", json!({ "nested": "$result.count" }))
            .arg("whole", "$result.count")
            .arg("field", "$result.fetch.body.items.1");

        let args = resolve_args(&step, &results()).unwrap();
        assert_eq!(args["lit"], json!({ "nested": "$result.count" }));
        assert_eq!(args["whole"], json!(2));
        assert_eq!(args["field"], json!(20));
    }

    #[test]
    fn reference_to_unsettled_step_is_unresolved() {
        let step = Step::new("s", "noop").arg("x", "$result.broken");
        let err = resolve_args(&step, &results()).unwrap_err();
        assert_eq!(
            err,
            StepError::UnresolvedReference {
                step_id: "s".into(),
                target: "broken".into()
            }
        );
    }

    #[test]
    fn bad_paths_are_reference_path_errors() {
        for expr in [
            "$result.fetch.missing",
            "$result.fetch.body.items.7",
            "$result.fetch.body.items.first",
            "$result.count.value",
        ] {
            let step = Step::new("s", "noop").arg("x", expr);
            let err = resolve_args(&step, &results()).unwrap_err();
            assert!(matches!(err, StepError::ReferencePath { .. }), "{expr}: {err}");
        }
    }
}
