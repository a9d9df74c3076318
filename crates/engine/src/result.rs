//! Per-run outcome map.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::StepError;

/// How a single step settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { value: Value },
    Failed { error: StepError },
    /// Not invoked because `upstream` failed or was itself skipped.
    Skipped { upstream: String },
}

impl StepOutcome {
    pub fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn failed(error: StepError) -> Self {
        Self::Failed { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success { value } => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StepError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Outcome of every step of one run.
///
/// Entries are only ever added; a settled step is never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    outcomes: HashMap<String, StepOutcome>,
    /// Step IDs in the order they settled.
    order: Vec<String>,
}

impl ExecutionResult {
    pub fn new(run_id: Uuid, workflow_id: impl Into<String>) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcomes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Record `step_id`'s outcome. Returns `false`, leaving the map
    /// untouched, if the step had already settled.
    pub fn record(&mut self, step_id: impl Into<String>, outcome: StepOutcome) -> bool {
        let step_id = step_id.into();
        if self.outcomes.contains_key(&step_id) {
            return false;
        }
        self.order.push(step_id.clone());
        self.outcomes.insert(step_id, outcome);
        true
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn get(&self, step_id: &str) -> Option<&StepOutcome> {
        self.outcomes.get(step_id)
    }

    /// The successful value of `step_id`, if any.
    pub fn value(&self, step_id: &str) -> Option<&Value> {
        self.get(step_id).and_then(StepOutcome::value)
    }

    pub fn is_settled(&self, step_id: &str) -> bool {
        self.outcomes.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// `true` when every recorded step succeeded.
    pub fn succeeded(&self) -> bool {
        self.outcomes.values().all(StepOutcome::is_success)
    }

    /// Failed steps with their causes, in settlement order.
    pub fn failures(&self) -> Vec<(String, StepError)> {
        self.outcomes()
            .filter_map(|(id, o)| o.error().map(|e| (id.to_owned(), e.clone())))
            .collect()
    }

    /// Step IDs skipped because of an upstream failure.
    pub fn skipped(&self) -> Vec<&str> {
        self.outcomes()
            .filter(|(_, o)| matches!(o, StepOutcome::Skipped { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    /// All outcomes in settlement order.
    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &StepOutcome)> {
        self.order
            .iter()
            .filter_map(|id| self.outcomes.get(id).map(|o| (id.as_str(), o)))
    }

    /// Successful values keyed by step ID.
    pub fn values(&self) -> serde_json::Map<String, Value> {
        self.outcomes()
            .filter_map(|(id, o)| o.value().map(|v| (id.to_owned(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settled_steps_are_never_overwritten() {
        let mut result = ExecutionResult::new(Uuid::new_v4(), "w");
        assert!(result.record("a", StepOutcome::success(json!(1))));
        assert!(!result.record("a", StepOutcome::success(json!(2))));
        assert_eq!(result.value("a"), Some(&json!(1)));
    }

    #[test]
    fn failures_and_skips_are_reported_in_settlement_order() {
        let mut result = ExecutionResult::new(Uuid::new_v4(), "w");
        result.record("ok", StepOutcome::success(json!(null)));
        result.record(
            "bad",
            StepOutcome::failed(StepError::Execution {
                step_id: "bad".into(),
                cause: "boom".into(),
                retryable: false,
            }),
        );
        result.record("later", StepOutcome::Skipped { upstream: "bad".into() });

        assert!(!result.succeeded());
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()[0].0, "bad");
        assert_eq!(result.skipped(), vec!["later"]);
        assert_eq!(
            result.outcomes().map(|(id, _)| id).collect::<Vec<_>>(),
            vec!["ok", "bad", "later"]
        );
        assert_eq!(result.values(), json!({ "ok": null }).as_object().cloned().unwrap());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let v = serde_json::to_value(StepOutcome::Skipped { upstream: "a".into() }).unwrap();
        assert_eq!(v, json!({ "status": "skipped", "upstream": "a" }));
    }
}
