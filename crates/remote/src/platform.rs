//! The narrow interface the delegated backend needs from an orchestrator.

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RemoteError;

/// A generated workflow file in the orchestrator's native format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// ID the orchestrator will know the workflow by.
    pub dag_id: String,
    pub file_name: String,
    pub source: String,
}

/// Coarse state of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RemoteRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Map an Airflow DAG-run `state`. Anything that is not `success` or
    /// `failed` (queued, running, restarting, …) counts as still running.
    pub fn from_airflow_state(state: &str) -> Self {
        match state {
            "success" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

impl std::fmt::Display for RemoteRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RemoteRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown remote run status: '{other}'")),
        }
    }
}

/// Operations the delegated backend performs against an orchestrator.
#[async_trait]
pub trait RemotePlatform: Send + Sync {
    /// Make `artifact` available and ready to trigger.
    async fn submit_artifact(&self, artifact: &Artifact) -> Result<(), RemoteError>;

    /// Start a run and return its remote ID.
    async fn trigger_run(&self, dag_id: &str, conf: &Value) -> Result<String, RemoteError>;

    async fn run_status(&self, dag_id: &str, run_id: &str) -> Result<RemoteRunStatus, RemoteError>;

    /// The value `step_id` returned in `run_id`, if it produced one.
    async fn task_output(
        &self,
        dag_id: &str,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Value>, RemoteError>;
}

/// Best-effort decode of a remotely produced value: text that parses as
/// JSON becomes that JSON, anything else stays the raw string.
pub fn decode_output(raw: Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn airflow_states_map_onto_three_statuses() {
        assert_eq!(RemoteRunStatus::from_airflow_state("success"), RemoteRunStatus::Succeeded);
        assert_eq!(RemoteRunStatus::from_airflow_state("failed"), RemoteRunStatus::Failed);
        for s in ["queued", "running", "restarting", ""] {
            assert_eq!(RemoteRunStatus::from_airflow_state(s), RemoteRunStatus::Running);
        }
    }

    #[test]
    fn status_display_round_trips() {
        for status in [RemoteRunStatus::Running, RemoteRunStatus::Succeeded, RemoteRunStatus::Failed] {
            assert_eq!(status.to_string().parse::<RemoteRunStatus>(), Ok(status));
        }
        assert!("done".parse::<RemoteRunStatus>().is_err());
    }

    #[test]
    fn decode_prefers_json_and_falls_back_to_text() {
        assert_eq!(decode_output(json!("{\"a\": 1}")), json!({ "a": 1 }));
        assert_eq!(decode_output(json!("42")), json!(42));
        assert_eq!(decode_output(json!("{'a': 1}")), json!("{'a': 1}"));
        assert_eq!(decode_output(json!([1, 2])), json!([1, 2]));
    }
}
