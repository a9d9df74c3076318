//! Worker side of the process backend.
//!
//! A worker reads exactly one [`WorkerRequest`] (JSON) from its input,
//! invokes the named action from a registry it built itself, and writes one
//! [`WorkerResponse`] (JSON, newline-terminated) to its output. Nothing else
//! may be written to the output stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tools::{Args, InvocationContext, ToolRegistry};
use tracing::{debug, warn};
use uuid::Uuid;

fn first_attempt() -> u32 {
    1
}

/// One step invocation sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub run_id: Uuid,
    pub step_id: String,
    pub action: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

/// The worker's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok { value: Value },
    Error { message: String, retryable: bool },
}

impl WorkerResponse {
    fn fatal(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Handle a single request from `reader`, answering on `writer`.
///
/// Request-level problems (malformed JSON, unknown action, action failure)
/// are reported in the response. Only I/O failures on the streams
/// themselves are returned as errors.
pub async fn serve<R, W>(registry: &ToolRegistry, mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = Vec::new();
    reader.read_to_end(&mut input).await?;

    let response = match serde_json::from_slice::<WorkerRequest>(&input) {
        Ok(request) => handle(registry, request).await,
        Err(err) => {
            warn!(error = %err, "malformed worker request");
            WorkerResponse::fatal(format!("malformed request: {err}"))
        }
    };

    let mut payload = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await
}

async fn handle(registry: &ToolRegistry, request: WorkerRequest) -> WorkerResponse {
    let tool = match registry.resolve(&request.action) {
        Ok(tool) => tool,
        Err(err) => return WorkerResponse::fatal(err.to_string()),
    };

    let ctx = InvocationContext {
        run_id: request.run_id,
        step_id: request.step_id,
        attempt: request.attempt,
    };
    debug!(step_id = %ctx.step_id, action = %request.action, attempt = ctx.attempt, "worker invoking action");

    match tool.action.invoke(request.args, &ctx).await {
        Ok(value) => WorkerResponse::Ok { value },
        Err(err) => WorkerResponse::Error {
            message: err.message().to_owned(),
            retryable: err.is_retryable(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn round(request: &[u8]) -> Value {
        let registry = tools::builtin::registry();
        let mut out = Vec::new();
        serve(&registry, request, &mut out).await.unwrap();
        assert_eq!(out.last(), Some(&b'\n'));
        serde_json::from_slice(&out).unwrap()
    }

    fn request(action: &str, args: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "run_id": Uuid::nil(),
            "step_id": "s",
            "action": action,
            "args": args,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn successful_invocation_returns_ok() {
        let out = round(&request("add", json!({ "a": 2, "b": 3 }))).await;
        assert_eq!(out, json!({ "status": "ok", "value": 5 }));
    }

    #[tokio::test]
    async fn action_failure_is_reported_not_raised() {
        let out = round(&request("fail", json!({ "message": "nope" }))).await;
        assert_eq!(out["status"], "error");
        assert_eq!(out["retryable"], false);
        assert!(out["message"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn unknown_action_and_garbage_input_are_errors() {
        let out = round(&request("ghost", json!({}))).await;
        assert_eq!(out["status"], "error");
        assert!(out["message"].as_str().unwrap().contains("ghost"));

        let out = round(b"not json").await;
        assert_eq!(out["status"], "error");
    }
}
