//! The `Action` trait: the contract every registered tool must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use crate::ToolError;

/// Keyword arguments handed to an action, already resolved by the engine.
pub type Args = serde_json::Map<String, Value>;

/// Per-invocation context passed alongside the arguments.
///
/// Defined here (in the tools crate) so both the engine and individual
/// action implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// ID of the run this invocation belongs to.
    pub run_id: uuid::Uuid,
    /// Step (or state) the action is executing for.
    pub step_id: String,
    /// 1-based attempt number; greater than 1 on retries.
    pub attempt: u32,
}

impl InvocationContext {
    pub fn new(run_id: uuid::Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            attempt: 1,
        }
    }
}

/// The core action trait.
///
/// Implementations receive the resolved keyword arguments of one step and
/// return that step's JSON result.
#[async_trait]
pub trait Action: Send + Sync {
    async fn invoke(&self, args: Args, ctx: &InvocationContext) -> Result<Value, ToolError>;
}
