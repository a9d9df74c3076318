//! `MockAction`, a test double for `Action`.
//!
//! Useful in unit and integration tests where a real tool implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::{Action, Args, InvocationContext, ToolError};

/// Behaviour injected into `MockAction` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Return the received arguments as a JSON object.
    EchoArgs,
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `n` calls, then return the value.
    FlakyThenReturn(u32, Value),
    /// Wait on a shared barrier before returning the value.
    AwaitBarrier(Arc<tokio::sync::Barrier>, Value),
    /// Panic inside the action.
    Panic(String),
}

/// A mock action that records every call it receives and returns a
/// programmer-specified result.
pub struct MockAction {
    /// Label used in test assertions.
    pub name: String,
    /// What the action will do when `invoke` is called.
    pub behaviour: MockBehaviour,
    /// All arguments seen by this action (in call order).
    pub calls: Arc<Mutex<Vec<Args>>>,
    failures_left: AtomicU32,
}

impl MockAction {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        let failures_left = match &behaviour {
            MockBehaviour::FlakyThenReturn(n, _) => *n,
            _ => 0,
        };
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures_left: AtomicU32::new(failures_left),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that returns its arguments.
    pub fn echoing(name: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::EchoArgs)
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `times` times with a `Retryable` error, then succeeds.
    pub fn flaky(name: impl Into<String>, times: u32, value: Value) -> Self {
        Self::with(name, MockBehaviour::FlakyThenReturn(times, value))
    }

    /// Create a mock that only returns once `barrier` has been reached by
    /// all of its participants.
    pub fn awaiting(name: impl Into<String>, barrier: Arc<tokio::sync::Barrier>, value: Value) -> Self {
        Self::with(name, MockBehaviour::AwaitBarrier(barrier, value))
    }

    /// Create a mock that panics when invoked.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Panic(msg.into()))
    }

    /// Number of times this action has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Arguments of the most recent call.
    pub fn last_args(&self) -> Option<Args> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Action for MockAction {
    async fn invoke(&self, args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push(args.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::EchoArgs => Ok(Value::Object(args)),
            MockBehaviour::FailRetryable(msg) => Err(ToolError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ToolError::Fatal(msg.clone())),
            MockBehaviour::FlakyThenReturn(_, v) => {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    Err(ToolError::Retryable(format!("{} not ready", self.name)))
                } else {
                    Ok(v.clone())
                }
            }
            MockBehaviour::AwaitBarrier(barrier, v) => {
                barrier.wait().await;
                Ok(v.clone())
            }
            MockBehaviour::Panic(msg) => panic!("{}", msg),
        }
    }
}
