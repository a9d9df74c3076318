//! Tool-level error types.

use thiserror::Error;

/// Errors returned by an action's `invoke` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: the step is re-invoked with exponential back-off.
/// - `Fatal`:     the step is immediately recorded as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Transient failure; the engine should re-try the step.
    #[error("retryable tool error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal tool error: {0}")]
    Fatal(String),
}

impl ToolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The bare message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }
}

/// Lookup failures against a [`crate::ToolRegistry`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no action registered under '{0}'")]
    UnknownAction(String),
}
