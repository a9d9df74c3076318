//! Guard engine: synchronous predicates run before and after each action.
//!
//! Pre-guards see the resolved arguments, post-guards see the returned value.
//! For every step the global guards run first, then the step's own guards,
//! each list in registration order. The first violation short-circuits.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tools::{Args, ToolRegistry, ToolSchema};
use tracing::debug;

use crate::error::{GuardError, GuardPhase};

/// Verdict of a single guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Pass,
    Violation(Option<String>),
}

impl GuardOutcome {
    /// `Pass` when `ok`, otherwise a violation carrying `reason`.
    pub fn require(ok: bool, reason: impl Into<String>) -> Self {
        if ok {
            Self::Pass
        } else {
            Self::Violation(Some(reason.into()))
        }
    }
}

impl From<bool> for GuardOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Pass
        } else {
            Self::Violation(None)
        }
    }
}

/// What a guard knows about the invocation it is checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardContext {
    /// Step ID, or state ID when guarding a state machine action.
    pub step_id: String,
    pub action: String,
}

impl GuardContext {
    pub fn new(step_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            action: action.into(),
        }
    }
}

/// Checks a step's resolved arguments before the action runs.
pub trait PreGuard: Send + Sync {
    fn check(&self, ctx: &GuardContext, args: &Args) -> GuardOutcome;
}

/// Checks a step's result after the action returns.
pub trait PostGuard: Send + Sync {
    fn check(&self, ctx: &GuardContext, value: &Value) -> GuardOutcome;
}

impl<F> PreGuard for F
where
    F: Fn(&GuardContext, &Args) -> GuardOutcome + Send + Sync,
{
    fn check(&self, ctx: &GuardContext, args: &Args) -> GuardOutcome {
        self(ctx, args)
    }
}

impl<F> PostGuard for F
where
    F: Fn(&GuardContext, &Value) -> GuardOutcome + Send + Sync,
{
    fn check(&self, ctx: &GuardContext, value: &Value) -> GuardOutcome {
        self(ctx, value)
    }
}

// ---------------------------------------------------------------------------
// GuardsRegistry
// ---------------------------------------------------------------------------

/// Pre/post guards keyed by step ID, plus global guards for every step.
#[derive(Clone, Default)]
pub struct GuardsRegistry {
    global_pre: Vec<Arc<dyn PreGuard>>,
    global_post: Vec<Arc<dyn PostGuard>>,
    pre: HashMap<String, Vec<Arc<dyn PreGuard>>>,
    post: HashMap<String, Vec<Arc<dyn PostGuard>>>,
}

impl GuardsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre(&mut self, step_id: impl Into<String>, guard: impl PreGuard + 'static) -> &mut Self {
        self.pre.entry(step_id.into()).or_default().push(Arc::new(guard));
        self
    }

    pub fn add_post(&mut self, step_id: impl Into<String>, guard: impl PostGuard + 'static) -> &mut Self {
        self.post.entry(step_id.into()).or_default().push(Arc::new(guard));
        self
    }

    pub fn add_global_pre(&mut self, guard: impl PreGuard + 'static) -> &mut Self {
        self.global_pre.push(Arc::new(guard));
        self
    }

    pub fn add_global_post(&mut self, guard: impl PostGuard + 'static) -> &mut Self {
        self.global_post.push(Arc::new(guard));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.global_pre.is_empty()
            && self.global_post.is_empty()
            && self.pre.values().all(Vec::is_empty)
            && self.post.values().all(Vec::is_empty)
    }

    /// Whether any guard would run for `step_id`.
    pub fn guards(&self, step_id: &str) -> bool {
        !self.global_pre.is_empty()
            || !self.global_post.is_empty()
            || self.pre.get(step_id).is_some_and(|g| !g.is_empty())
            || self.post.get(step_id).is_some_and(|g| !g.is_empty())
    }

    /// Run every applicable pre-guard against `args`.
    ///
    /// # Errors
    /// [`GuardError`] with [`GuardPhase::Pre`] on the first violation.
    pub fn run_pre(&self, ctx: &GuardContext, args: &Args) -> Result<(), GuardError> {
        let scoped = self.pre.get(&ctx.step_id).into_iter().flatten();
        for guard in self.global_pre.iter().chain(scoped) {
            if let GuardOutcome::Violation(reason) = guard.check(ctx, args) {
                debug!(step_id = %ctx.step_id, ?reason, "pre-guard violation");
                return Err(GuardError {
                    step_id: ctx.step_id.clone(),
                    phase: GuardPhase::Pre,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Run every applicable post-guard against `value`.
    ///
    /// # Errors
    /// [`GuardError`] with [`GuardPhase::Post`] on the first violation.
    pub fn run_post(&self, ctx: &GuardContext, value: &Value) -> Result<(), GuardError> {
        let scoped = self.post.get(&ctx.step_id).into_iter().flatten();
        for guard in self.global_post.iter().chain(scoped) {
            if let GuardOutcome::Violation(reason) = guard.check(ctx, value) {
                debug!(step_id = %ctx.step_id, ?reason, "post-guard violation");
                return Err(GuardError {
                    step_id: ctx.step_id.clone(),
                    phase: GuardPhase::Post,
                    reason,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GuardsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardsRegistry")
            .field("global_pre", &self.global_pre.len())
            .field("global_post", &self.global_post.len())
            .field("pre", &self.pre.keys().collect::<Vec<_>>())
            .field("post", &self.post.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SchemaGuard
// ---------------------------------------------------------------------------

/// Global pre-guard that checks arguments against each action's registered
/// parameter schema. Actions without a schema pass.
#[derive(Debug, Clone, Default)]
pub struct SchemaGuard {
    schemas: HashMap<String, ToolSchema>,
}

impl SchemaGuard {
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        let schemas = registry
            .names()
            .into_iter()
            .filter_map(|name| registry.schema(&name).cloned().map(|s| (name, s)))
            .collect();
        Self { schemas }
    }
}

impl PreGuard for SchemaGuard {
    fn check(&self, ctx: &GuardContext, args: &Args) -> GuardOutcome {
        match self.schemas.get(&ctx.action).map(|s| s.check(args)) {
            Some(Err(reason)) => GuardOutcome::Violation(Some(reason)),
            _ => GuardOutcome::Pass,
        }
    }
}
