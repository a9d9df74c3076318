//! Explicit tool registry: action name → constructor + parameter metadata.
//!
//! The registry is a plain value built by the caller and passed by reference
//! into every engine entry point. Tools registered through [`ToolRegistry::register`]
//! are stored as constructors (`fn() -> Arc<dyn Action>`), so a fresh worker
//! process can rebuild an identical registry by calling the same setup code.
//! Tools registered with [`ToolRegistry::register_shared`] wrap a live instance
//! and only work in-process.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Action, RegistryError, ToolSchema};

/// Builds a fresh action instance. Plain function pointers cannot capture
/// caller-local state, which keeps them reconstructible in another process.
pub type ActionConstructor = fn() -> Arc<dyn Action>;

#[derive(Clone)]
enum Factory {
    Constructor(ActionConstructor),
    Shared(Arc<dyn Action>),
}

/// Source code of an action's implementation for a remote orchestrator.
///
/// `code` must define a callable named `entrypoint` that accepts the step's
/// arguments as keyword arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSource {
    pub entrypoint: String,
    pub code: String,
}

impl RemoteSource {
    pub fn new(entrypoint: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            code: code.into(),
        }
    }
}

/// Returned by registration; identifies the registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolHandle {
    name: String,
}

impl ToolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
struct ToolEntry {
    factory: Factory,
    schema: Arc<ToolSchema>,
    remote: Option<Arc<RemoteSource>>,
}

/// A looked-up tool, ready to invoke.
#[derive(Clone)]
pub struct ResolvedTool {
    pub name: String,
    pub action: Arc<dyn Action>,
    pub schema: Arc<ToolSchema>,
    /// `true` when the tool was registered by constructor and can be rebuilt
    /// by name in a separate worker process.
    pub portable: bool,
}

impl std::fmt::Debug for ResolvedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedTool")
            .field("name", &self.name)
            .field("portable", &self.portable)
            .finish_non_exhaustive()
    }
}

/// Maps action names to tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool by constructor. Re-registering a name replaces it.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: ActionConstructor,
        schema: ToolSchema,
    ) -> ToolHandle {
        self.insert(name.into(), Factory::Constructor(constructor), schema, None)
    }

    /// Register a tool by constructor together with the implementation used
    /// when the workflow is delegated to a remote orchestrator.
    pub fn register_with_remote(
        &mut self,
        name: impl Into<String>,
        constructor: ActionConstructor,
        schema: ToolSchema,
        source: RemoteSource,
    ) -> ToolHandle {
        self.insert(
            name.into(),
            Factory::Constructor(constructor),
            schema,
            Some(Arc::new(source)),
        )
    }

    /// Register a live, shared instance. Such tools cannot cross a process
    /// boundary.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        action: Arc<dyn Action>,
        schema: ToolSchema,
    ) -> ToolHandle {
        self.insert(name.into(), Factory::Shared(action), schema, None)
    }

    fn insert(
        &mut self,
        name: String,
        factory: Factory,
        schema: ToolSchema,
        remote: Option<Arc<RemoteSource>>,
    ) -> ToolHandle {
        let entry = ToolEntry {
            factory,
            schema: Arc::new(schema),
            remote,
        };
        if self.tools.insert(name.clone(), entry).is_some() {
            debug!(tool = %name, "replaced existing tool registration");
        }
        ToolHandle { name }
    }

    /// Attach the implementation used when the workflow is delegated to a
    /// remote orchestrator.
    pub fn attach_remote_source(
        &mut self,
        handle: &ToolHandle,
        source: RemoteSource,
    ) -> Result<(), RegistryError> {
        let entry = self
            .tools
            .get_mut(&handle.name)
            .ok_or_else(|| RegistryError::UnknownAction(handle.name.clone()))?;
        entry.remote = Some(Arc::new(source));
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        self.tools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UnknownAction(name.to_owned()))
    }

    /// Look up `name` and produce an invokable instance.
    ///
    /// # Errors
    /// [`RegistryError::UnknownAction`] if nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<ResolvedTool, RegistryError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAction(name.to_owned()))?;

        let (action, portable) = match &entry.factory {
            Factory::Constructor(ctor) => (ctor(), true),
            Factory::Shared(action) => (Arc::clone(action), false),
        };

        Ok(ResolvedTool {
            name: name.to_owned(),
            action,
            schema: Arc::clone(&entry.schema),
            portable,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.get(name).map(|e| e.schema.as_ref())
    }

    pub fn remote_source(&self, name: &str) -> Option<&RemoteSource> {
        self.tools.get(name).and_then(|e| e.remote.as_deref())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAction;
    use crate::{Args, InvocationContext, ParamKind};
    use serde_json::json;

    fn answer() -> Arc<dyn Action> {
        Arc::new(MockAction::returning("answer", json!(42)))
    }

    #[test]
    fn unknown_action_is_reported_by_name() {
        let registry = ToolRegistry::new();
        let err = registry.resolve("nope").unwrap_err();
        assert_eq!(err, RegistryError::UnknownAction("nope".into()));
    }

    #[test]
    fn constructor_tools_are_portable_shared_ones_are_not() {
        let mut registry = ToolRegistry::new();
        registry.register("answer", answer, ToolSchema::default());
        registry.register_shared(
            "live",
            Arc::new(MockAction::returning("live", json!(1))),
            ToolSchema::default(),
        );

        assert!(registry.resolve("answer").unwrap().portable);
        assert!(!registry.resolve("live").unwrap().portable);
    }

    #[tokio::test]
    async fn resolved_tool_invokes_its_action() {
        let mut registry = ToolRegistry::new();
        registry.register("answer", answer, ToolSchema::default());

        let tool = registry.resolve("answer").unwrap();
        let ctx = InvocationContext::new(uuid::Uuid::new_v4(), "s");
        let out = tool.action.invoke(Args::new(), &ctx).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn schema_and_remote_source_are_kept_per_tool() {
        let mut registry = ToolRegistry::new();
        let handle = registry.register(
            "answer",
            answer,
            ToolSchema::new("the answer").required("q", ParamKind::Str),
        );
        registry
            .attach_remote_source(&handle, RemoteSource::new("answer", "def answer(**kw):\n    return 42\n"))
            .unwrap();

        assert_eq!(registry.schema("answer").unwrap().params.len(), 1);
        assert_eq!(registry.remote_source("answer").unwrap().entrypoint, "answer");
        assert_eq!(registry.names(), vec!["answer".to_string()]);
    }

    #[test]
    fn remote_source_can_be_given_at_registration() {
        let mut registry = ToolRegistry::new();
        let handle = registry.register_with_remote(
            "answer",
            answer,
            ToolSchema::default(),
            RemoteSource::new("answer", "def answer(**kw):\n    return 42\n"),
        );

        assert_eq!(registry.remote_source("answer").unwrap().entrypoint, "answer");
        assert!(registry.resolve("answer").unwrap().portable);

        registry.unregister("answer").unwrap();
        let err = registry
            .attach_remote_source(&handle, RemoteSource::new("answer", ""))
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownAction("answer".into()));
    }

    #[test]
    fn unregister_removes_the_tool() {
        let mut registry = ToolRegistry::new();
        registry.register("answer", answer, ToolSchema::default());
        registry.unregister("answer").unwrap();
        assert!(!registry.contains("answer"));
        assert!(registry.unregister("answer").is_err());
    }
}
