//! Built-in actions shipped with flowgraph.
//!
//! [`registry`] is the canonical way to get a registry containing them; the
//! `flowgraph worker` sub-command calls it to rebuild the same registry in
//! every worker process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    Action, Args, InvocationContext, ParamKind, RemoteSource, ToolError, ToolRegistry, ToolSchema,
};

/// Returns its `value` argument unchanged.
pub struct Const;

#[async_trait]
impl Action for Const {
    async fn invoke(&self, mut args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        Ok(args.remove("value").unwrap_or(Value::Null))
    }
}

/// Returns all of its arguments as an object.
pub struct Echo;

#[async_trait]
impl Action for Echo {
    async fn invoke(&self, args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        Ok(Value::Object(args))
    }
}

#[derive(Clone, Copy)]
enum Op {
    Add,
    Multiply,
}

/// Binary arithmetic over `a` and `b`. Integer inputs give an integer result.
pub struct Arithmetic(Op);

impl Arithmetic {
    pub fn add() -> Self {
        Self(Op::Add)
    }

    pub fn multiply() -> Self {
        Self(Op::Multiply)
    }
}

fn operand(args: &Args, key: &str) -> Result<Value, ToolError> {
    match args.get(key) {
        Some(v) if v.is_number() => Ok(v.clone()),
        Some(other) => Err(ToolError::Fatal(format!(
            "'{key}' must be a number, got {other}"
        ))),
        None => Err(ToolError::Fatal(format!("missing argument '{key}'"))),
    }
}

#[async_trait]
impl Action for Arithmetic {
    async fn invoke(&self, args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let a = operand(&args, "a")?;
        let b = operand(&args, "b")?;

        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            let out = match self.0 {
                Op::Add => x.checked_add(y),
                Op::Multiply => x.checked_mul(y),
            };
            return out
                .map(Value::from)
                .ok_or_else(|| ToolError::Fatal("integer overflow".into()));
        }

        let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
        let out = match self.0 {
            Op::Add => x + y,
            Op::Multiply => x * y,
        };
        Ok(json!(out))
    }
}

/// Joins `parts` into one string, separated by `sep` (default empty).
pub struct Concat;

#[async_trait]
impl Action for Concat {
    async fn invoke(&self, args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let parts = args
            .get("parts")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::Fatal("'parts' must be an array".into()))?;
        let sep = args.get("sep").and_then(Value::as_str).unwrap_or("");

        let joined = parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(sep);
        Ok(Value::String(joined))
    }
}

/// Sleeps for `ms` milliseconds and returns the duration slept.
pub struct Sleep;

#[async_trait]
impl Action for Sleep {
    async fn invoke(&self, args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    }
}

/// Always fails with a fatal error carrying `message`.
pub struct Fail;

#[async_trait]
impl Action for Fail {
    async fn invoke(&self, args: Args, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let msg = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("failed on purpose");
        Err(ToolError::Fatal(msg.to_owned()))
    }
}

fn const_action() -> Arc<dyn Action> {
    Arc::new(Const)
}
fn echo_action() -> Arc<dyn Action> {
    Arc::new(Echo)
}
fn add_action() -> Arc<dyn Action> {
    Arc::new(Arithmetic::add())
}
fn multiply_action() -> Arc<dyn Action> {
    Arc::new(Arithmetic::multiply())
}
fn concat_action() -> Arc<dyn Action> {
    Arc::new(Concat)
}
fn sleep_action() -> Arc<dyn Action> {
    Arc::new(Sleep)
}
fn fail_action() -> Arc<dyn Action> {
    Arc::new(Fail)
}

/// A registry containing every built-in action, each with its parameter
/// schema and a Python implementation for remote orchestration.
pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    install(&mut registry);
    registry
}

/// Add the built-in actions to an existing registry.
pub fn install(registry: &mut ToolRegistry) {
    let builtins: [(&str, fn() -> Arc<dyn Action>, ToolSchema, &str); 7] = [
        (
            "const",
            const_action,
            ToolSchema::new("return the `value` argument").optional("value", ParamKind::Any),
            "def flowgraph_const(value=None, **kwargs):\n    return value\n",
        ),
        (
            "echo",
            echo_action,
            ToolSchema::new("return all arguments as an object"),
            "def flowgraph_echo(**kwargs):\n    return kwargs\n",
        ),
        (
            "add",
            add_action,
            ToolSchema::new("a + b")
                .required("a", ParamKind::Float)
                .required("b", ParamKind::Float),
            "def flowgraph_add(a, b, **kwargs):\n    return a + b\n",
        ),
        (
            "multiply",
            multiply_action,
            ToolSchema::new("a * b")
                .required("a", ParamKind::Float)
                .required("b", ParamKind::Float),
            "def flowgraph_multiply(a, b, **kwargs):\n    return a * b\n",
        ),
        (
            "concat",
            concat_action,
            ToolSchema::new("join parts with sep")
                .required("parts", ParamKind::Array)
                .optional("sep", ParamKind::Str),
            "def flowgraph_concat(parts, sep=\"\", **kwargs):\n    return sep.join(p if isinstance(p, str) else str(p) for p in parts)\n",
        ),
        (
            "sleep",
            sleep_action,
            ToolSchema::new("sleep for ms milliseconds").optional("ms", ParamKind::Int),
            "def flowgraph_sleep(ms=0, **kwargs):\n    import time\n    time.sleep(ms / 1000.0)\n    return ms\n",
        ),
        (
            "fail",
            fail_action,
            ToolSchema::new("always fail").optional("message", ParamKind::Str),
            "def flowgraph_fail(message=\"failed on purpose\", **kwargs):\n    raise RuntimeError(message)\n",
        ),
    ];

    for (name, ctor, schema, code) in builtins {
        let source = RemoteSource::new(format!("flowgraph_{name}"), code);
        registry.register_with_remote(name, ctor, schema, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InvocationContext {
        InvocationContext::new(uuid::Uuid::new_v4(), "t")
    }

    fn args(v: Value) -> Args {
        v.as_object().cloned().unwrap()
    }

    async fn call(name: &str, a: Value) -> Result<Value, ToolError> {
        let tool = registry().resolve(name).unwrap();
        tool.action.invoke(args(a), &ctx()).await
    }

    #[tokio::test]
    async fn add_keeps_integers_integral() {
        assert_eq!(call("add", json!({ "a": 1, "b": 2 })).await.unwrap(), json!(3));
        assert_eq!(call("add", json!({ "a": 1.5, "b": 2 })).await.unwrap(), json!(3.5));
    }

    #[tokio::test]
    async fn multiply_rejects_non_numbers() {
        let err = call("multiply", json!({ "a": "x", "b": 2 })).await.unwrap_err();
        assert!(matches!(err, ToolError::Fatal(_)));
    }

    #[tokio::test]
    async fn concat_joins_mixed_parts() {
        let out = call("concat", json!({ "parts": ["a", 1, true], "sep": "-" }))
            .await
            .unwrap();
        assert_eq!(out, json!("a-1-true"));
    }

    #[tokio::test]
    async fn const_and_echo() {
        assert_eq!(call("const", json!({ "value": [1] })).await.unwrap(), json!([1]));
        assert_eq!(call("echo", json!({ "x": 1 })).await.unwrap(), json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn fail_is_fatal_with_message() {
        let err = call("fail", json!({ "message": "nope" })).await.unwrap_err();
        assert_eq!(err, ToolError::Fatal("nope".into()));
    }

    #[test]
    fn every_builtin_is_portable_and_has_remote_source() {
        let registry = registry();
        for name in registry.names() {
            assert!(registry.resolve(&name).unwrap().portable, "{name}");
            let src = registry.remote_source(&name).unwrap();
            assert!(src.code.contains(&format!("def {}(", src.entrypoint)), "{name}");
        }
    }
}
