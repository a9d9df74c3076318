//! Parameter metadata captured when a tool is registered.
//!
//! Schemas are deliberately shallow: a list of named parameters, each with an
//! expected JSON shape and a required flag. Validation only looks at the
//! declared parameters; extra arguments are passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Args;

/// Expected JSON shape of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Int,
    Float,
    Str,
    Bool,
    Array,
    Object,
    Any,
}

impl ParamKind {
    /// Whether `value` has this shape. `Float` accepts any JSON number.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Str => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

/// Parameter metadata for one tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            params: Vec::new(),
        }
    }

    /// Declare a required parameter.
    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Declare an optional parameter.
    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check `args` against the declared parameters.
    ///
    /// Returns a human-readable reason for the first mismatch.
    pub fn check(&self, args: &Args) -> Result<(), String> {
        for param in &self.params {
            match args.get(&param.name) {
                None if param.required => {
                    return Err(format!("missing required parameter '{}'", param.name));
                }
                None => {}
                Some(value) if !param.kind.accepts(value) => {
                    return Err(format!(
                        "parameter '{}' expected {}, got {}",
                        param.name,
                        param.kind,
                        json_type_name(value)
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
