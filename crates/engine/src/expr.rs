//! Step argument values and reference expressions.
//!
//! An argument is either a literal JSON value or a reference to another
//! step's result, written `$result.<step-id>` or
//! `$result.<step-id>.<field>.<field>…`. References are parsed once, when the
//! argument is attached to a step, and only a whole top-level string value is
//! treated as a reference. Strings nested inside arrays/objects, or with the
//! marker embedded mid-string, stay literals.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix that marks a reference expression.
pub const REFERENCE_MARKER: &str = "$result.";

/// A step argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ArgValue {
    /// Passed to the action unchanged.
    Literal(Value),
    /// The whole result of `step_id`.
    StepRef { step_id: String },
    /// A nested field of `step_id`'s result. Each segment is an object key,
    /// or a decimal index when the current value is an array.
    FieldRef { step_id: String, path: Vec<String> },
}

impl ArgValue {
    /// Parse a raw JSON argument.
    pub fn parse(value: Value) -> Self {
        let Value::String(text) = &value else {
            return Self::Literal(value);
        };
        let Some(rest) = text.strip_prefix(REFERENCE_MARKER) else {
            return Self::Literal(value);
        };

        let mut segments = rest.split('.');
        let step_id = segments.next().unwrap_or_default().to_owned();
        let path: Vec<String> = segments.map(str::to_owned).collect();

        if path.is_empty() {
            Self::StepRef { step_id }
        } else {
            Self::FieldRef { step_id, path }
        }
    }

    /// The referenced step, if this is a reference.
    pub fn referenced_step(&self) -> Option<&str> {
        match self {
            Self::Literal(_) => None,
            Self::StepRef { step_id } | Self::FieldRef { step_id, .. } => Some(step_id),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.referenced_step().is_some()
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        Self::parse(value)
    }
}

impl From<ArgValue> for Value {
    fn from(arg: ArgValue) -> Self {
        match arg {
            ArgValue::Literal(v) => v,
            ArgValue::StepRef { step_id } => Value::String(format!("{REFERENCE_MARKER}{step_id}")),
            ArgValue::FieldRef { step_id, path } => {
                Value::String(format!("{REFERENCE_MARKER}{step_id}.{}", path.join(".")))
            }
        }
    }
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v: Value = self.clone().into();
        match v {
            Value::String(s) => f.write_str(&s),
            other => write!(f, "{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_values_are_literals() {
        assert_eq!(ArgValue::parse(json!(1)), ArgValue::Literal(json!(1)));
        assert_eq!(ArgValue::parse(json!("hello")), ArgValue::Literal(json!("hello")));
    }

    #[test]
    fn whole_result_reference() {
        assert_eq!(
            ArgValue::parse(json!("$result.fetch")),
            ArgValue::StepRef { step_id: "fetch".into() }
        );
    }

    #[test]
    fn field_reference_splits_path() {
        assert_eq!(
            ArgValue::parse(json!("$result.fetch.body.items.0")),
            ArgValue::FieldRef {
                step_id: "fetch".into(),
                path: vec!["body".into(), "items".into(), "0".into()],
            }
        );
    }

    #[test]
    fn nested_and_embedded_markers_stay_literal() {
        let nested = json!({ "x": "$result.a" });
        assert_eq!(ArgValue::parse(nested.clone()), ArgValue::Literal(nested));

        let embedded = json!("value is $result.a");
        assert_eq!(ArgValue::parse(embedded.clone()), ArgValue::Literal(embedded));
    }

    #[test]
    fn bare_marker_references_empty_id() {
        assert_eq!(ArgValue::parse(json!("$result.")).referenced_step(), Some(""));
    }

    #[test]
    fn serializes_back_to_text() {
        let arg = ArgValue::parse(json!("$result.a.b"));
        assert_eq!(serde_json::to_value(&arg).unwrap(), json!("$result.a.b"));
        assert_eq!(arg.to_string(), "$result.a.b");
    }
}
