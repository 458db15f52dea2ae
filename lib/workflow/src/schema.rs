//! Value types for node outputs and inputs.
//!
//! Nodes that declare their outputs get them checked after execution, and the
//! validator uses the declarations to reject selectors that read fields a
//! producer never emits.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The type of a variable as written in workflow definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VarType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "array")]
    Array,
    #[serde(rename = "array[string]")]
    ArrayString,
    #[serde(rename = "array[number]")]
    ArrayNumber,
    #[serde(rename = "array[object]")]
    ArrayObject,
    #[default]
    #[serde(rename = "any")]
    Any,
}

impl VarType {
    /// Returns true if `value` is an instance of this type.
    ///
    /// `null` is accepted everywhere; absence is checked separately.
    #[must_use]
    pub fn accepts(&self, value: &JsonValue) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::ArrayString => Self::all_items(value, JsonValue::is_string),
            Self::ArrayNumber => Self::all_items(value, JsonValue::is_number),
            Self::ArrayObject => Self::all_items(value, JsonValue::is_object),
        }
    }

    fn all_items(value: &JsonValue, check: fn(&JsonValue) -> bool) -> bool {
        value.as_array().is_some_and(|items| items.iter().all(check))
    }

    /// Returns true if values of `other` may flow into a slot of this type.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Number, Self::Integer) => true,
            (Self::Array, Self::ArrayString | Self::ArrayNumber | Self::ArrayObject) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::ArrayString => "array[string]",
            Self::ArrayNumber => "array[number]",
            Self::ArrayObject => "array[object]",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// A named output a node promises to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
}

impl OutputDecl {
    pub fn new(name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            name: name.into(),
            var_type,
        }
    }
}

/// Checks produced outputs against declarations.
///
/// Returns a description of the first mismatch.
pub fn check_outputs(
    decls: &[OutputDecl],
    outputs: &serde_json::Map<String, JsonValue>,
) -> Result<(), String> {
    for decl in decls {
        match outputs.get(&decl.name) {
            None => return Err(format!("missing declared output '{}'", decl.name)),
            Some(value) if !decl.var_type.accepts(value) => {
                return Err(format!(
                    "output '{}' expected {} but got {}",
                    decl.name, decl.var_type, value
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_matching_values() {
        assert!(VarType::String.accepts(&json!("hi")));
        assert!(!VarType::String.accepts(&json!(1)));
        assert!(VarType::Integer.accepts(&json!(3)));
        assert!(!VarType::Integer.accepts(&json!(3.5)));
        assert!(VarType::ArrayString.accepts(&json!(["a", "b"])));
        assert!(!VarType::ArrayString.accepts(&json!(["a", 1])));
        assert!(VarType::Object.accepts(&JsonValue::Null));
    }

    #[test]
    fn compatibility_is_lenient_for_any_and_numbers() {
        assert!(VarType::Any.is_compatible_with(&VarType::Object));
        assert!(VarType::Number.is_compatible_with(&VarType::Integer));
        assert!(!VarType::Integer.is_compatible_with(&VarType::Number));
        assert!(VarType::Array.is_compatible_with(&VarType::ArrayObject));
        assert!(!VarType::String.is_compatible_with(&VarType::Boolean));
    }

    #[test]
    fn check_outputs_reports_missing_and_mistyped() {
        let decls = vec![
            OutputDecl::new("text", VarType::String),
            OutputDecl::new("count", VarType::Number),
        ];

        let mut outputs = serde_json::Map::new();
        outputs.insert("text".into(), json!("ok"));
        let err = check_outputs(&decls, &outputs).unwrap_err();
        assert!(err.contains("count"));

        outputs.insert("count".into(), json!("seven"));
        let err = check_outputs(&decls, &outputs).unwrap_err();
        assert!(err.contains("expected number"));

        outputs.insert("count".into(), json!(7));
        assert!(check_outputs(&decls, &outputs).is_ok());
    }

    #[test]
    fn serde_uses_workflow_type_names() {
        let decl: OutputDecl =
            serde_json::from_str(r#"{"name": "items", "type": "array[object]"}"#).expect("valid");
        assert_eq!(decl.var_type, VarType::ArrayObject);
    }
}
