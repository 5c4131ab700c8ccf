//! Typed tool parameters and return values.
//!
//! Bridges strongly typed Rust function signatures to the JSON world of
//! tool calling: each parameter type knows its JSON-Schema kind and how to
//! coerce itself out of a decoded argument value, and each return type
//! knows how to render itself into the tool-result text.

use std::collections::HashMap;

use serde_json::Value;

use crate::{Error, Result};

/// JSON-Schema parameter kind derived from a Rust parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Bool,
    Integer,
    Number,
    String,
    Array(Box<ParamKind>),
    Object,
}

impl ParamKind {
    pub fn schema_type(&self) -> &'static str {
        match self {
            ParamKind::Bool => "boolean",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::String => "string",
            ParamKind::Array(_) => "array",
            ParamKind::Object => "object",
        }
    }

    /// Build the JSON-Schema property object for this kind.
    pub fn schema_property(&self, description: &str) -> Value {
        let mut prop = serde_json::json!({
            "type": self.schema_type(),
            "description": description,
        });
        if let ParamKind::Array(element) = self {
            prop["items"] = serde_json::json!({ "type": element.schema_type() });
        }
        prop
    }
}

/// A type usable as a tool parameter.
///
/// `from_json` receives the argument value looked up by parameter name;
/// a missing key (`None`) coerces to the type's zero value, mirroring how
/// absent arguments are treated throughout the tool contract.
pub trait ToolParam: Sized + Send {
    fn kind() -> ParamKind;
    fn from_json(value: Option<&Value>) -> Result<Self>;
}

macro_rules! integer_tool_param {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToolParam for $ty {
                fn kind() -> ParamKind {
                    ParamKind::Integer
                }

                fn from_json(value: Option<&Value>) -> Result<Self> {
                    match value {
                        None => Ok(0),
                        // JSON numbers are floating in canonical JSON;
                        // narrow to the declared width.
                        Some(Value::Number(n)) => {
                            let f = n.as_f64().ok_or_else(|| {
                                Error::ArgumentType(format!(
                                    "number {n} does not fit {}",
                                    stringify!($ty)
                                ))
                            })?;
                            Ok(f as $ty)
                        }
                        Some(other) => Err(Error::ArgumentType(format!(
                            "expected {} got {other}",
                            stringify!($ty)
                        ))),
                    }
                }
            }
        )*
    };
}

integer_tool_param!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! float_tool_param {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToolParam for $ty {
                fn kind() -> ParamKind {
                    ParamKind::Number
                }

                fn from_json(value: Option<&Value>) -> Result<Self> {
                    match value {
                        None => Ok(0.0),
                        Some(Value::Number(n)) => {
                            let f = n.as_f64().ok_or_else(|| {
                                Error::ArgumentType(format!("number {n} is not a float"))
                            })?;
                            Ok(f as $ty)
                        }
                        Some(other) => Err(Error::ArgumentType(format!(
                            "expected {} got {other}",
                            stringify!($ty)
                        ))),
                    }
                }
            }
        )*
    };
}

float_tool_param!(f32, f64);

impl ToolParam for bool {
    fn kind() -> ParamKind {
        ParamKind::Bool
    }

    fn from_json(value: Option<&Value>) -> Result<Self> {
        match value {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(Error::ArgumentType(format!("expected bool got {other}"))),
        }
    }
}

impl ToolParam for String {
    fn kind() -> ParamKind {
        ParamKind::String
    }

    fn from_json(value: Option<&Value>) -> Result<Self> {
        match value {
            None => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(Error::ArgumentType(format!("expected string got {other}"))),
        }
    }
}

impl<T: ToolParam> ToolParam for Vec<T> {
    fn kind() -> ParamKind {
        ParamKind::Array(Box::new(T::kind()))
    }

    fn from_json(value: Option<&Value>) -> Result<Self> {
        match value {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| T::from_json(Some(item)))
                .collect(),
            Some(other) => Err(Error::ArgumentType(format!("expected array got {other}"))),
        }
    }
}

impl ToolParam for HashMap<String, Value> {
    fn kind() -> ParamKind {
        ParamKind::Object
    }

    fn from_json(value: Option<&Value>) -> Result<Self> {
        match value {
            None => Ok(HashMap::new()),
            Some(Value::Object(map)) => {
                Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            Some(other) => Err(Error::ArgumentType(format!("expected object got {other}"))),
        }
    }
}

/// A type usable as a tool return value.
///
/// `Ok(None)` means the function produced no value; `Err` carries the
/// failure text that makes the whole call fail.
pub trait ToolReturn: Send {
    fn into_result_text(self) -> std::result::Result<Option<String>, String>;
}

impl ToolReturn for () {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        Ok(None)
    }
}

impl ToolReturn for String {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        Ok(Some(self))
    }
}

impl ToolReturn for &'static str {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        Ok(Some(self.to_string()))
    }
}

impl ToolReturn for bool {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        Ok(Some(if self { "true" } else { "false" }.to_string()))
    }
}

macro_rules! display_tool_return {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToolReturn for $ty {
                fn into_result_text(self) -> std::result::Result<Option<String>, String> {
                    Ok(Some(self.to_string()))
                }
            }
        )*
    };
}

display_tool_return!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! float_tool_return {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToolReturn for $ty {
                fn into_result_text(self) -> std::result::Result<Option<String>, String> {
                    Ok(Some(format!("{:.6}", self)))
                }
            }
        )*
    };
}

float_tool_return!(f32, f64);

impl ToolReturn for Value {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        match serde_json::to_string(&self) {
            Ok(s) => Ok(Some(s)),
            Err(e) => Err(format!("ERROR: {e}")),
        }
    }
}

impl<T: serde::Serialize + Send> ToolReturn for Vec<T> {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        match serde_json::to_string(&self) {
            Ok(s) => Ok(Some(s)),
            Err(e) => Err(format!("ERROR: {e}")),
        }
    }
}

impl<T: serde::Serialize + Send> ToolReturn for HashMap<String, T> {
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        match serde_json::to_string(&self) {
            Ok(s) => Ok(Some(s)),
            Err(e) => Err(format!("ERROR: {e}")),
        }
    }
}

impl<T: ToolReturn, E: std::fmt::Display> ToolReturn for std::result::Result<T, E>
where
    E: Send,
{
    fn into_result_text(self) -> std::result::Result<Option<String>, String> {
        match self {
            Ok(v) => v.into_result_text(),
            Err(e) => Err(format!("ERROR: {e}")),
        }
    }
}

/// Map a JSON-Schema type string to a parameter kind; unknown types fall
/// back to string, matching how loosely MCP servers declare schemas.
pub fn kind_from_schema_type(schema_type: &str) -> ParamKind {
    match schema_type {
        "boolean" => ParamKind::Bool,
        "integer" => ParamKind::Integer,
        "number" => ParamKind::Number,
        "array" => ParamKind::Array(Box::new(ParamKind::String)),
        "object" => ParamKind::Object,
        _ => ParamKind::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_narrowing_from_float_json() {
        let v = serde_json::json!(787.0);
        assert_eq!(i64::from_json(Some(&v)).unwrap(), 787);
        assert_eq!(u8::from_json(Some(&serde_json::json!(200))).unwrap(), 200);
    }

    #[test]
    fn test_missing_values_become_zero_values() {
        assert_eq!(i32::from_json(None).unwrap(), 0);
        assert_eq!(String::from_json(None).unwrap(), "");
        assert!(!bool::from_json(None).unwrap());
        assert!(Vec::<String>::from_json(None).unwrap().is_empty());
    }

    #[test]
    fn test_type_mismatches_rejected() {
        assert!(bool::from_json(Some(&serde_json::json!("yes"))).is_err());
        assert!(String::from_json(Some(&serde_json::json!(1))).is_err());
        assert!(i64::from_json(Some(&serde_json::json!("1"))).is_err());
    }

    #[test]
    fn test_array_element_coercion() {
        let v = serde_json::json!([1, 2, 3]);
        assert_eq!(Vec::<i64>::from_json(Some(&v)).unwrap(), vec![1, 2, 3]);
        let bad = serde_json::json!([1, "two"]);
        assert!(Vec::<i64>::from_json(Some(&bad)).is_err());
    }

    #[test]
    fn test_array_schema_carries_items() {
        let prop = ParamKind::Array(Box::new(ParamKind::Integer)).schema_property("nums");
        assert_eq!(prop["type"], "array");
        assert_eq!(prop["items"]["type"], "integer");
    }

    #[test]
    fn test_result_return_maps_error_arm() {
        let ok: std::result::Result<i64, String> = Ok(7);
        assert_eq!(ok.into_result_text().unwrap(), Some("7".to_string()));
        let err: std::result::Result<i64, String> = Err("boom".to_string());
        assert_eq!(err.into_result_text().unwrap_err(), "ERROR: boom");
    }

    #[test]
    fn test_float_return_formatting() {
        assert_eq!(
            2.5f64.into_result_text().unwrap(),
            Some("2.500000".to_string())
        );
    }

    #[test]
    fn test_schema_type_fallback() {
        assert_eq!(kind_from_schema_type("unknown"), ParamKind::String);
        assert_eq!(kind_from_schema_type("integer"), ParamKind::Integer);
    }
}
