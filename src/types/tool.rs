//! Tool calling definitions: what the model may invoke and how it asks

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Tool definition advertised to the model (function calling).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String, // "function"
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Tool invocation requested by the model.
///
/// `id` is an opaque correlator minted by the provider; the matching
/// tool-result message must echo it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String, // "function"
    pub function: FunctionCall,
}

/// The function half of a tool call. Arguments are kept as the raw JSON
/// bytes the vendor produced so they survive provider round-trips without
/// lossy re-encoding (integer vs float ambiguity, key ordering).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Box<RawValue>,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments_json: &str,
    ) -> crate::Result<Self> {
        Ok(Self {
            id: id.into(),
            kind: "function".to_string(),
            function: FunctionCall::new(name, arguments_json)?,
        })
    }
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments_json: &str) -> crate::Result<Self> {
        Ok(Self {
            name: name.into(),
            arguments: RawValue::from_string(arguments_json.to_string())?,
        })
    }

    /// Build from an already-parsed JSON value (e.g. Google's object args).
    pub fn from_value(
        name: impl Into<String>,
        arguments: &serde_json::Value,
    ) -> crate::Result<Self> {
        Ok(Self {
            name: name.into(),
            arguments: RawValue::from_string(serde_json::to_string(arguments)?)?,
        })
    }

    /// The raw argument JSON text.
    pub fn arguments_json(&self) -> &str {
        self.arguments.get()
    }

    /// Parse the arguments into a JSON value.
    pub fn arguments_value(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::from_str(self.arguments.get())?)
    }
}

impl PartialEq for FunctionCall {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.arguments.get() == other.arguments.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_round_trip_unchanged() {
        // Key order and number formatting must survive serialization.
        let raw = r#"{"b":1.50,"a":2}"#;
        let call = ToolCall::function("call_1", "add", raw).unwrap();
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains(r#"{"b":1.50,"a":2}"#));
        let back: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back.function.arguments_json(), raw);
    }

    #[test]
    fn test_definition_serialization() {
        let def = ToolDefinition::function(
            "lookup",
            "Look something up",
            serde_json::json!({"type": "object", "properties": {}}),
        );
        let v = serde_json::to_value(&def).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "lookup");
    }
}
