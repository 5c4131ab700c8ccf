//! 函数注册表：本地工具与 MCP 远程工具的统一调用入口。
//!
//! Function registry. Binds named tools behind one calling contract:
//! native Rust functions registered from strongly typed signatures, and
//! MCP proxy entries whose invocation forwards the parsed argument map to
//! the owning subprocess session. Tool names are unique per registry; the
//! conversation loop resolves every model-emitted tool call here.

pub mod params;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::types::tool::ToolDefinition;
use crate::{Error, Result};

pub use params::{kind_from_schema_type, ParamKind, ToolParam, ToolReturn};

/// Successful-call prefix and the no-value fallback, kept bilingual-stable
/// because downstream prompts key off these exact strings.
const RESULT_PREFIX: &str = "函数返回: ";
const RESULT_EMPTY: &str = "函数执行完成";

/// Type-erased native callable: argument map in, rendered result out.
pub type NativeCallable =
    Arc<dyn Fn(&Map<String, Value>, &[String]) -> Result<Option<String>> + Send + Sync>;

/// Seam through which MCP proxy entries reach their subprocess session.
#[async_trait]
pub trait McpToolInvoker: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        remote_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String>;
}

/// Narrow capability handed to the MCP pool so it can publish tools
/// without owning the whole registry.
pub trait ToolRegistrar: Send + Sync {
    fn register_remote_tool(
        &self,
        name: String,
        definition: ToolDefinition,
        param_names: Vec<String>,
        server: String,
        remote_name: String,
        invoker: Arc<dyn McpToolInvoker>,
    ) -> Result<()>;
}

enum ToolBinding {
    Native(NativeCallable),
    Mcp {
        server: String,
        remote_name: String,
        invoker: Arc<dyn McpToolInvoker>,
    },
}

impl Clone for ToolBinding {
    fn clone(&self) -> Self {
        match self {
            ToolBinding::Native(f) => ToolBinding::Native(Arc::clone(f)),
            ToolBinding::Mcp {
                server,
                remote_name,
                invoker,
            } => ToolBinding::Mcp {
                server: server.clone(),
                remote_name: remote_name.clone(),
                invoker: Arc::clone(invoker),
            },
        }
    }
}

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    param_names: Vec<String>,
    param_kinds: Vec<ParamKind>,
    binding: ToolBinding,
}

struct RegistryInner {
    entries: HashMap<String, RegisteredTool>,
    /// Registration order, so advertised tool lists are stable.
    order: Vec<String>,
}

/// Conversion of a typed function into an erased tool callable plus its
/// parameter kinds. Implemented for `Fn` arities 0 through 8 over
/// [`ToolParam`] arguments and a [`ToolReturn`] result.
pub trait IntoTool<Args>: Send + Sync + 'static {
    fn param_kinds() -> Vec<ParamKind>;
    fn into_callable(self) -> NativeCallable;
}

macro_rules! impl_into_tool {
    ($($arg:ident),*) => {
        impl<F, R, $($arg),*> IntoTool<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: ToolReturn + 'static,
            $($arg: ToolParam + 'static,)*
        {
            fn param_kinds() -> Vec<ParamKind> {
                vec![$(<$arg as ToolParam>::kind()),*]
            }

            #[allow(unused_variables, unused_mut, unused_assignments, non_snake_case)]
            fn into_callable(self) -> NativeCallable {
                Arc::new(move |args: &Map<String, Value>, names: &[String]| {
                    let mut idx = 0usize;
                    $(
                        let name = names.get(idx).map(String::as_str).unwrap_or("");
                        let $arg = <$arg as ToolParam>::from_json(args.get(name))
                            .map_err(|e| match e {
                                Error::ArgumentType(msg) => Error::ArgumentType(
                                    format!("parameter '{}': {}", name, msg),
                                ),
                                other => other,
                            })?;
                        idx += 1;
                    )*
                    let rendered = (self)($($arg),*)
                        .into_result_text()
                        .map_err(Error::ToolExecution)?;
                    Ok(rendered)
                })
            }
        }
    };
}

impl_into_tool!();
impl_into_tool!(A1);
impl_into_tool!(A1, A2);
impl_into_tool!(A1, A2, A3);
impl_into_tool!(A1, A2, A3, A4);
impl_into_tool!(A1, A2, A3, A4, A5);
impl_into_tool!(A1, A2, A3, A4, A5, A6);
impl_into_tool!(A1, A2, A3, A4, A5, A6, A7);
impl_into_tool!(A1, A2, A3, A4, A5, A6, A7, A8);

fn build_schema(names: &[String], descriptions: &[String], kinds: &[ParamKind]) -> Value {
    let mut properties = Map::new();
    for ((name, description), kind) in names.iter().zip(descriptions).zip(kinds) {
        properties.insert(name.clone(), kind.schema_property(description));
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": names,
    })
}

/// Tool name to callable mapping shared between the conversation loop
/// (reader) and registration paths (writers).
pub struct FunctionRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Register a tool with auto-generated parameter names
    /// (`param0`, `param1`, ...).
    pub fn register_simple<Args, F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        F: IntoTool<Args>,
    {
        let kinds = F::param_kinds();
        let names: Vec<String> = (0..kinds.len()).map(|i| format!("param{i}")).collect();
        let descriptions: Vec<String> = kinds
            .iter()
            .enumerate()
            .map(|(i, k)| format!("参数 {} ({})", i, k.schema_type()))
            .collect();
        self.register_internal(name.into(), description.into(), f, names, descriptions)
    }

    /// Register a tool with caller-supplied parameter names and
    /// descriptions; both lists must match the function's arity.
    pub fn register<Args, F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
        param_names: &[&str],
        param_descriptions: &[&str],
    ) -> Result<()>
    where
        F: IntoTool<Args>,
    {
        let kinds = F::param_kinds();
        if param_names.len() != kinds.len() || param_descriptions.len() != kinds.len() {
            return Err(Error::configuration(format!(
                "parameter count mismatch: function takes {} parameters, got {} names and {} descriptions",
                kinds.len(),
                param_names.len(),
                param_descriptions.len()
            )));
        }
        self.register_internal(
            name.into(),
            description.into(),
            f,
            param_names.iter().map(|s| s.to_string()).collect(),
            param_descriptions.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn register_internal<Args, F>(
        &self,
        name: String,
        description: String,
        f: F,
        param_names: Vec<String>,
        param_descriptions: Vec<String>,
    ) -> Result<()>
    where
        F: IntoTool<Args>,
    {
        let kinds = F::param_kinds();
        let definition = ToolDefinition::function(
            name.clone(),
            description,
            build_schema(&param_names, &param_descriptions, &kinds),
        );
        let tool = RegisteredTool {
            definition,
            param_names,
            param_kinds: kinds,
            binding: ToolBinding::Native(f.into_callable()),
        };
        self.insert(name, tool);
        Ok(())
    }

    /// Patch the parameter names and descriptions in a registered tool's
    /// schema, leaving the callable untouched.
    pub fn modify_descriptions(
        &self,
        name: &str,
        param_names: &[&str],
        param_descriptions: &[&str],
    ) -> Result<()> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let tool = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        if param_names.len() != tool.param_kinds.len()
            || param_descriptions.len() != tool.param_kinds.len()
        {
            return Err(Error::configuration(format!(
                "parameter count mismatch: function has {} parameters, got {} names and {} descriptions",
                tool.param_kinds.len(),
                param_names.len(),
                param_descriptions.len()
            )));
        }
        let names: Vec<String> = param_names.iter().map(|s| s.to_string()).collect();
        let descriptions: Vec<String> = param_descriptions.iter().map(|s| s.to_string()).collect();
        tool.definition.function.parameters =
            build_schema(&names, &descriptions, &tool.param_kinds);
        tool.param_names = names;
        Ok(())
    }

    fn insert(&self, name: String, tool: RegisteredTool) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.entries.contains_key(&name) {
            inner.order.push(name.clone());
        }
        inner.entries.insert(name, tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .entries
            .contains_key(name)
    }

    /// Advertised tool definitions in registration order.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name))
            .map(|t| t.definition.clone())
            .collect()
    }

    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .entries
            .get(name)
            .map(|t| t.definition.clone())
    }

    /// Invoke a tool by name with its raw argument JSON.
    ///
    /// Native tools coerce arguments by stored parameter name; MCP tools
    /// get the parsed map forwarded unchanged. The read lock is released
    /// before any blocking invocation.
    pub async fn call(&self, name: &str, arguments_json: &str) -> Result<String> {
        let (binding, param_names) = {
            let inner = self.inner.read().expect("registry lock poisoned");
            let tool = inner
                .entries
                .get(name)
                .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
            (tool.binding.clone(), tool.param_names.clone())
        };

        let args = parse_arguments(arguments_json)?;

        match binding {
            ToolBinding::Native(callable) => match callable(&args, &param_names)? {
                Some(text) => Ok(format!("{RESULT_PREFIX}{text}")),
                None => Ok(RESULT_EMPTY.to_string()),
            },
            ToolBinding::Mcp {
                server,
                remote_name,
                invoker,
            } => invoker.call_tool(&server, &remote_name, args).await,
        }
    }
}

impl ToolRegistrar for FunctionRegistry {
    fn register_remote_tool(
        &self,
        name: String,
        definition: ToolDefinition,
        param_names: Vec<String>,
        server: String,
        remote_name: String,
        invoker: Arc<dyn McpToolInvoker>,
    ) -> Result<()> {
        let param_kinds = definition
            .function
            .parameters
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| {
                param_names
                    .iter()
                    .map(|n| {
                        props
                            .get(n)
                            .and_then(|p| p.get("type"))
                            .and_then(|t| t.as_str())
                            .map(kind_from_schema_type)
                            .unwrap_or(ParamKind::String)
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.insert(
            name,
            RegisteredTool {
                definition,
                param_names,
                param_kinds,
                binding: ToolBinding::Mcp {
                    server,
                    remote_name,
                    invoker,
                },
            },
        );
        Ok(())
    }
}

/// Decode tool-call arguments. Accepts a JSON object directly, or a JSON
/// string containing an object (some providers double-encode arguments).
fn parse_arguments(arguments_json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Map<String, Value>>(arguments_json) {
        Ok(map) => Ok(map),
        Err(first) => {
            if let Ok(inner) = serde_json::from_str::<String>(arguments_json) {
                if let Ok(map) = serde_json::from_str::<Map<String, Value>>(&inner) {
                    return Ok(map);
                }
            }
            Err(Error::ArgumentParse(first.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: i64, b: i64) -> i64 {
        a + b
    }

    #[tokio::test]
    async fn test_register_simple_auto_names() {
        let registry = FunctionRegistry::new();
        registry.register_simple("add", "Add two numbers", add).unwrap();

        let def = registry.definition("add").unwrap();
        let props = &def.function.parameters["properties"];
        assert_eq!(props["param0"]["type"], "integer");
        assert_eq!(props["param1"]["type"], "integer");
        assert_eq!(def.function.parameters["required"][0], "param0");

        let result = registry
            .call("add", r#"{"param0":787,"param1":859}"#)
            .await
            .unwrap();
        assert_eq!(result, "函数返回: 1646");
    }

    #[tokio::test]
    async fn test_register_with_named_params() {
        let registry = FunctionRegistry::new();
        registry
            .register(
                "add",
                "Add two numbers",
                add,
                &["a", "b"],
                &["first addend", "second addend"],
            )
            .unwrap();
        let result = registry.call("add", r#"{"a":1,"b":2}"#).await.unwrap();
        assert_eq!(result, "函数返回: 3");
    }

    #[test]
    fn test_register_arity_mismatch() {
        let registry = FunctionRegistry::new();
        let err = registry
            .register("add", "Add", add, &["a"], &["only one"])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_argument_uses_zero_value() {
        let registry = FunctionRegistry::new();
        registry.register_simple("add", "Add", add).unwrap();
        let result = registry.call("add", r#"{"param0":5}"#).await.unwrap();
        assert_eq!(result, "函数返回: 5");
    }

    #[tokio::test]
    async fn test_double_encoded_arguments() {
        let registry = FunctionRegistry::new();
        registry.register_simple("add", "Add", add).unwrap();
        let doubled = serde_json::to_string(r#"{"param0":1,"param1":2}"#).unwrap();
        let result = registry.call("add", &doubled).await.unwrap();
        assert_eq!(result, "函数返回: 3");
    }

    #[tokio::test]
    async fn test_unparseable_arguments() {
        let registry = FunctionRegistry::new();
        registry.register_simple("add", "Add", add).unwrap();
        let err = registry.call("add", "not json").await.unwrap_err();
        assert!(matches!(err, Error::ArgumentParse(_)));
    }

    #[tokio::test]
    async fn test_argument_type_mismatch_names_parameter() {
        let registry = FunctionRegistry::new();
        registry.register_simple("add", "Add", add).unwrap();
        let err = registry
            .call("add", r#"{"param0":"x","param1":2}"#)
            .await
            .unwrap_err();
        match err {
            Error::ArgumentType(msg) => assert!(msg.contains("param0")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        let err = registry.call("missing", "{}").await.unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(_)));
    }

    #[tokio::test]
    async fn test_unit_return_renders_completion_text() {
        let registry = FunctionRegistry::new();
        registry
            .register_simple("noop", "Do nothing", |_: String| {})
            .unwrap();
        let result = registry.call("noop", r#"{"param0":"x"}"#).await.unwrap();
        assert_eq!(result, RESULT_EMPTY);
    }

    #[tokio::test]
    async fn test_error_return_fails_call() {
        let registry = FunctionRegistry::new();
        registry
            .register_simple("fail", "Always fails", |_: String| -> Result<String> {
                Err(Error::ToolExecution("disk on fire".to_string()))
            })
            .unwrap();
        let err = registry.call("fail", r#"{"param0":"x"}"#).await.unwrap_err();
        match err {
            Error::ToolExecution(msg) => assert!(msg.contains("ERROR:")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_modify_descriptions_keeps_callable() {
        let registry = FunctionRegistry::new();
        registry.register_simple("add", "Add", add).unwrap();
        registry
            .modify_descriptions("add", &["x", "y"], &["left", "right"])
            .unwrap();
        let def = registry.definition("add").unwrap();
        assert_eq!(
            def.function.parameters["properties"]["x"]["description"],
            "left"
        );
        // Calls now resolve by the new names.
        let result = registry.call("add", r#"{"x":2,"y":3}"#).await.unwrap();
        assert_eq!(result, "函数返回: 5");
    }

    #[tokio::test]
    async fn test_composite_return_rendered_as_json() {
        let registry = FunctionRegistry::new();
        registry
            .register_simple("list", "List things", |n: i64| -> Vec<i64> {
                (0..n).collect()
            })
            .unwrap();
        let result = registry.call("list", r#"{"param0":3}"#).await.unwrap();
        assert_eq!(result, "函数返回: [0,1,2]");
    }

    #[tokio::test]
    async fn test_tools_listed_in_registration_order() {
        let registry = FunctionRegistry::new();
        registry.register_simple("b_tool", "B", add).unwrap();
        registry.register_simple("a_tool", "A", add).unwrap();
        let names: Vec<String> = registry
            .tools()
            .into_iter()
            .map(|t| t.function.name)
            .collect();
        assert_eq!(names, vec!["b_tool", "a_tool"]);
    }
}
