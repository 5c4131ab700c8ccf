//! MCP 客户端池：子进程工具服务器的连接与工具联邦。
//!
//! MCP client pool. Spawns MCP servers as stdio subprocesses via the rmcp
//! SDK, discovers their tool inventory, and publishes each remote tool
//! into the function registry under the collision-proof name
//! `mcp_<server>_<tool>`. Invocations forward the parsed argument map
//! straight to the owning session; the session read lock is released
//! before the blocking call.

pub mod config;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::{Peer, RoleClient, RunningService},
    transport::TokioChildProcess,
    ServiceExt,
};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::registry::{kind_from_schema_type, McpToolInvoker, ParamKind, ToolRegistrar};
use crate::types::tool::ToolDefinition;
use crate::{Error, Result};

pub use config::{default_config, write_template, McpConfig, McpServerConfig, McpServerSettings};

const EMPTY_TOOL_OUTPUT: &str = "工具执行完成";

/// A remote tool discovered from an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: Option<Value>,
}

/// One schema parameter of a remote tool.
#[derive(Debug, Clone)]
struct McpParamInfo {
    name: String,
    kind: ParamKind,
    description: String,
    required: bool,
}

struct McpSession {
    service: RunningService<RoleClient, ()>,
}

type SessionMap = Arc<RwLock<HashMap<String, McpSession>>>;

/// Pool of live MCP server sessions.
pub struct McpPool {
    sessions: SessionMap,
    tools: RwLock<HashMap<String, McpToolInfo>>,
    registrar: Arc<dyn ToolRegistrar>,
    cancel: CancellationToken,
}

impl McpPool {
    /// Create a pool that publishes discovered tools through `registrar`.
    pub fn new(registrar: Arc<dyn ToolRegistrar>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tools: RwLock::new(HashMap::new()),
            registrar,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn and connect one MCP server, then register its tools.
    pub async fn add_server(&self, config: &McpServerConfig) -> Result<()> {
        match config.transport.as_str() {
            "stdio" => {}
            "tcp" => return Err(Error::mcp("tcp transport not implemented")),
            other => {
                return Err(Error::configuration(format!(
                    "unsupported transport: {other}"
                )))
            }
        }
        if config.command.is_empty() {
            return Err(Error::configuration(
                "stdio transport requires a command",
            ));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&config.name) {
            return Err(Error::configuration(format!(
                "MCP server {} already exists",
                config.name
            )));
        }

        let mut cmd = Command::new(&config.command[0]);
        cmd.args(&config.command[1..]);
        cmd.args(&config.args);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| Error::mcp(format!("failed to spawn MCP server {}: {e}", config.name)))?;

        let service = tokio::select! {
            r = ().serve(transport) => r.map_err(|e| {
                Error::mcp(format!("MCP server {} handshake failed: {e}", config.name))
            })?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        let remote_tools = service
            .list_all_tools()
            .await
            .map_err(|e| Error::mcp(format!("failed to list tools from {}: {e}", config.name)))?;

        let mut registered = 0usize;
        let mut tool_infos = self.tools.write().await;
        for tool in &remote_tools {
            // Deep-copy the schema so later mutations on the session side
            // cannot alias into registered definitions.
            let input_schema = serde_json::to_value(&*tool.input_schema).ok();

            let info = McpToolInfo {
                server_name: config.name.clone(),
                tool_name: tool.name.to_string(),
                description: tool
                    .description
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                input_schema: input_schema.clone(),
            };

            let unique_name = format!("mcp_{}_{}", config.name, tool.name);
            let params = parse_schema_params(input_schema.as_ref());
            let definition = build_tool_definition(&unique_name, &info.description, &params);
            let param_names: Vec<String> = params.iter().map(|p| p.name.clone()).collect();

            let invoker: Arc<dyn McpToolInvoker> = Arc::new(PoolInvoker {
                sessions: Arc::clone(&self.sessions),
            });
            if let Err(e) = self.registrar.register_remote_tool(
                unique_name.clone(),
                definition,
                param_names,
                config.name.clone(),
                info.tool_name.clone(),
                invoker,
            ) {
                tracing::warn!("failed to register tool {unique_name}: {e}");
                continue;
            }

            tool_infos.insert(unique_name, info);
            registered += 1;
        }
        drop(tool_infos);

        sessions.insert(config.name.clone(), McpSession { service });
        tracing::info!(
            "MCP server {} connected, registered {} of {} tools",
            config.name,
            registered,
            remote_tools.len()
        );
        Ok(())
    }

    /// Close one server's session and drop its pool entries.
    ///
    /// Tool definitions already published to the function registry stay
    /// registered; subsequent invocations fail with a missing-session
    /// error.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::mcp(format!("MCP server {name} does not exist")))?;

        if let Err(e) = session.service.cancel().await {
            tracing::warn!("error closing MCP server {name}: {e}");
        }

        self.tools
            .write()
            .await
            .retain(|_, info| info.server_name != name);
        tracing::info!("MCP server {name} removed");
        Ok(())
    }

    /// Connect every server in a config, in order. Individual failures are
    /// logged and skipped; the batch fails only when every server fails.
    pub async fn connect_config(&self, config: &McpConfig) -> Result<usize> {
        let servers = config.all_servers();
        let total = servers.len();
        let mut connected = 0usize;
        let mut failures: Vec<String> = Vec::new();

        for server in &servers {
            match self.add_server(server).await {
                Ok(()) => connected += 1,
                Err(e) => {
                    tracing::warn!("failed to connect MCP server {}: {e}", server.name);
                    failures.push(format!("{}: {e}", server.name));
                }
            }
        }

        tracing::info!("connected {connected}/{total} MCP servers");
        if connected == 0 && !failures.is_empty() {
            return Err(Error::mcp(format!(
                "all MCP servers failed to connect: {}",
                failures.join("; ")
            )));
        }
        Ok(connected)
    }

    /// All registered remote tools, keyed by their namespaced name.
    pub async fn tools(&self) -> HashMap<String, McpToolInfo> {
        self.tools.read().await.clone()
    }

    /// Per-server registered tool counts.
    pub async fn status(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for info in self.tools.read().await.values() {
            *counts.entry(info.server_name.clone()).or_default() += 1;
        }
        counts
    }

    /// Cancel the shared context and close every session, aggregating
    /// failures.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();

        let sessions: Vec<(String, McpSession)> =
            self.sessions.write().await.drain().collect();
        let mut failures: Vec<String> = Vec::new();
        for (name, session) in sessions {
            if let Err(e) = session.service.cancel().await {
                failures.push(format!("closing {name} failed: {e}"));
            }
        }
        self.tools.write().await.clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::mcp(failures.join("; ")))
        }
    }
}

/// Invoker handle shared by every registered proxy entry of this pool.
struct PoolInvoker {
    sessions: SessionMap,
}

#[async_trait]
impl McpToolInvoker for PoolInvoker {
    async fn call_tool(
        &self,
        server: &str,
        remote_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String> {
        // Look up under the read lock, release before the blocking call.
        let peer: Peer<RoleClient> = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(server)
                .ok_or_else(|| Error::mcp(format!("MCP session {server} does not exist")))?;
            session.service.peer().clone()
        };

        let params = CallToolRequestParam {
            name: remote_name.to_string().into(),
            arguments: if arguments.is_empty() {
                None
            } else {
                Some(arguments)
            },
        };

        let result = peer
            .call_tool(params)
            .await
            .map_err(|e| Error::mcp(format!("MCP tool call failed: {e}")))?;

        let text: String = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if result.is_error == Some(true) {
            return Err(Error::mcp(format!("tool reported error: {text}")));
        }
        if text.is_empty() {
            return Ok(EMPTY_TOOL_OUTPUT.to_string());
        }
        Ok(text)
    }
}

/// Walk a JSON-Schema object's `properties` (in sorted name order, so
/// registration is deterministic) cross-referencing `required`.
fn parse_schema_params(schema: Option<&Value>) -> Vec<McpParamInfo> {
    let Some(schema) = schema else {
        return Vec::new();
    };
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Vec::new();
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut names: Vec<&String> = properties.keys().collect();
    names.sort();

    names
        .into_iter()
        .filter_map(|name| {
            let prop = properties.get(name)?.as_object()?;
            let kind = prop
                .get("type")
                .and_then(|t| t.as_str())
                .map(kind_from_schema_type)
                .unwrap_or(ParamKind::String);
            let description = prop
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or(name)
                .to_string();
            Some(McpParamInfo {
                name: name.clone(),
                kind,
                description,
                required: required.contains(&name.as_str()),
            })
        })
        .collect()
}

/// Build the advertised definition from all parameters, with `required`
/// listing only the schema-required ones.
fn build_tool_definition(name: &str, description: &str, params: &[McpParamInfo]) -> ToolDefinition {
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();
    for param in params {
        properties.insert(
            param.name.clone(),
            param.kind.schema_property(&param.description),
        );
        if param.required {
            required.push(param.name.clone());
        }
    }
    ToolDefinition::function(
        name,
        description,
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionRegistry;

    fn pool() -> McpPool {
        McpPool::new(Arc::new(FunctionRegistry::new()))
    }

    #[tokio::test]
    async fn test_tcp_transport_not_implemented() {
        let config = McpServerConfig {
            name: "db".to_string(),
            command: Vec::new(),
            args: Vec::new(),
            address: Some("localhost:9000".to_string()),
            transport: "tcp".to_string(),
            env: HashMap::new(),
        };
        let err = pool().add_server(&config).await.unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[tokio::test]
    async fn test_unknown_transport_rejected() {
        let config = McpServerConfig {
            name: "x".to_string(),
            command: vec!["x".to_string()],
            args: Vec::new(),
            address: None,
            transport: "pigeon".to_string(),
            env: HashMap::new(),
        };
        assert!(pool().add_server(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_stdio_requires_command() {
        let config = McpServerConfig {
            name: "x".to_string(),
            command: Vec::new(),
            args: Vec::new(),
            address: None,
            transport: "stdio".to_string(),
            env: HashMap::new(),
        };
        assert!(pool().add_server(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_unknown_server() {
        assert!(pool().remove_server("ghost").await.is_err());
    }

    #[test]
    fn test_schema_params_sorted_and_required() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "zeta": {"type": "integer", "description": "z"},
                "alpha": {"type": "string"},
                "mid": {"type": "boolean", "description": "m"}
            },
            "required": ["zeta"]
        });
        let params = parse_schema_params(Some(&schema));
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(params[2].required);
        assert!(!params[0].required);
        // A missing description falls back to the parameter name.
        assert_eq!(params[0].description, "alpha");
        assert_eq!(params[2].kind, ParamKind::Integer);
    }

    #[test]
    fn test_tool_definition_keeps_optional_params_in_schema() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "file path"},
                "limit": {"type": "integer", "description": "max entries"}
            },
            "required": ["path"]
        });
        let params = parse_schema_params(Some(&schema));
        let def = build_tool_definition("mcp_files_read", "Read a file", &params);
        let schema = &def.function.parameters;
        assert!(schema["properties"].get("limit").is_some());
        assert_eq!(schema["required"].as_array().unwrap().len(), 1);
        assert_eq!(schema["required"][0], "path");
        assert_eq!(def.function.name, "mcp_files_read");
    }

    #[test]
    fn test_empty_schema_yields_no_params() {
        assert!(parse_schema_params(None).is_empty());
        let schema = serde_json::json!({"type": "object"});
        assert!(parse_schema_params(Some(&schema)).is_empty());
    }
}
