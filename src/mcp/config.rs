//! MCP server configuration file loading and validation.
//!
//! Two JSON shapes are accepted: a full `servers` array, and the
//! `mcpServers` object shape used by popular MCP tooling, which implies
//! stdio transport with `command` plus `args`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One MCP server connection descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// "stdio" or "tcp".
    pub transport: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Server entry in the `mcpServers` convenience shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSettings {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<McpServerConfig>,
    #[serde(default, rename = "mcpServers", skip_serializing_if = "HashMap::is_empty")]
    pub mcp_servers: HashMap<String, McpServerSettings>,
}

impl McpConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref()).map_err(|e| {
            Error::configuration(format!(
                "cannot read MCP config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_slice(&data)
    }

    /// Parse and validate configuration bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let config: McpConfig = serde_json::from_slice(data)
            .map_err(|e| Error::configuration(format!("invalid MCP config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() && self.mcp_servers.is_empty() {
            return Err(Error::configuration("MCP config defines no servers"));
        }

        let mut seen: HashMap<&str, ()> = HashMap::new();
        for (i, server) in self.servers.iter().enumerate() {
            if server.name.is_empty() {
                return Err(Error::configuration(format!("server {i} has no name")));
            }
            if seen.insert(&server.name, ()).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            match server.transport.as_str() {
                "stdio" => {
                    if server.command.is_empty() {
                        return Err(Error::configuration(format!(
                            "server {}: stdio transport requires a command",
                            server.name
                        )));
                    }
                }
                "tcp" => {
                    if server.address.as_deref().unwrap_or("").is_empty() {
                        return Err(Error::configuration(format!(
                            "server {}: tcp transport requires an address",
                            server.name
                        )));
                    }
                }
                other => {
                    return Err(Error::configuration(format!(
                        "server {}: unsupported transport: {other}",
                        server.name
                    )));
                }
            }
        }

        for (name, settings) in &self.mcp_servers {
            if name.is_empty() {
                return Err(Error::configuration("mcpServers entry has an empty name"));
            }
            if seen.insert(name, ()).is_some() {
                return Err(Error::configuration(format!("duplicate server name: {name}")));
            }
            if settings.command.is_empty() {
                return Err(Error::configuration(format!("server {name}: missing command")));
            }
        }

        Ok(())
    }

    /// Flatten both shapes into the full descriptor form, `servers` first,
    /// `mcpServers` sorted by name for a stable connect order.
    pub fn all_servers(&self) -> Vec<McpServerConfig> {
        let mut out = self.servers.clone();
        let mut named: Vec<_> = self.mcp_servers.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        for (name, settings) in named {
            out.push(McpServerConfig {
                name: name.clone(),
                command: vec![settings.command.clone()],
                args: settings.args.clone(),
                address: None,
                transport: "stdio".to_string(),
                env: HashMap::new(),
            });
        }
        out
    }

    /// Write the configuration as pretty JSON.
    ///
    /// Parent directories are not created; callers create them first.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path.as_ref(), data).map_err(|e| {
            Error::configuration(format!(
                "cannot write MCP config {}: {e}",
                path.as_ref().display()
            ))
        })
    }
}

/// A starter configuration showing both transports.
pub fn default_config() -> McpConfig {
    McpConfig {
        servers: vec![
            McpServerConfig {
                name: "example_stdio".to_string(),
                command: vec!["python".to_string(), "example_server.py".to_string()],
                args: Vec::new(),
                address: None,
                transport: "stdio".to_string(),
                env: HashMap::new(),
            },
            McpServerConfig {
                name: "example_tcp".to_string(),
                command: Vec::new(),
                args: Vec::new(),
                address: Some("localhost:8080".to_string()),
                transport: "tcp".to_string(),
                env: HashMap::new(),
            },
        ],
        mcp_servers: HashMap::new(),
    }
}

/// Write the starter template to `path`.
pub fn write_template(path: impl AsRef<Path>) -> Result<()> {
    default_config().save(path)
}
