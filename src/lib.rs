//! # agentry
//!
//! Vendor-agnostic conversational agent runtime. One canonical message
//! model that round-trips through OpenAI, Anthropic, Google Gemini,
//! DeepSeek and Qwen wire formats, a tool-calling conversation loop with
//! unit-safe history truncation, and a function registry that federates
//! native Rust tools with tools discovered from MCP subprocess servers.

pub mod conversation;
pub mod dispatch;
pub mod drivers;
pub mod history;
pub mod mcp;
pub mod registry;
pub mod transport;
pub mod types;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

// Re-export main types for convenience
pub use conversation::{ChatOutcome, Conversation, ConversationLimits, FinishReason};
pub use dispatch::{ChatBackend, ProviderConfig, ProviderDispatcher};
pub use drivers::Provider;
pub use mcp::{McpPool, McpServerConfig};
pub use registry::FunctionRegistry;
pub use types::{
    message::{ContentPart, Message, Role},
    request::{ChatRequest, ChatResponse, Usage},
    tool::{ToolCall, ToolDefinition},
};

/// Error type for the library
pub mod error;
pub use error::Error;
