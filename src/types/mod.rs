//! Canonical type system shared by every provider adapter

pub mod events;
pub mod message;
pub mod request;
pub mod tool;

pub use events::StreamChunk;
pub use message::{ContentPart, ImageDetail, ImageUrl, Message, Role};
pub use request::{ChatRequest, ChatResponse, Choice, Usage};
pub use tool::{FunctionCall, FunctionDefinition, ToolCall, ToolDefinition};
