//! 对话驱动器：多轮工具调用循环与历史回滚。
//!
//! Conversation driver. Owns the transcript, the function registry and
//! the MCP pool, and runs the outer loop per user turn: truncate history,
//! append the user message, call the provider, execute any tool calls,
//! feed results back, repeat until the assistant stops calling tools or
//! the per-turn budget runs out. Any error rolls the transcript back to
//! its pre-turn state.
//!
//! A single `Conversation` is not safe for concurrent `chat` calls;
//! callers serialise turns per conversation.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::dispatch::ChatBackend;
use crate::drivers::Provider;
use crate::history::History;
use crate::mcp::{McpConfig, McpPool, McpServerConfig, McpToolInfo};
use crate::registry::{FunctionRegistry, IntoTool, ToolRegistrar};
use crate::types::message::{ContentPart, ImageDetail, Message, Role};
use crate::types::request::{ChatRequest, Usage};
use crate::types::tool::{ToolCall, ToolDefinition};
use crate::{Error, Result};

const TOOL_ERROR_PREFIX: &str = "函数执行错误: ";

/// Outcome label of a completed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The assistant returned a message without tool calls.
    Success,
    /// The per-turn tool invocation budget was exhausted.
    MaxFunctionCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Success => "success",
            FinishReason::MaxFunctionCalls => "max_function_calling_nums",
        }
    }
}

/// Per-conversation budgets and generation parameters.
#[derive(Debug, Clone)]
pub struct ConversationLimits {
    /// Tool invocations allowed within one `chat` call.
    pub max_function_calls: u32,
    /// Stored for callers that want to track it; the loop itself does not
    /// consult this value.
    pub max_chat_messages: u32,
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_history_tokens: usize,
    pub truncation_enabled: bool,
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self {
            max_function_calls: 15,
            max_chat_messages: 0,
            max_tokens: 5000,
            temperature: 0.7,
            max_history_tokens: 100_000,
            truncation_enabled: true,
        }
    }
}

/// Everything a finished turn reports back.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The messages this turn appended, in order.
    pub messages: Vec<Message>,
    pub finish_reason: FinishReason,
    /// Usage accumulated over the conversation's lifetime.
    pub usage: Usage,
}

pub struct Conversation {
    backend: Arc<dyn ChatBackend>,
    history: History,
    system_prompt: String,
    registry: Arc<FunctionRegistry>,
    mcp: McpPool,
    pub limits: ConversationLimits,
    last_usage: Usage,
    total_usage: Usage,
}

impl Conversation {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        let registry = Arc::new(FunctionRegistry::new());
        let registrar: Arc<dyn ToolRegistrar> = registry.clone();
        Self {
            backend,
            history: History::new(),
            system_prompt: String::new(),
            registry,
            mcp: McpPool::new(registrar),
            limits: ConversationLimits::default(),
            last_usage: Usage::default(),
            total_usage: Usage::default(),
        }
    }

    // -- configuration ------------------------------------------------------

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_max_function_calls(&mut self, max: u32) {
        self.limits.max_function_calls = max;
    }

    /// Stored but never consulted by the loop.
    pub fn set_max_chat_messages(&mut self, max: u32) {
        self.limits.max_chat_messages = max;
    }

    pub fn set_max_tokens(&mut self, max: u32) {
        self.limits.max_tokens = max;
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.limits.temperature = temperature;
    }

    pub fn set_max_history_tokens(&mut self, max: usize) {
        self.limits.max_history_tokens = max;
    }

    pub fn set_truncation_enabled(&mut self, enabled: bool) {
        self.limits.truncation_enabled = enabled;
    }

    // -- history ------------------------------------------------------------

    pub fn add_message(&mut self, role: Role, content: Vec<ContentPart>) {
        self.history.push(Message::new(role, content));
    }

    pub fn add_full_message(&mut self, message: Message) {
        self.history.push(message);
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn last_usage(&self) -> Usage {
        self.last_usage
    }

    pub fn total_usage(&self) -> Usage {
        self.total_usage
    }

    // -- tools --------------------------------------------------------------

    /// Register a tool with auto-named parameters.
    pub fn register_function_simple<Args, F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        F: IntoTool<Args>,
    {
        self.registry.register_simple(name, description, f)
    }

    /// Register a tool with named, described parameters.
    pub fn register_function<Args, F>(
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
        self.registry
            .register(name, description, f, param_names, param_descriptions)
    }

    pub fn modify_function_descriptions(
        &self,
        name: &str,
        param_names: &[&str],
        param_descriptions: &[&str],
    ) -> Result<()> {
        self.registry
            .modify_descriptions(name, param_names, param_descriptions)
    }

    pub fn registered_tools(&self) -> Vec<ToolDefinition> {
        self.registry.tools()
    }

    // -- MCP ----------------------------------------------------------------

    pub async fn add_mcp_server(&self, config: &McpServerConfig) -> Result<()> {
        self.mcp.add_server(config).await
    }

    pub async fn remove_mcp_server(&self, name: &str) -> Result<()> {
        self.mcp.remove_server(name).await
    }

    pub async fn mcp_tools(&self) -> std::collections::HashMap<String, McpToolInfo> {
        self.mcp.tools().await
    }

    pub async fn mcp_status(&self) -> std::collections::HashMap<String, usize> {
        self.mcp.status().await
    }

    /// Load an MCP config file and connect every server in it.
    pub async fn load_mcp_config(&self, path: impl AsRef<std::path::Path>) -> Result<usize> {
        let config = McpConfig::load(path)?;
        self.mcp.connect_config(&config).await
    }

    pub async fn load_mcp_config_from_slice(&self, data: &[u8]) -> Result<usize> {
        let config = McpConfig::from_slice(data)?;
        self.mcp.connect_config(&config).await
    }

    pub async fn close_mcp(&self) -> Result<()> {
        self.mcp.close().await
    }

    // -- the loop -----------------------------------------------------------

    /// Run one user turn: text plus any base64-encoded PNG images.
    ///
    /// Messages appended during the turn are also emitted on `observer`
    /// as they happen. On error the transcript is restored to its
    /// pre-call state.
    pub async fn chat(
        &mut self,
        cancel: &CancellationToken,
        provider: Provider,
        user_text: &str,
        images: &[String],
        observer: Option<&UnboundedSender<Message>>,
    ) -> Result<ChatOutcome> {
        // Truncate once at entry, before the new user message lands.
        if self.limits.truncation_enabled {
            self.history
                .truncate(&self.system_prompt, self.limits.max_history_tokens);
        }

        let snapshot = self.history.snapshot();
        let before = self.history.len();

        match self
            .run_turn(cancel, provider, user_text, images, observer)
            .await
        {
            Ok(finish_reason) => Ok(ChatOutcome {
                messages: self.history.messages()[before..].to_vec(),
                finish_reason,
                usage: self.total_usage,
            }),
            Err(e) => {
                self.history.restore(snapshot);
                Err(e)
            }
        }
    }

    async fn run_turn(
        &mut self,
        cancel: &CancellationToken,
        provider: Provider,
        user_text: &str,
        images: &[String],
        observer: Option<&UnboundedSender<Message>>,
    ) -> Result<FinishReason> {
        let content = build_user_content(user_text, images);
        if !content.is_empty() {
            let message = Message::new(Role::User, content);
            emit(observer, &message);
            self.history.push(message);
        }

        let tools = self.registry.tools();
        let tools = if tools.is_empty() { None } else { Some(tools) };

        let mut function_call_count = 0u32;
        'turn: loop {
            let req = ChatRequest {
                model: None,
                messages: self.history.snapshot(),
                tools: tools.clone(),
                max_tokens: Some(self.limits.max_tokens),
                temperature: Some(self.limits.temperature),
                stream: false,
                system_prompt: if self.system_prompt.is_empty() {
                    None
                } else {
                    Some(self.system_prompt.clone())
                },
            };

            let resp = self.backend.chat(cancel, provider, &req).await?;
            self.last_usage = resp.usage;
            self.total_usage.accumulate(&resp.usage);

            let Some(choice) = resp.choices.into_iter().next() else {
                break 'turn;
            };
            let message = choice.message;
            emit(observer, &message);
            self.history.push(message.clone());

            if message.tool_calls.is_empty() {
                break 'turn;
            }

            for call in &message.tool_calls {
                function_call_count += 1;
                // The over-budget call still executes so the transcript
                // keeps its call/result pairing; no further round runs.
                self.execute_tool_call(call, observer).await?;
                if function_call_count > self.limits.max_function_calls {
                    return Ok(FinishReason::MaxFunctionCalls);
                }
            }
        }

        Ok(FinishReason::Success)
    }

    async fn execute_tool_call(
        &mut self,
        call: &ToolCall,
        observer: Option<&UnboundedSender<Message>>,
    ) -> Result<()> {
        let name = &call.function.name;
        if !self.registry.contains(name) {
            return Err(Error::UnknownFunction(name.clone()));
        }

        let text = match self
            .registry
            .call(name, call.function.arguments_json())
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("tool {name} failed: {e}");
                format!("{TOOL_ERROR_PREFIX}{e}")
            }
        };

        let message = Message::tool_result(&call.id, text);
        emit(observer, &message);
        self.history.push(message);
        Ok(())
    }
}

fn emit(observer: Option<&UnboundedSender<Message>>, message: &Message) {
    if let Some(tx) = observer {
        let _ = tx.send(message.clone());
    }
}

/// Assemble the user message parts: optional text plus one high-detail
/// data-URI image part per base64 payload.
fn build_user_content(user_text: &str, images: &[String]) -> Vec<ContentPart> {
    let mut content = Vec::new();
    if !user_text.is_empty() {
        content.push(ContentPart::text(user_text));
    }
    for image in images {
        content.push(ContentPart::image_url(
            format!("data:image/png;base64,{image}"),
            Some(ImageDetail::High),
        ));
    }
    content
}
