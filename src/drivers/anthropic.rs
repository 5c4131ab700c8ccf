//! Anthropic Messages API 适配器。
//!
//! Anthropic Messages API adapter. Key differences from the OpenAI shape:
//!
//! - The system prompt is a top-level `system` parameter, never a message.
//! - Content is always an array of typed blocks; a message with zero
//!   blocks is illegal, so an empty message gets a single-space text block.
//! - Tool calls are `tool_use` blocks with an already-parsed `input`
//!   object; tool results are `tool_result` blocks inside a `user` message.
//! - `max_tokens` is required and must be positive.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::events::StreamChunk;
use crate::types::message::{ContentPart, Message, Role};
use crate::types::request::{ChatRequest, ChatResponse, Choice, Usage};
use crate::types::tool::{FunctionCall, ToolCall};
use crate::{Error, Result};

use super::{parse_data_uri, DriverRequest, Provider, ProviderAdapter};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_IMAGE_MEDIA_TYPE: &str = "image/jpeg";
const EMPTY_TOOL_RESULT_TEXT: &str = "函数执行完成";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<AnthropicContent>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: String,
    #[serde(default = "default_role")]
    role: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<AnthropicContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

fn default_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct AnthropicAdapter {
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| Provider::Anthropic.default_base_url().to_string()),
            model: model.unwrap_or_else(|| Provider::Anthropic.default_model().to_string()),
        }
    }

    fn convert_message(msg: &Message) -> Option<AnthropicMessage> {
        if msg.role == Role::System {
            return None;
        }
        // Tool results ride inside a user-role message.
        let role = match msg.role {
            Role::Assistant => "assistant",
            _ => "user",
        };

        let mut content: Vec<AnthropicContent> = Vec::new();
        let mut has_tool_call_part = false;

        for part in &msg.content {
            match part {
                ContentPart::Text { text } => {
                    content.push(AnthropicContent::Text { text: text.clone() })
                }
                ContentPart::ImageUrl { image_url } => {
                    if let Some((media_type, data)) = parse_data_uri(&image_url.url) {
                        content.push(AnthropicContent::Image {
                            source: AnthropicImageSource {
                                kind: "base64".to_string(),
                                media_type: media_type.to_string(),
                                data: data.to_string(),
                            },
                        });
                    }
                }
                ContentPart::ImageBase64 { image_url } => {
                    content.push(AnthropicContent::Image {
                        source: AnthropicImageSource {
                            kind: "base64".to_string(),
                            media_type: DEFAULT_IMAGE_MEDIA_TYPE.to_string(),
                            data: image_url.url.clone(),
                        },
                    });
                }
                ContentPart::ToolCall { tool_call } => {
                    has_tool_call_part = true;
                    content.push(tool_use_block(tool_call));
                }
                ContentPart::ToolResult { tool_id, text } => {
                    let text = if text.is_empty() {
                        EMPTY_TOOL_RESULT_TEXT.to_string()
                    } else {
                        text.clone()
                    };
                    content.push(AnthropicContent::ToolResult {
                        tool_use_id: tool_id.clone(),
                        content: vec![AnthropicContent::Text { text }],
                    });
                }
            }
        }

        if !has_tool_call_part {
            for tc in &msg.tool_calls {
                content.push(tool_use_block(tc));
            }
        }

        // A message with no content blocks is rejected by the API.
        if content.is_empty() {
            content.push(AnthropicContent::Text {
                text: " ".to_string(),
            });
        } else {
            for block in &mut content {
                if let AnthropicContent::Text { text } = block {
                    if text.is_empty() {
                        *text = " ".to_string();
                    }
                }
            }
        }

        Some(AnthropicMessage {
            role: role.to_string(),
            content,
        })
    }
}

fn tool_use_block(tc: &ToolCall) -> AnthropicContent {
    let input: Value = serde_json::from_str(tc.function.arguments_json())
        .unwrap_or_else(|_| Value::Object(Default::default()));
    AnthropicContent::ToolUse {
        id: tc.id.clone(),
        name: tc.function.name.clone(),
        input,
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn validate(&self, req: &ChatRequest) -> Result<()> {
        if req.max_tokens.unwrap_or(0) == 0 {
            return Err(Error::validation(
                "max_tokens must be greater than 0 for anthropic",
            ));
        }
        Ok(())
    }

    fn build_request(&self, req: &ChatRequest) -> Result<DriverRequest> {
        let model = req
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model.clone());

        let body = AnthropicRequest {
            model,
            max_tokens: req.max_tokens.filter(|mt| *mt > 0).unwrap_or(4096),
            messages: req
                .messages
                .iter()
                .filter_map(AnthropicAdapter::convert_message)
                .collect(),
            system: req.system_prompt.clone().filter(|s| !s.is_empty()),
            temperature: req.temperature,
            stream: req.stream,
            tools: req.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        input_schema: t.function.parameters.clone(),
                    })
                    .collect()
            }),
        };

        let headers = HashMap::from([
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ]);

        Ok(DriverRequest {
            url: format!("{}/v1/messages", self.base_url),
            headers,
            body: serde_json::to_value(&body)?,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<ChatResponse> {
        let resp: AnthropicResponse = serde_json::from_value(body.clone())?;

        let mut parts: Vec<ContentPart> = Vec::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        for block in resp.content {
            match block {
                AnthropicContent::Text { text } => parts.push(ContentPart::text(text)),
                AnthropicContent::ToolUse { id, name, input } => {
                    let call = ToolCall {
                        id,
                        kind: "function".to_string(),
                        function: FunctionCall::from_value(name, &input)?,
                    };
                    parts.push(ContentPart::tool_call(call.clone()));
                    calls.push(call);
                }
                _ => {}
            }
        }

        let role = if resp.role == "assistant" {
            Role::Assistant
        } else {
            Role::User
        };
        let message = Message::new(role, parts).with_tool_calls(calls);

        Ok(ChatResponse {
            id: resp.id,
            object: "chat.completion".to_string(),
            created: Utc::now(),
            model: resp.model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: resp.stop_reason.unwrap_or_default(),
            }],
            usage: Usage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
                total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
            },
        })
    }

    fn parse_stream_line(&self, data: &str) -> Result<Option<StreamChunk>> {
        if data.trim().is_empty() {
            return Ok(None);
        }
        let v: Value = serde_json::from_str(data)
            .map_err(|e| Error::validation(format!("unparseable stream payload: {e}")))?;

        match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "content_block_delta" => {
                if let Some(text) = v.pointer("/delta/text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        return Ok(Some(StreamChunk::ContentDelta {
                            content: text.to_string(),
                        }));
                    }
                }
                if let Some(json) = v.pointer("/delta/partial_json").and_then(|t| t.as_str()) {
                    return Ok(Some(StreamChunk::ToolCallDelta {
                        index: v.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
                        id: None,
                        name: None,
                        arguments: json.to_string(),
                    }));
                }
                Ok(None)
            }
            "content_block_start" => {
                if let Some(block) = v.get("content_block") {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        return Ok(Some(StreamChunk::ToolCallDelta {
                            index: v.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
                            id: block.get("id").and_then(|i| i.as_str()).map(String::from),
                            name: block.get("name").and_then(|n| n.as_str()).map(String::from),
                            arguments: String::new(),
                        }));
                    }
                }
                Ok(None)
            }
            "message_delta" => Ok(v
                .pointer("/delta/stop_reason")
                .and_then(|r| r.as_str())
                .map(|r| StreamChunk::Done {
                    finish_reason: Some(r.to_string()),
                })),
            "message_stop" => Ok(Some(StreamChunk::Done {
                finish_reason: None,
            })),
            _ => Ok(None),
        }
    }

    fn is_stream_done(&self, _data: &str) -> bool {
        // The stream ends via the message_stop event, not a sentinel line.
        false
    }
}
