//! OpenAI Chat Completions 适配器。
//!
//! OpenAI chat completions adapter. Beyond the common OpenAI-style wire
//! shape it handles two vendor quirks:
//!
//! - Tool-call ids longer than 40 characters are replaced with a
//!   deterministic `call_<hex(sha256)[..32]>` form, applied to both the
//!   call and its matching tool-result message so pairing survives.
//! - Newer model families rename `max_tokens` to `max_completion_tokens`
//!   (`gpt-5`, `o1`, `gpt-4o-realtime`) and reject a `temperature` field
//!   (`gpt-5`, `o1`). The rules run at conversion and again after the
//!   configured default model is applied.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::events::StreamChunk;
use crate::types::message::{ContentPart, Message, Role};
use crate::types::request::{ChatRequest, ChatResponse, Choice, Usage};
use crate::types::tool::{FunctionCall, ToolCall};
use crate::{Error, Result};

use super::{raw_arguments, DriverRequest, Provider, ProviderAdapter};

const MAX_TOOL_CALL_ID_LEN: usize = 40;

/// Shorten a tool-call id to fit OpenAI's 40-character limit.
///
/// The replacement is a stable function of the original id so the same
/// long id always maps to the same short id within a transcript.
pub(crate) fn shorten_tool_call_id(id: &str) -> String {
    if id.len() <= MAX_TOOL_CALL_ID_LEN {
        return id.to_string();
    }
    let digest = Sha256::digest(id.as_bytes());
    format!("call_{}", &hex::encode(digest)[..32])
}

fn uses_completion_tokens(model: &str) -> bool {
    model.contains("gpt-5") || model.contains("o1") || model.contains("gpt-4o-realtime")
}

fn omits_temperature(model: &str) -> bool {
    model.contains("gpt-5") || model.contains("o1")
}

pub(crate) fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

pub(crate) fn role_from_wire(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "user" => Role::User,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// OpenAI accepts a bare string for text-only content; some parameters are
/// rejected when an array is sent for plain text.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<OpenAiImageUrl>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OpenAiFunctionCall {
    pub name: String,
    /// Arguments travel as a JSON string on OpenAI-style wires.
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    index: u32,
    message: OpenAiRespMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiRespMessage {
    #[serde(default = "default_assistant_role")]
    role: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

fn default_assistant_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct OpenAiAdapter {
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| Provider::OpenAi.default_base_url().to_string()),
            model: model.unwrap_or_else(|| Provider::OpenAi.default_model().to_string()),
        }
    }

    fn auth_headers(&self) -> HashMap<String, String> {
        HashMap::from([(
            "authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )])
    }

    /// Re-derive the token-limit field name and temperature presence after
    /// a model default was filled in. When both token fields carry a value
    /// (caller set them independently) `max_tokens` wins.
    fn reapply_model_family_rules(req: &mut OpenAiRequest) {
        let limit = req.max_tokens.take().or(req.max_completion_tokens.take());
        if let Some(limit) = limit {
            if uses_completion_tokens(&req.model) {
                req.max_completion_tokens = Some(limit);
            } else {
                req.max_tokens = Some(limit);
            }
        }
        if omits_temperature(&req.model) {
            req.temperature = None;
        }
    }

    fn convert_request(&self, req: &ChatRequest) -> Result<OpenAiRequest> {
        let model = req.model.clone().unwrap_or_default();

        let mut out = OpenAiRequest {
            model,
            messages: Vec::new(),
            tools: None,
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            stream: req.stream,
        };

        if let Some(t) = req.temperature {
            if !omits_temperature(&out.model) {
                out.temperature = Some(t);
            }
        }
        if let Some(mt) = req.max_tokens {
            if mt > 0 {
                if uses_completion_tokens(&out.model) {
                    out.max_completion_tokens = Some(mt);
                } else {
                    out.max_tokens = Some(mt);
                }
            }
        }

        if let Some(system) = req.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            out.messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(OpenAiContent::Text(system.to_string())),
                name: None,
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }

        for msg in &req.messages {
            convert_message(msg, &mut out.messages, shorten_tool_call_id)?;
        }

        if let Some(tools) = &req.tools {
            out.tools = Some(
                tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: t.kind.clone(),
                        function: OpenAiFunctionDef {
                            name: t.function.name.clone(),
                            description: t.function.description.clone(),
                            parameters: t.function.parameters.clone(),
                        },
                    })
                    .collect(),
            );
        }

        if out.model.is_empty() {
            out.model = self.model.clone();
            Self::reapply_model_family_rules(&mut out);
        }

        Ok(out)
    }
}

/// Convert one canonical message into OpenAI wire messages.
///
/// A message carrying only tool-result parts expands into one `tool`-role
/// message per result; tool-result parts mixed into other content are
/// dropped here because the wire has no slot for them.
pub(crate) fn convert_message(
    msg: &Message,
    out: &mut Vec<OpenAiMessage>,
    id_fixup: fn(&str) -> String,
) -> Result<()> {
    let mut texts: Vec<&str> = Vec::new();
    let mut images: Vec<OpenAiPart> = Vec::new();
    let mut tool_results: Vec<(&str, &str)> = Vec::new();

    for part in &msg.content {
        match part {
            ContentPart::Text { text } => texts.push(text),
            ContentPart::ImageUrl { image_url } | ContentPart::ImageBase64 { image_url } => {
                images.push(OpenAiPart {
                    kind: "image_url".to_string(),
                    text: None,
                    image_url: Some(OpenAiImageUrl {
                        url: image_url.url.clone(),
                        detail: image_url.detail.map(|d| d.as_str().to_string()),
                    }),
                });
            }
            ContentPart::ToolResult { tool_id, text } => tool_results.push((tool_id, text)),
            // Carried at message level instead.
            ContentPart::ToolCall { .. } => {}
        }
    }

    let only_tool_results = !tool_results.is_empty()
        && msg
            .content
            .iter()
            .all(|p| matches!(p, ContentPart::ToolResult { .. }))
        && msg.tool_calls.is_empty();
    if only_tool_results {
        for (tool_id, text) in tool_results {
            out.push(OpenAiMessage {
                role: "tool".to_string(),
                content: Some(OpenAiContent::Text(text.to_string())),
                name: None,
                tool_calls: Vec::new(),
                tool_call_id: Some(id_fixup(tool_id)),
            });
        }
        return Ok(());
    }

    let content = if images.is_empty() && texts.len() == 1 {
        Some(OpenAiContent::Text(texts[0].to_string()))
    } else if !texts.is_empty() || !images.is_empty() {
        let mut parts: Vec<OpenAiPart> = texts
            .into_iter()
            .map(|t| OpenAiPart {
                kind: "text".to_string(),
                text: Some(t.to_string()),
                image_url: None,
            })
            .collect();
        parts.append(&mut images);
        Some(OpenAiContent::Parts(parts))
    } else {
        None
    };

    let tool_calls = msg
        .tool_calls
        .iter()
        .map(|tc| OpenAiToolCall {
            id: id_fixup(&tc.id),
            kind: tc.kind.clone(),
            function: OpenAiFunctionCall {
                name: tc.function.name.clone(),
                arguments: tc.function.arguments_json().to_string(),
            },
        })
        .collect();

    out.push(OpenAiMessage {
        role: wire_role(msg.role).to_string(),
        content,
        name: msg.name.clone(),
        tool_calls,
        tool_call_id: None,
    });
    Ok(())
}

/// Convert an OpenAI-style response message into a canonical message:
/// text content becomes a text part, tool calls land both at message level
/// and as `tool_call` content parts.
pub(crate) fn canonical_response_message(
    role: &str,
    content: Option<&Value>,
    tool_calls: &[OpenAiToolCall],
) -> Result<Message> {
    let mut parts: Vec<ContentPart> = Vec::new();
    match content {
        Some(Value::String(s)) => parts.push(ContentPart::text(s.clone())),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                    parts.push(ContentPart::text(text));
                }
            }
        }
        _ => {}
    }

    let mut calls: Vec<ToolCall> = Vec::new();
    for tc in tool_calls {
        let call = ToolCall {
            id: tc.id.clone(),
            kind: tc.kind.clone(),
            function: FunctionCall {
                name: tc.function.name.clone(),
                arguments: raw_arguments(&tc.function.arguments)?,
            },
        };
        parts.push(ContentPart::tool_call(call.clone()));
        calls.push(call);
    }

    Ok(Message::new(role_from_wire(role), parts).with_tool_calls(calls))
}

pub(crate) fn timestamp_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn build_request(&self, req: &ChatRequest) -> Result<DriverRequest> {
        let body = self.convert_request(req)?;
        Ok(DriverRequest {
            url: format!("{}/chat/completions", self.base_url),
            headers: self.auth_headers(),
            body: serde_json::to_value(&body)?,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<ChatResponse> {
        parse_openai_style_response(body)
    }

    fn parse_stream_line(&self, data: &str) -> Result<Option<StreamChunk>> {
        parse_openai_stream_line(data)
    }
}

/// Parse an OpenAI-shaped chat completion response body. Shared with the
/// OpenAI-compatible vendors (DeepSeek, Qwen).
pub(crate) fn parse_openai_style_response(body: &Value) -> Result<ChatResponse> {
    let resp: OpenAiResponse = serde_json::from_value(body.clone())?;
    let usage = resp
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    let mut choices = Vec::with_capacity(resp.choices.len());
    for choice in resp.choices {
        choices.push(Choice {
            index: choice.index,
            message: canonical_response_message(
                &choice.message.role,
                choice.message.content.as_ref(),
                &choice.message.tool_calls,
            )?,
            finish_reason: choice.finish_reason.unwrap_or_default(),
        });
    }

    Ok(ChatResponse {
        id: resp.id,
        object: resp.object,
        created: timestamp_to_datetime(resp.created),
        model: resp.model,
        choices,
        usage,
    })
}

/// Shared streaming-delta parser for OpenAI-style SSE payloads.
pub(crate) fn parse_openai_stream_line(data: &str) -> Result<Option<StreamChunk>> {
    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return Ok(None);
    }
    let v: Value = serde_json::from_str(data).map_err(|e| {
        Error::validation(format!("unparseable stream payload: {e}"))
    })?;

    if let Some(content) = v.pointer("/choices/0/delta/content").and_then(|c| c.as_str()) {
        if !content.is_empty() {
            return Ok(Some(StreamChunk::ContentDelta {
                content: content.to_string(),
            }));
        }
    }

    if let Some(tc) = v
        .pointer("/choices/0/delta/tool_calls/0")
        .and_then(|t| t.as_object())
    {
        return Ok(Some(StreamChunk::ToolCallDelta {
            index: tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
            id: tc.get("id").and_then(|i| i.as_str()).map(String::from),
            name: tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .map(String::from),
            arguments: tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or_default()
                .to_string(),
        }));
    }

    if let Some(reason) = v
        .pointer("/choices/0/finish_reason")
        .and_then(|r| r.as_str())
    {
        return Ok(Some(StreamChunk::Done {
            finish_reason: Some(reason.to_string()),
        }));
    }

    if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
        return Ok(Some(StreamChunk::Usage {
            usage: Usage {
                prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
                total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
            },
        }));
    }

    Ok(None)
}
