//! DeepSeek Chat Completions 适配器。
//!
//! DeepSeek chat completions adapter. OpenAI-compatible wire shape with
//! two deviations the upstream recommends:
//!
//! - No `system`-role message: the system prompt is prepended to the first
//!   user message's text with a blank-line separator.
//! - `content` must be a bare string unless the message carries images;
//!   multiple text parts of one message are joined with a single space.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::types::events::StreamChunk;
use crate::types::message::{ContentPart, Role};
use crate::types::request::{ChatRequest, ChatResponse};
use crate::Result;

use super::openai::{
    parse_openai_stream_line, wire_role, OpenAiFunctionCall, OpenAiToolCall,
};
use super::{DriverRequest, Provider, ProviderAdapter};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DeepSeekRequest {
    model: String,
    messages: Vec<DeepSeekMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<DeepSeekTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct DeepSeekMessage {
    role: String,
    content: DeepSeekContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DeepSeekContent {
    Text(String),
    Parts(Vec<DeepSeekPart>),
}

#[derive(Debug, Serialize)]
struct DeepSeekPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<DeepSeekImageUrl>,
}

#[derive(Debug, Serialize)]
struct DeepSeekImageUrl {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeepSeekTool {
    #[serde(rename = "type")]
    kind: String,
    function: DeepSeekFunctionDef,
}

#[derive(Debug, Serialize)]
struct DeepSeekFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct DeepSeekAdapter {
    api_key: String,
    base_url: String,
    model: String,
}

impl DeepSeekAdapter {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| Provider::DeepSeek.default_base_url().to_string()),
            model: model.unwrap_or_else(|| Provider::DeepSeek.default_model().to_string()),
        }
    }

    fn convert_messages(req: &ChatRequest) -> Vec<DeepSeekMessage> {
        let mut out: Vec<DeepSeekMessage> = Vec::new();
        let mut pending_system = req
            .system_prompt
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        for msg in &req.messages {
            let mut texts: Vec<&str> = Vec::new();
            let mut images: Vec<DeepSeekPart> = Vec::new();
            let mut had_tool_result = false;

            for part in &msg.content {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            texts.push(text);
                        }
                    }
                    ContentPart::ImageUrl { image_url }
                    | ContentPart::ImageBase64 { image_url } => {
                        images.push(DeepSeekPart {
                            kind: "image_url".to_string(),
                            text: None,
                            image_url: Some(DeepSeekImageUrl {
                                url: image_url.url.clone(),
                                detail: image_url.detail.map(|d| d.as_str().to_string()),
                            }),
                        });
                    }
                    ContentPart::ToolResult { tool_id, text } => {
                        // Tool results travel as standalone tool messages.
                        if !text.is_empty() && !tool_id.is_empty() {
                            had_tool_result = true;
                            out.push(DeepSeekMessage {
                                role: "tool".to_string(),
                                content: DeepSeekContent::Text(text.clone()),
                                name: None,
                                tool_calls: Vec::new(),
                                tool_call_id: Some(tool_id.clone()),
                            });
                        }
                    }
                    ContentPart::ToolCall { .. } => {}
                }
            }

            let mut text_content = texts.join(" ");
            // The system prompt merges into the first user message.
            if msg.role == Role::User {
                if let Some(system) = pending_system.take() {
                    text_content = if text_content.is_empty() {
                        system
                    } else {
                        format!("{}\n\n{}", system, text_content)
                    };
                }
            }

            let content = if !images.is_empty() {
                let mut parts: Vec<DeepSeekPart> = Vec::new();
                if !text_content.is_empty() {
                    parts.push(DeepSeekPart {
                        kind: "text".to_string(),
                        text: Some(text_content),
                        image_url: None,
                    });
                }
                parts.extend(images);
                DeepSeekContent::Parts(parts)
            } else {
                DeepSeekContent::Text(text_content)
            };

            let tool_calls: Vec<OpenAiToolCall> = msg
                .tool_calls
                .iter()
                .map(|tc| OpenAiToolCall {
                    id: tc.id.clone(),
                    kind: tc.kind.clone(),
                    function: OpenAiFunctionCall {
                        name: tc.function.name.clone(),
                        arguments: tc.function.arguments_json().to_string(),
                    },
                })
                .collect();

            // Messages that carried nothing but tool results are done.
            if had_tool_result {
                let has_other = msg
                    .content
                    .iter()
                    .any(|p| !matches!(p, ContentPart::ToolResult { .. }));
                if !has_other && tool_calls.is_empty() {
                    continue;
                }
            }

            out.push(DeepSeekMessage {
                role: wire_role(msg.role).to_string(),
                content,
                name: msg.name.clone(),
                tool_calls,
                tool_call_id: None,
            });
        }

        out
    }
}

impl ProviderAdapter for DeepSeekAdapter {
    fn provider(&self) -> Provider {
        Provider::DeepSeek
    }

    fn build_request(&self, req: &ChatRequest) -> Result<DriverRequest> {
        let model = req
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model.clone());

        let body = DeepSeekRequest {
            model,
            messages: Self::convert_messages(req),
            tools: req.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| DeepSeekTool {
                        kind: t.kind.clone(),
                        function: DeepSeekFunctionDef {
                            name: t.function.name.clone(),
                            description: t.function.description.clone(),
                            parameters: t.function.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            max_tokens: req.max_tokens.filter(|mt| *mt > 0),
            temperature: req.temperature,
            stream: req.stream,
        };

        Ok(DriverRequest {
            url: format!("{}/chat/completions", self.base_url),
            headers: HashMap::from([(
                "authorization".to_string(),
                format!("Bearer {}", self.api_key),
            )]),
            body: serde_json::to_value(&body)?,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<ChatResponse> {
        // DeepSeek responses follow the OpenAI chat completion shape.
        super::openai::parse_openai_style_response(body)
    }

    fn parse_stream_line(&self, data: &str) -> Result<Option<StreamChunk>> {
        parse_openai_stream_line(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::{ImageDetail, Message};
    use crate::types::tool::ToolCall;

    fn adapter() -> DeepSeekAdapter {
        DeepSeekAdapter::new("ds-key", None, None)
    }

    fn request_with(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: Some("deepseek-chat".to_string()),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn test_system_prompt_merges_into_first_user_message() {
        let mut req = request_with(vec![Message::user("hi")]);
        req.system_prompt = Some("<system>".to_string());
        let dr = adapter().build_request(&req).unwrap();
        let messages = dr.body["messages"].as_array().unwrap();
        assert!(messages.iter().all(|m| m["role"] != "system"));
        assert_eq!(messages[0]["content"], "<system>\n\nhi");
    }

    #[test]
    fn test_system_prompt_merges_only_once() {
        let mut req = request_with(vec![
            Message::user("first"),
            Message::assistant("ok"),
            Message::user("second"),
        ]);
        req.system_prompt = Some("sys".to_string());
        let dr = adapter().build_request(&req).unwrap();
        assert_eq!(dr.body["messages"][0]["content"], "sys\n\nfirst");
        assert_eq!(dr.body["messages"][2]["content"], "second");
    }

    #[test]
    fn test_text_parts_joined_with_space() {
        let msg = Message::new(
            Role::User,
            vec![ContentPart::text("a"), ContentPart::text("b")],
        );
        let dr = adapter().build_request(&request_with(vec![msg])).unwrap();
        assert_eq!(dr.body["messages"][0]["content"], "a b");
    }

    #[test]
    fn test_images_force_part_array_with_text_first() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentPart::text("see"),
                ContentPart::image_url("data:image/png;base64,AA", Some(ImageDetail::Low)),
            ],
        );
        let dr = adapter().build_request(&request_with(vec![msg])).unwrap();
        let content = &dr.body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "see");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["detail"], "low");
    }

    #[test]
    fn test_tool_result_becomes_standalone_tool_message() {
        let dr = adapter()
            .build_request(&request_with(vec![Message::tool_result("call_1", "42")]))
            .unwrap();
        let messages = dr.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "tool");
        assert_eq!(messages[0]["tool_call_id"], "call_1");
        assert_eq!(messages[0]["content"], "42");
    }

    #[test]
    fn test_tool_calls_keep_string_arguments() {
        let call = ToolCall::function("call_1", "add", r#"{"a":1}"#).unwrap();
        let msg = Message::new(Role::Assistant, vec![]).with_tool_calls(vec![call]);
        let dr = adapter().build_request(&request_with(vec![msg])).unwrap();
        let tc = &dr.body["messages"][0]["tool_calls"][0];
        assert_eq!(tc["function"]["arguments"], r#"{"a":1}"#);
    }

    #[test]
    fn test_default_endpoint() {
        let dr = adapter()
            .build_request(&request_with(vec![Message::user("hi")]))
            .unwrap();
        assert_eq!(dr.url, "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(dr.headers["authorization"], "Bearer ds-key");
    }
}
