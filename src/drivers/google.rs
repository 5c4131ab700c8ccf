//! Google Gemini generateContent 适配器。
//!
//! Google Gemini generateContent adapter. Key differences:
//!
//! - `contents`/`parts` instead of `messages`/`content`; the assistant
//!   role is called `model`; the system prompt is `systemInstruction`.
//! - Generation parameters live under `generationConfig`.
//! - Tool calls are `functionCall` parts with already-parsed args; tool
//!   results are `functionResponse` parts that must repeat the original
//!   function *name*, so the adapter rebuilds an id-to-name map from the
//!   earlier messages of the same request.
//! - The vendor returns function calls without ids; this adapter mints
//!   `call_<nanos>` ids so the pairing contract holds downstream.
//! - Endpoint shape: the API key rides as a `?key=` query parameter with
//!   no auth header, unless the base URL points at the known REST proxy,
//!   which wants a `v1beta` path prefix and a Bearer header instead.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::events::StreamChunk;
use crate::types::message::{ContentPart, Message, Role};
use crate::types::request::{ChatRequest, ChatResponse, Choice, Usage};
use crate::types::tool::{FunctionCall, ToolCall};
use crate::{Error, Result};

use super::{parse_data_uri, DriverRequest, Provider, ProviderAdapter};

const PROXY_HOST: &str = "openai-proxy.org";
const DEFAULT_IMAGE_MIME_TYPE: &str = "image/jpeg";
const FALLBACK_FUNCTION_NAME: &str = "unknown_function";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleRequest {
    contents: Vec<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GoogleGenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GoogleTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<GoogleInlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GoogleFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<GoogleFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleFunctionResponse {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTool {
    function_declarations: Vec<GoogleFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GoogleFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    usage_metadata: Option<GoogleUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: GoogleContent,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    index: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct GoogleAdapter {
    api_key: String,
    base_url: String,
    model: String,
}

impl GoogleAdapter {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| Provider::Google.default_base_url().to_string()),
            model: model.unwrap_or_else(|| Provider::Google.default_model().to_string()),
        }
    }

    fn is_proxy_host(&self) -> bool {
        self.base_url.contains(PROXY_HOST)
    }

    /// Official shape is the default; only the known proxy host gets the
    /// `v1beta` REST path and a Bearer header.
    fn endpoint(&self, model: &str, stream: bool) -> (String, HashMap<String, String>) {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        if self.is_proxy_host() {
            (
                format!("{}/v1beta/models/{}:{}", self.base_url, model, method),
                HashMap::from([(
                    "authorization".to_string(),
                    format!("Bearer {}", self.api_key),
                )]),
            )
        } else {
            (
                format!(
                    "{}/models/{}:{}?key={}",
                    self.base_url, model, method, self.api_key
                ),
                HashMap::new(),
            )
        }
    }

    fn convert_message(msg: &Message, call_names: &HashMap<String, String>) -> Option<GoogleContent> {
        if msg.role == Role::System {
            return None;
        }
        let role = match msg.role {
            Role::Assistant => "model",
            _ => "user",
        };

        let mut parts: Vec<GooglePart> = Vec::new();
        let mut has_tool_call_part = false;

        for part in &msg.content {
            match part {
                ContentPart::Text { text } => parts.push(GooglePart {
                    text: Some(text.clone()),
                    ..Default::default()
                }),
                ContentPart::ImageUrl { image_url } => {
                    if let Some((mime_type, data)) = parse_data_uri(&image_url.url) {
                        parts.push(GooglePart {
                            inline_data: Some(GoogleInlineData {
                                mime_type: mime_type.to_string(),
                                data: data.to_string(),
                            }),
                            ..Default::default()
                        });
                    }
                }
                ContentPart::ImageBase64 { image_url } => parts.push(GooglePart {
                    inline_data: Some(GoogleInlineData {
                        mime_type: DEFAULT_IMAGE_MIME_TYPE.to_string(),
                        data: image_url.url.clone(),
                    }),
                    ..Default::default()
                }),
                ContentPart::ToolCall { tool_call } => {
                    has_tool_call_part = true;
                    parts.push(function_call_part(tool_call));
                }
                ContentPart::ToolResult { tool_id, text } => {
                    let name = call_names
                        .get(tool_id)
                        .cloned()
                        .unwrap_or_else(|| FALLBACK_FUNCTION_NAME.to_string());
                    let response = if text.is_empty() {
                        None
                    } else {
                        Some(serde_json::json!({ "result": text }))
                    };
                    parts.push(GooglePart {
                        function_response: Some(GoogleFunctionResponse { name, response }),
                        ..Default::default()
                    });
                }
            }
        }

        if !has_tool_call_part {
            for tc in &msg.tool_calls {
                parts.push(function_call_part(tc));
            }
        }

        Some(GoogleContent {
            role: Some(role.to_string()),
            parts,
        })
    }
}

fn function_call_part(tc: &ToolCall) -> GooglePart {
    let args: Value = serde_json::from_str(tc.function.arguments_json())
        .unwrap_or_else(|_| Value::Object(Default::default()));
    GooglePart {
        function_call: Some(GoogleFunctionCall {
            name: tc.function.name.clone(),
            args,
        }),
        ..Default::default()
    }
}

/// Mint a tool-call id for a vendor that does not supply one.
fn mint_call_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("call_{}", nanos)
}

impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn build_request(&self, req: &ChatRequest) -> Result<DriverRequest> {
        let model = req
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model.clone());

        // functionResponse parts need the original function name; collect
        // the id-to-name pairs from every message before converting any.
        let mut call_names: HashMap<String, String> = HashMap::new();
        for msg in &req.messages {
            for tc in &msg.tool_calls {
                call_names.insert(tc.id.clone(), tc.function.name.clone());
            }
        }

        let generation_config = if req.temperature.is_some() || req.max_tokens.is_some() {
            Some(GoogleGenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
            })
        } else {
            None
        };

        let body = GoogleRequest {
            contents: req
                .messages
                .iter()
                .filter_map(|m| GoogleAdapter::convert_message(m, &call_names))
                .collect(),
            system_instruction: req
                .system_prompt
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| GoogleContent {
                    role: Some("system".to_string()),
                    parts: vec![GooglePart {
                        text: Some(s.to_string()),
                        ..Default::default()
                    }],
                }),
            generation_config,
            tools: req
                .tools
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|tools| {
                    vec![GoogleTool {
                        function_declarations: tools
                            .iter()
                            .map(|t| GoogleFunctionDeclaration {
                                name: t.function.name.clone(),
                                description: t.function.description.clone(),
                                parameters: t.function.parameters.clone(),
                            })
                            .collect(),
                    }]
                })
                .unwrap_or_default(),
        };

        let (url, headers) = self.endpoint(&model, req.stream);
        Ok(DriverRequest {
            url,
            headers,
            body: serde_json::to_value(&body)?,
        })
    }

    fn parse_response(&self, body: &Value) -> Result<ChatResponse> {
        let resp: GoogleResponse = serde_json::from_value(body.clone())?;

        let mut choices = Vec::with_capacity(resp.candidates.len());
        for candidate in resp.candidates {
            let mut parts: Vec<ContentPart> = Vec::new();
            let mut calls: Vec<ToolCall> = Vec::new();
            for part in candidate.content.parts {
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        parts.push(ContentPart::text(text));
                    }
                }
                if let Some(fc) = part.function_call {
                    let call = ToolCall {
                        id: mint_call_id(),
                        kind: "function".to_string(),
                        function: FunctionCall::from_value(fc.name, &fc.args)?,
                    };
                    parts.push(ContentPart::tool_call(call.clone()));
                    calls.push(call);
                }
            }
            choices.push(Choice {
                index: candidate.index,
                message: Message::new(Role::Assistant, parts).with_tool_calls(calls),
                finish_reason: candidate.finish_reason.unwrap_or_default(),
            });
        }

        let usage = resp
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            id: format!("google-{}", Utc::now().timestamp()),
            object: "chat.completion".to_string(),
            created: Utc::now(),
            model: "gemini".to_string(),
            choices,
            usage,
        })
    }

    fn parse_stream_line(&self, data: &str) -> Result<Option<StreamChunk>> {
        if data.trim().is_empty() {
            return Ok(None);
        }
        // Each streamed chunk is a full generateContent response.
        let v: Value = serde_json::from_str(data)
            .map_err(|e| Error::validation(format!("unparseable stream payload: {e}")))?;

        if let Some(text) = v
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
        {
            if !text.is_empty() {
                return Ok(Some(StreamChunk::ContentDelta {
                    content: text.to_string(),
                }));
            }
        }

        if let Some(reason) = v
            .pointer("/candidates/0/finishReason")
            .and_then(|r| r.as_str())
        {
            return Ok(Some(StreamChunk::Done {
                finish_reason: Some(reason.to_string()),
            }));
        }

        Ok(None)
    }

    fn is_stream_done(&self, _data: &str) -> bool {
        // The stream ends when the connection closes.
        false
    }
}
