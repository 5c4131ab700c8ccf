//! Qwen (DashScope compatible-mode) 适配器。
//!
//! Qwen adapter for the DashScope OpenAI-compatible endpoint. The wire
//! shape matches OpenAI (system-role message, bare-string text content,
//! string tool-call arguments) without the newer OpenAI model-family
//! parameter toggles, and tool-call ids pass through untouched.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::types::events::StreamChunk;
use crate::types::request::{ChatRequest, ChatResponse};
use crate::Result;

use super::openai::{
    convert_message, parse_openai_stream_line, parse_openai_style_response, OpenAiContent,
    OpenAiMessage, OpenAiTool,
};
use super::{DriverRequest, Provider, ProviderAdapter};

#[derive(Debug, Serialize)]
struct QwenRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

pub struct QwenAdapter {
    api_key: String,
    base_url: String,
    model: String,
}

impl QwenAdapter {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| Provider::Qwen.default_base_url().to_string()),
            model: model.unwrap_or_else(|| Provider::Qwen.default_model().to_string()),
        }
    }
}

fn keep_id(id: &str) -> String {
    id.to_string()
}

impl ProviderAdapter for QwenAdapter {
    fn provider(&self) -> Provider {
        Provider::Qwen
    }

    fn build_request(&self, req: &ChatRequest) -> Result<DriverRequest> {
        let model = req
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model.clone());

        let mut messages: Vec<OpenAiMessage> = Vec::new();
        if let Some(system) = req.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(OpenAiContent::Text(system.to_string())),
                name: None,
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        for msg in &req.messages {
            convert_message(msg, &mut messages, keep_id)?;
        }

        let body = QwenRequest {
            model,
            messages,
            tools: req.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: t.kind.clone(),
                        function: super::openai::OpenAiFunctionDef {
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
        parse_openai_style_response(body)
    }

    fn parse_stream_line(&self, data: &str) -> Result<Option<StreamChunk>> {
        parse_openai_stream_line(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Message;

    fn adapter() -> QwenAdapter {
        QwenAdapter::new("qw-key", None, None)
    }

    #[test]
    fn test_default_endpoint_and_model() {
        let req = ChatRequest::new(vec![Message::user("hi")]);
        let dr = adapter().build_request(&req).unwrap();
        assert_eq!(
            dr.url,
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions"
        );
        assert_eq!(dr.body["model"], "qwen-plus");
        assert_eq!(dr.headers["authorization"], "Bearer qw-key");
    }

    #[test]
    fn test_system_prompt_is_system_role_message() {
        let mut req = ChatRequest::new(vec![Message::user("hi")]);
        req.system_prompt = Some("be brief".to_string());
        let dr = adapter().build_request(&req).unwrap();
        assert_eq!(dr.body["messages"][0]["role"], "system");
        assert_eq!(dr.body["messages"][0]["content"], "be brief");
    }

    #[test]
    fn test_no_model_family_toggles() {
        let mut req = ChatRequest::new(vec![Message::user("hi")]);
        req.model = Some("qwen-max".to_string());
        req.max_tokens = Some(800);
        req.temperature = Some(0.9);
        let dr = adapter().build_request(&req).unwrap();
        assert_eq!(dr.body["max_tokens"], 800);
        assert_eq!(dr.body["temperature"], 0.9);
        assert!(dr.body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn test_long_tool_ids_pass_through() {
        let long_id = "q".repeat(80);
        let req = ChatRequest::new(vec![Message::tool_result(long_id.clone(), "ok")]);
        let dr = adapter().build_request(&req).unwrap();
        assert_eq!(dr.body["messages"][0]["tool_call_id"], long_id.as_str());
    }
}
