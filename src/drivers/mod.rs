//! Provider 适配层：统一请求与各厂商线缆格式之间的双向转换。
//!
//! Provider adapter abstraction. Each vendor module owns its wire structs
//! and implements [`ProviderAdapter`]; the dispatcher drives them through
//! `Box<dyn ProviderAdapter>` so the same conversation code works against
//! OpenAI, Anthropic, Google Gemini, DeepSeek and Qwen.
//!
//! Adapters are stateless apart from their immutable connection config and
//! are safe for concurrent use.

pub mod anthropic;
pub mod deepseek;
pub mod google;
pub mod openai;
pub mod qwen;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::types::events::StreamChunk;
use crate::types::request::{ChatRequest, ChatResponse};
use crate::{Error, Result};

pub use anthropic::AnthropicAdapter;
pub use deepseek::DeepSeekAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;
pub use qwen::QwenAdapter;

/// Supported provider identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    Qwen,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::DeepSeek => "deepseek",
            Provider::Qwen => "qwen",
        }
    }

    /// Model used when a request leaves `model` unset.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o",
            Provider::Anthropic => "claude-3-5-sonnet-20241022",
            Provider::Google => "gemini-pro",
            Provider::DeepSeek => "deepseek-chat",
            Provider::Qwen => "qwen-plus",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta",
            Provider::DeepSeek => "https://api.deepseek.com/v1",
            Provider::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "google" => Ok(Provider::Google),
            "deepseek" => Ok(Provider::DeepSeek),
            "qwen" => Ok(Provider::Qwen),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Vendor-ready HTTP request produced by an adapter.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Core trait for provider-specific API adaptation.
///
/// `build_request` consults `ChatRequest::stream` so streaming variants
/// (different URL for Gemini, `stream: true` body flag elsewhere) come out
/// of the same entry point.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Reject requests the vendor would refuse (e.g. Anthropic requires a
    /// positive `max_tokens`).
    fn validate(&self, _req: &ChatRequest) -> Result<()> {
        Ok(())
    }

    /// Translate a canonical request into the vendor wire request.
    fn build_request(&self, req: &ChatRequest) -> Result<DriverRequest>;

    /// Translate a vendor response body into the canonical response.
    fn parse_response(&self, body: &Value) -> Result<ChatResponse>;

    /// Parse one streaming payload line (already stripped of any
    /// `data: ` prefix) into a chunk event.
    fn parse_stream_line(&self, data: &str) -> Result<Option<StreamChunk>>;

    /// Whether this line is the vendor's end-of-stream sentinel.
    fn is_stream_done(&self, data: &str) -> bool {
        data.trim() == "[DONE]"
    }
}

/// Split a `data:<media>;base64,<payload>` URI into media type and payload.
pub(crate) fn parse_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let media_type = meta.split(';').next().unwrap_or("");
    if media_type.is_empty() {
        return None;
    }
    Some((media_type, payload))
}

/// Wrap vendor-provided argument text as raw JSON, preserving it verbatim
/// when it already parses and re-encoding it as a JSON string otherwise.
pub(crate) fn raw_arguments(text: &str) -> Result<Box<RawValue>> {
    if let Ok(raw) = RawValue::from_string(text.to_string()) {
        return Ok(raw);
    }
    Ok(RawValue::from_string(serde_json::to_string(text)?)?)
}
