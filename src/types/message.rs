//! 统一消息模型：所有厂商适配器共享的规范化会话结构。
//!
//! Unified message format. A message is a role plus a list of typed
//! content parts; tool calls are duplicated at message level because most
//! vendor APIs require them there, while the `tool_call` content part
//! keeps them inside the transcript for history accounting.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::tool::ToolCall;

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Tool result carrier (OpenAI wire role "tool").
    Tool,
}

/// Image fidelity requested from the vendor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
    Auto,
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
            ImageDetail::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

/// Typed content part, discriminated by the `type` string on the wire.
///
/// `image_url` carries a fetchable URL or a full data-URI; `image_base64`
/// carries a bare base64 payload in the `url` field. Adapters normalise
/// both spellings into each vendor's native image encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    ImageBase64 {
        image_url: ImageUrl,
    },
    ToolCall {
        tool_call: ToolCall,
    },
    ToolResult {
        tool_id: String,
        #[serde(default)]
        text: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>, detail: Option<ImageDetail>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail,
            },
        }
    }

    pub fn image_base64(data: impl Into<String>, detail: Option<ImageDetail>) -> Self {
        ContentPart::ImageBase64 {
            image_url: ImageUrl {
                url: data.into(),
                detail,
            },
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        ContentPart::ToolCall { tool_call: call }
    }

    pub fn tool_result(tool_id: impl Into<String>, text: impl Into<String>) -> Self {
        ContentPart::ToolResult {
            tool_id: tool_id.into(),
            text: text.into(),
        }
    }

    /// Read an image file and wrap it as a `data:` URI part.
    pub fn image_from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let media_type = guess_media_type(path).unwrap_or("image/png");
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(Self::image_url(
            format!("data:{};base64,{}", media_type, data),
            Some(ImageDetail::High),
        ))
    }
}

fn guess_media_type(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Unified message structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            content,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Tool-result message echoing the original call id.
    pub fn tool_result(tool_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::Tool, vec![ContentPart::tool_result(tool_id, text)])
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn contains_image(&self) -> bool {
        self.content.iter().any(|p| {
            matches!(
                p,
                ContentPart::ImageUrl { .. } | ContentPart::ImageBase64 { .. }
            )
        })
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Text of the first tool-result part, if any.
    pub fn tool_result_text(&self) -> Option<(&str, &str)> {
        self.content.iter().find_map(|p| match p {
            ContentPart::ToolResult { tool_id, text } => Some((tool_id.as_str(), text.as_str())),
            _ => None,
        })
    }
}
