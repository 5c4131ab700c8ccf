//! Raw streaming chunk events
//!
//! Streaming delivers vendor deltas as they arrive; assembling them into a
//! final message is left to the application.

use serde::{Deserialize, Serialize};

use super::request::Usage;

/// One parsed streaming delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum StreamChunk {
    /// Partial assistant text.
    #[serde(rename = "content_delta")]
    ContentDelta { content: String },

    /// Partial tool-call data. `id`/`name` arrive on the first fragment
    /// for a given index; later fragments extend `arguments`.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },

    /// Usage metadata, when the vendor reports it mid-stream.
    #[serde(rename = "usage")]
    Usage { usage: Usage },

    /// Terminal event carrying the vendor's finish reason when known.
    #[serde(rename = "done")]
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_tagging() {
        let chunk = StreamChunk::ContentDelta {
            content: "Hi".into(),
        };
        let v = serde_json::to_value(&chunk).unwrap();
        assert_eq!(v["event"], "content_delta");
        assert_eq!(v["content"], "Hi");
    }
}
