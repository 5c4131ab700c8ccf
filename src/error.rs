//! 错误处理模块：整个运行时共用的统一错误类型。
//!
//! Unified error type for the agent runtime. Every fallible operation in
//! the crate returns [`crate::Result`], aggregating low-level failures
//! into the categories a caller can actually act on: repair the request
//! (validation), fix wiring (configuration), retry elsewhere (remote), or
//! keep the dialogue going (tool execution errors, which the conversation
//! loop converts into tool-result text instead of failing the turn).

use thiserror::Error;

/// Maximum number of body bytes carried in a [`Error::Remote`] excerpt.
const REMOTE_BODY_EXCERPT: usize = 512;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration (duplicate server name, unknown
    /// transport, malformed config file).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The dispatcher has no adapter registered under this provider id.
    #[error("provider not registered: {0}")]
    UnknownProvider(String),

    /// An adapter rejected the request before any network traffic.
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP-level failure (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider answered with a non-2xx status.
    #[error("remote error: HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    /// A vendor request or response could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tool call referenced a name the registry does not know.
    #[error("function not registered: {0}")]
    UnknownFunction(String),

    /// A registered tool ran and failed.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// Tool-call arguments were not a JSON object (nor a JSON string
    /// wrapping one).
    #[error("tool arguments unparseable: {0}")]
    ArgumentParse(String),

    /// A tool argument could not be coerced to the declared parameter type.
    #[error("tool argument type mismatch: {0}")]
    ArgumentType(String),

    /// MCP session failure (spawn, handshake, tool listing, invocation).
    #[error("mcp error: {0}")]
    Mcp(String),

    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn mcp(msg: impl Into<String>) -> Self {
        Error::Mcp(msg.into())
    }

    /// Build a remote error, truncating the body to a bounded excerpt so
    /// huge HTML error pages do not end up in logs verbatim.
    pub fn remote(status: u16, body: &str) -> Self {
        let body = if body.len() > REMOTE_BODY_EXCERPT {
            let mut end = REMOTE_BODY_EXCERPT;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &body[..end])
        } else {
            body.to_string()
        };
        Error::Remote { status, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_body_excerpt() {
        let long = "x".repeat(2048);
        match Error::remote(500, &long) {
            Error::Remote { status, body } => {
                assert_eq!(status, 500);
                assert!(body.len() <= REMOTE_BODY_EXCERPT + 3);
                assert!(body.ends_with("..."));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_remote_excerpt_respects_char_boundaries() {
        let long = "函".repeat(600);
        match Error::remote(429, &long) {
            Error::Remote { body, .. } => assert!(body.ends_with("...")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
