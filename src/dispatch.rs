//! Provider dispatcher: routes canonical requests to configured adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::drivers::{
    AnthropicAdapter, DeepSeekAdapter, GoogleAdapter, OpenAiAdapter, Provider, ProviderAdapter,
    QwenAdapter,
};
use crate::transport::HttpTransport;
use crate::types::events::StreamChunk;
use crate::types::request::{ChatRequest, ChatResponse};
use crate::{Error, Result};

/// Fallback completion budget applied when a request leaves `max_tokens`
/// unset.
const DEFAULT_MAX_TOKENS: u32 = 3000;

/// Connection settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Synchronous chat entry point the conversation driver depends on.
/// Implemented by [`ProviderDispatcher`]; test doubles script responses
/// behind the same seam.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        provider: Provider,
        req: &ChatRequest,
    ) -> Result<ChatResponse>;
}

/// Registry of configured adapters keyed by provider id.
pub struct ProviderDispatcher {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
    transport: HttpTransport,
}

impl ProviderDispatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            adapters: HashMap::new(),
            transport: HttpTransport::new()?,
        })
    }

    /// Register (or replace) an adapter for the configured provider.
    pub fn add_provider(&mut self, config: ProviderConfig) {
        let adapter: Arc<dyn ProviderAdapter> = match config.provider {
            Provider::OpenAi => {
                Arc::new(OpenAiAdapter::new(config.api_key, config.base_url, config.model))
            }
            Provider::Anthropic => {
                Arc::new(AnthropicAdapter::new(config.api_key, config.base_url, config.model))
            }
            Provider::Google => {
                Arc::new(GoogleAdapter::new(config.api_key, config.base_url, config.model))
            }
            Provider::DeepSeek => {
                Arc::new(DeepSeekAdapter::new(config.api_key, config.base_url, config.model))
            }
            Provider::Qwen => {
                Arc::new(QwenAdapter::new(config.api_key, config.base_url, config.model))
            }
        };
        self.adapters.insert(config.provider, adapter);
    }

    /// Registered provider ids.
    pub fn providers(&self) -> Vec<Provider> {
        self.adapters.keys().copied().collect()
    }

    fn adapter(&self, provider: Provider) -> Result<&Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .ok_or_else(|| Error::UnknownProvider(provider.to_string()))
    }

    /// Fill `max_tokens` and `model` defaults the way every provider
    /// expects them before validation.
    fn fill_defaults(provider: Provider, req: &ChatRequest) -> ChatRequest {
        let mut req = req.clone();
        if req.max_tokens.unwrap_or(0) == 0 {
            req.max_tokens = Some(DEFAULT_MAX_TOKENS);
        }
        if req.model.as_deref().unwrap_or("").is_empty() {
            req.model = Some(provider.default_model().to_string());
        }
        req
    }

    /// Synchronous chat round-trip through the selected provider.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        provider: Provider,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        let adapter = self.adapter(provider)?;
        let req = Self::fill_defaults(provider, req);
        adapter.validate(&req)?;

        let driver_req = adapter.build_request(&req)?;
        tracing::debug!(provider = %provider, url = %driver_req.url, "dispatching chat request");
        let body = self
            .transport
            .post_json(cancel, &driver_req.url, &driver_req.headers, &driver_req.body)
            .await?;
        adapter.parse_response(&body)
    }

    /// Streaming chat: returns a channel of raw chunk events. The channel
    /// closes on stream end, `[DONE]`, or cancellation.
    pub async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        provider: Provider,
        req: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let adapter = Arc::clone(self.adapter(provider)?);
        let mut req = Self::fill_defaults(provider, req);
        req.stream = true;
        adapter.validate(&req)?;

        let driver_req = adapter.build_request(&req)?;
        tracing::debug!(provider = %provider, url = %driver_req.url, "dispatching stream request");
        let mut lines = self
            .transport
            .post_stream(cancel, &driver_req.url, &driver_req.headers, &driver_req.body)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let data = line.strip_prefix("data: ").unwrap_or(&line);
                if adapter.is_stream_done(data) {
                    break;
                }
                match adapter.parse_stream_line(data) {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("skipping unparseable stream line: {e}");
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl ChatBackend for ProviderDispatcher {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        provider: Provider,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        ProviderDispatcher::chat(self, cancel, provider, req).await
    }
}
