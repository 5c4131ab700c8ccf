//! Shared reqwest transport with cancellation-aware JSON and SSE calls.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Channel capacity for streaming line delivery.
const STREAM_LINE_BUFFER: usize = 32;

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the shared client. Timeout and pool sizing are env-overridable
    /// so long generations do not need code changes.
    pub fn new() -> Result<Self> {
        let timeout_secs = env::var("AGENTRY_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(300);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env::var("AGENTRY_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()?;

        Ok(Self { client })
    }

    /// POST a JSON body and decode a JSON response. Non-2xx statuses read
    /// the body and fail with a bounded excerpt.
    pub async fn post_json(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Result<Value> {
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = tokio::select! {
            r = req.send() => r?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::remote(status.as_u16(), &text));
        }

        let value = tokio::select! {
            v = resp.json::<Value>() => v?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        Ok(value)
    }

    /// POST a JSON body and stream back the response line by line.
    ///
    /// The returned channel yields every non-empty line of the response
    /// body in arrival order; the spawned reader exits (closing the
    /// channel) on stream end or when the cancellation token fires.
    pub async fn post_stream(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Result<mpsc::Receiver<String>> {
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = tokio::select! {
            r = req.send() => r?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::remote(status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel(STREAM_LINE_BUFFER);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    c = bytes.next() => c,
                    _ = cancel.cancelled() => break,
                };
                let chunk: Bytes = match chunk {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        tracing::debug!("stream body read failed: {e}");
                        break;
                    }
                    None => break,
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            // Trailing data without a newline still counts as a line.
            let tail = buffer.trim();
            if !tail.is_empty() {
                let _ = tx.send(tail.to_string()).await;
            }
        });

        Ok(rx)
    }
}
