//! Streaming generation relay.
//!
//! Opens a streaming connection to the model-inference endpoint, consumes
//! incremental text deltas, and pushes them into the chat as in-place edits
//! of a "thinking" placeholder — throttled, with a cursor glyph while
//! generation runs and a mandatory exact final flush. A mid-stream
//! transport error yields whatever partial text accumulated; only a fully
//! empty buffer escalates.

pub mod sse;

use crate::errors::{SwitchboardError, SwitchboardResult};
use crate::platform::ChatClient;
use crate::store::TenantConfig;
use crate::thread::PromptMessage;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use sse::SseDecoder;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CONNECT_TIMEOUT_SECS: u64 = 10;
/// No hard stream timeout: generation ends when the stream ends or errors.
const DEFAULT_THROTTLE: Duration = Duration::from_millis(500);
const CURSOR: &str = " ▌";

/// The one fixed human-readable failure message users ever see in chat.
pub const FAILURE_MESSAGE: &str =
    "Sorry — something went wrong while generating a response. Please try again.";

/// An image attached to the live request, forwarded to the model as a
/// structured `image_url` content part alongside the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPart {
    pub url: String,
}

/// Destination for throttled streaming flushes. The platform edit sink is
/// the production implementation; tests record flushes instead.
#[async_trait]
pub trait EditSink: Send + Sync {
    async fn flush(&self, content: &str, is_final: bool) -> SwitchboardResult<()>;
}

/// Edits a placeholder message in place via the chat platform.
pub struct PlatformEditSink {
    pub chat: ChatClient,
    pub token: String,
    pub channel: String,
    pub ts: String,
}

#[async_trait]
impl EditSink for PlatformEditSink {
    async fn flush(&self, content: &str, _is_final: bool) -> SwitchboardResult<()> {
        self.chat
            .update_message(&self.token, &self.channel, &self.ts, content)
            .await
    }
}

/// Accumulates deltas and flushes them to a sink at most once per throttle
/// interval. The terminal flush always happens, even inside the throttle
/// window, so the displayed message matches the last generated token.
pub struct StreamingEditor<S: EditSink> {
    sink: S,
    buffer: String,
    last_flush: Instant,
    throttle: Duration,
}

impl<S: EditSink> StreamingEditor<S> {
    pub fn new(sink: S) -> Self {
        Self::with_throttle(sink, DEFAULT_THROTTLE)
    }

    pub fn with_throttle(sink: S, throttle: Duration) -> Self {
        Self {
            sink,
            buffer: String::new(),
            // Allow an immediate first flush
            last_flush: Instant::now() - throttle,
            throttle,
        }
    }

    /// Append a delta; flush with the in-progress cursor if the throttle
    /// window has passed. Edit failures are logged, never fatal — a missed
    /// intermediate edit costs nothing once the final flush lands.
    pub async fn push_delta(&mut self, delta: &str) {
        self.buffer.push_str(delta);
        if self.last_flush.elapsed() >= self.throttle {
            let shown = format!("{}{}", self.buffer, CURSOR);
            if let Err(e) = self.sink.flush(&shown, false).await {
                debug!("intermediate streaming edit failed: {}", e);
            }
            self.last_flush = Instant::now();
        }
    }

    /// Terminal flush: exact buffer contents, cursor removed.
    pub async fn finalize(&mut self) -> SwitchboardResult<()> {
        self.sink.flush(&self.buffer, true).await
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }
}

pub struct GenerationRelay {
    client: Client,
    default_base_url: String,
    default_model: String,
}

impl GenerationRelay {
    pub fn new(default_base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            default_base_url: default_base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
        }
    }

    fn endpoint(&self, tenant: &TenantConfig) -> String {
        let base = tenant
            .api_base_url
            .as_deref()
            .unwrap_or(&self.default_base_url)
            .trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    fn request_body(
        &self,
        prompt: &[PromptMessage],
        media: &[MediaPart],
        tenant: &TenantConfig,
        stream: bool,
    ) -> Value {
        let model = tenant.model_id.as_deref().unwrap_or(&self.default_model);
        let mut messages: Vec<Value> = prompt.iter().map(|m| json!(m)).collect();
        // Attached images ride on the live request, the trailing user
        // message, as structured content parts.
        if !media.is_empty()
            && let Some(last) = messages.last_mut()
            && last["role"] == "user"
        {
            let mut parts = vec![json!({"type": "text", "text": last["content"]})];
            for part in media {
                parts.push(json!({"type": "image_url", "image_url": {"url": part.url}}));
            }
            last["content"] = Value::Array(parts);
        }
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(agent_id) = &tenant.agent_id {
            body["agent_id"] = json!(agent_id);
        }
        body
    }

    /// Generate a reply for the prompt. With an editor, partial output is
    /// streamed into the chat as throttled edits; without one, the call
    /// waits for completion and returns the full text for a single post.
    pub async fn respond<S: EditSink>(
        &self,
        prompt: &[PromptMessage],
        media: &[MediaPart],
        tenant: &TenantConfig,
        mut editor: Option<&mut StreamingEditor<S>>,
    ) -> SwitchboardResult<String> {
        let token = tenant.api_token.as_deref().ok_or_else(|| {
            SwitchboardError::Inference {
                message: format!("tenant {} has no API token", tenant.tenant_id),
                retryable: false,
            }
        })?;

        if !tenant.behavior.streaming {
            return self.complete(prompt, media, tenant, token).await;
        }

        let resp = self
            .client
            .post(self.endpoint(tenant))
            .bearer_auth(token)
            .json(&self.request_body(prompt, media, tenant, true))
            .send()
            .await
            .map_err(|e| SwitchboardError::Inference {
                message: format!("stream open failed: {}", e),
                retryable: true,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SwitchboardError::Inference {
                message: format!("inference endpoint returned {}", status),
                retryable: status.is_server_error(),
            });
        }

        let mut accumulated = String::new();
        let mut decoder = SseDecoder::new();
        let mut stream = resp.bytes_stream();

        'consume: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    // A degraded-but-present answer beats silence: keep
                    // whatever already arrived.
                    warn!("inference stream broke mid-generation: {}", e);
                    break 'consume;
                }
            };

            for frame in decoder.feed(&chunk) {
                if frame.is_done() {
                    break 'consume;
                }
                if let Some(delta) = extract_delta(&frame.data) {
                    accumulated.push_str(&delta);
                    if let Some(editor) = editor.as_deref_mut() {
                        editor.push_delta(&delta).await;
                    }
                }
            }
        }

        if let Some(editor) = editor.as_deref_mut() {
            if let Err(e) = editor.finalize().await {
                warn!("final streaming flush failed: {}", e);
            }
        }

        if accumulated.is_empty() {
            return Err(SwitchboardError::Inference {
                message: "stream produced no output".into(),
                retryable: true,
            });
        }
        debug!("generation complete: {} chars", accumulated.len());
        Ok(accumulated)
    }

    /// Non-streaming completion, one request, one message.
    async fn complete(
        &self,
        prompt: &[PromptMessage],
        media: &[MediaPart],
        tenant: &TenantConfig,
        token: &str,
    ) -> SwitchboardResult<String> {
        let resp = self
            .client
            .post(self.endpoint(tenant))
            .bearer_auth(token)
            .json(&self.request_body(prompt, media, tenant, false))
            .send()
            .await
            .map_err(|e| SwitchboardError::Inference {
                message: format!("completion request failed: {}", e),
                retryable: true,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SwitchboardError::Inference {
                message: format!("inference endpoint returned {}", status),
                retryable: status.is_server_error(),
            });
        }

        let json: Value = resp.json().await.map_err(|e| SwitchboardError::Inference {
            message: format!("unreadable completion response: {}", e),
            retryable: false,
        })?;

        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SwitchboardError::Inference {
                message: "completion carried no content".into(),
                retryable: false,
            })
    }
}

/// Pull the text delta out of one OpenAI-style stream frame.
fn extract_delta(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests;
