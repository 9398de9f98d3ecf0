//! Chat platform Web API client.
//!
//! Thin wrapper over the platform's form-encoded method endpoints
//! (`auth.test`, `chat.postMessage`, `chat.update`). Every response carries
//! an `{"ok": bool}` envelope; `ok: false` becomes a typed error with the
//! platform's error string.

use crate::errors::{SwitchboardError, SwitchboardResult};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Resolved bot identity from `auth.test`.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub team_id: String,
    pub bot_user_id: String,
}

#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    base_url: String,
}

impl ChatClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a different API host (tests, proxies).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Call one platform method; returns the parsed envelope after the
    /// `ok` check.
    async fn call(
        &self,
        token: &str,
        method: &str,
        params: &[(&str, &str)],
    ) -> SwitchboardResult<Value> {
        let url = format!("{}/{}", self.base_url, method);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .form(params)
            .send()
            .await
            .map_err(|e| SwitchboardError::Platform(format!("{} transport error: {}", method, e)))?;

        let json: Value = resp
            .json()
            .await
            .map_err(|e| SwitchboardError::Platform(format!("{} unreadable response: {}", method, e)))?;

        if json.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = json
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(SwitchboardError::Platform(format!("{}: {}", method, error)));
        }
        Ok(json)
    }

    /// Resolve the workspace and bot-actor ids behind a bot credential.
    /// Called lazily on a tenant's first successful credential use.
    pub async fn auth_test(&self, token: &str) -> SwitchboardResult<BotIdentity> {
        let json = self.call(token, "auth.test", &[]).await?;
        let team_id = json
            .get("team_id")
            .and_then(Value::as_str)
            .ok_or_else(|| SwitchboardError::Platform("auth.test: missing team_id".into()))?
            .to_string();
        let bot_user_id = json
            .get("user_id")
            .and_then(Value::as_str)
            .ok_or_else(|| SwitchboardError::Platform("auth.test: missing user_id".into()))?
            .to_string();
        debug!("resolved bot identity: team={} bot={}", team_id, bot_user_id);
        Ok(BotIdentity { team_id, bot_user_id })
    }

    /// Post a message; returns the platform-assigned ts (message id).
    /// Pass `thread_ts` to reply inside a thread.
    pub async fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> SwitchboardResult<String> {
        let mut params = vec![("channel", channel), ("text", text)];
        if let Some(ts) = thread_ts {
            params.push(("thread_ts", ts));
        }
        let json = self.call(token, "chat.postMessage", &params).await?;
        json.get("ts")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| SwitchboardError::Platform("chat.postMessage: missing ts".into()))
    }

    /// Edit a previously posted message in place.
    pub async fn update_message(
        &self,
        token: &str,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> SwitchboardResult<()> {
        self.call(
            token,
            "chat.update",
            &[("channel", channel), ("ts", ts), ("text", text)],
        )
        .await?;
        Ok(())
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
