//! Tier 2: shared key-value cache over its REST surface.
//!
//! An external in-memory data grid (Upstash-style Redis REST API). Shared
//! across replicas like the database tier but cheaper to reach; used when
//! the database tier is absent or failing transiently. Commands are POSTed
//! as JSON arrays; values are JSON-encoded configs under `tenant:` keys,
//! with `team:` index keys for the secondary lookup.

use super::{TenantConfig, TenantStore};
use crate::errors::{SwitchboardError, SwitchboardResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u64 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 5;

const TENANT_PREFIX: &str = "tenant:";
const TEAM_PREFIX: &str = "team:";

pub struct KvStore {
    client: Client,
    base_url: String,
    token: String,
}

impl KvStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn store_err(&self, message: impl Into<String>) -> SwitchboardError {
        SwitchboardError::Store {
            tier: "kv",
            message: message.into(),
        }
    }

    /// Run one command; returns the `result` field of the response.
    async fn command(&self, cmd: &[&str]) -> SwitchboardResult<Value> {
        let resp = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await
            .map_err(|e| self.store_err(format!("command {:?} failed: {}", cmd.first(), e)))?;

        if !resp.status().is_success() {
            return Err(self.store_err(format!(
                "command {:?} returned {}",
                cmd.first(),
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| self.store_err(format!("unreadable response: {}", e)))?;

        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(self.store_err(format!("backend error: {}", err)));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl TenantStore for KvStore {
    fn tier(&self) -> &'static str {
        "kv"
    }

    async fn save(&self, config: &TenantConfig) -> SwitchboardResult<()> {
        let key = format!("{}{}", TENANT_PREFIX, config.tenant_id);
        let value = serde_json::to_string(config)
            .map_err(|e| self.store_err(format!("serialize failed: {}", e)))?;
        self.command(&["SET", &key, &value]).await?;

        if let Some(team_id) = &config.team_id {
            let index_key = format!("{}{}", TEAM_PREFIX, team_id);
            self.command(&["SET", &index_key, &config.tenant_id]).await?;
        }
        debug!("kv tier stored tenant {}", config.tenant_id);
        Ok(())
    }

    async fn load(&self, tenant_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        let key = format!("{}{}", TENANT_PREFIX, tenant_id);
        match self.command(&["GET", &key]).await? {
            Value::String(raw) => {
                let config = serde_json::from_str(&raw)
                    .map_err(|e| self.store_err(format!("corrupt value for {}: {}", key, e)))?;
                Ok(Some(config))
            }
            Value::Null => Ok(None),
            other => Err(self.store_err(format!("unexpected GET result: {}", other))),
        }
    }

    async fn load_by_team(&self, team_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        let index_key = format!("{}{}", TEAM_PREFIX, team_id);
        match self.command(&["GET", &index_key]).await? {
            Value::String(tenant_id) => self.load(&tenant_id).await,
            _ => Ok(None),
        }
    }

    async fn delete(&self, tenant_id: &str) -> SwitchboardResult<()> {
        let key = format!("{}{}", TENANT_PREFIX, tenant_id);
        // Drop the team index first so a half-failed delete can't leave a
        // dangling pointer to a live record.
        if let Ok(Some(config)) = self.load(tenant_id).await
            && let Some(team_id) = config.team_id
        {
            let index_key = format!("{}{}", TEAM_PREFIX, team_id);
            let _ = self.command(&["DEL", &index_key]).await;
        }
        self.command(&["DEL", &key]).await?;
        Ok(())
    }

    async fn count(&self) -> SwitchboardResult<u64> {
        let pattern = format!("{}*", TENANT_PREFIX);
        match self.command(&["KEYS", &pattern]).await? {
            Value::Array(keys) => Ok(keys.len() as u64),
            other => Err(self.store_err(format!("unexpected KEYS result: {}", other))),
        }
    }
}
