//! Tier 1: relational service backend over its REST surface.
//!
//! The durable source of truth for multi-replica deployments. Spoken to as
//! a PostgREST-style HTTP collaborator; the SQL dialect behind it is not
//! our concern. One row per tenant in the `tenant_configs` table, the
//! response-behavior flags as a JSON column.

use super::{TenantConfig, TenantStore};
use crate::errors::{SwitchboardError, SwitchboardResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 10;
const TABLE: &str = "tenant_configs";

pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, TABLE)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn store_err(&self, message: impl Into<String>) -> SwitchboardError {
        SwitchboardError::Store {
            tier: "database",
            message: message.into(),
        }
    }

    async fn select_one(&self, column: &str, value: &str) -> SwitchboardResult<Option<TenantConfig>> {
        let resp = self
            .authed(self.client.get(self.table_url()))
            .query(&[(column, format!("eq.{}", value)), ("limit", "1".to_string())])
            .send()
            .await
            .map_err(|e| self.store_err(format!("select failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(self.store_err(format!("select returned {}", resp.status())));
        }

        let mut rows: Vec<TenantConfig> = resp
            .json()
            .await
            .map_err(|e| self.store_err(format!("select body unreadable: {}", e)))?;
        Ok(rows.drain(..).next())
    }
}

#[async_trait]
impl TenantStore for RestStore {
    fn tier(&self) -> &'static str {
        "database"
    }

    async fn save(&self, config: &TenantConfig) -> SwitchboardResult<()> {
        let resp = self
            .authed(self.client.post(self.table_url()))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[config])
            .send()
            .await
            .map_err(|e| self.store_err(format!("upsert failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(self.store_err(format!("upsert returned {}", resp.status())));
        }
        debug!("database tier upserted tenant {}", config.tenant_id);
        Ok(())
    }

    async fn load(&self, tenant_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        self.select_one("tenant_id", tenant_id).await
    }

    async fn load_by_team(&self, team_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        self.select_one("team_id", team_id).await
    }

    async fn delete(&self, tenant_id: &str) -> SwitchboardResult<()> {
        let resp = self
            .authed(self.client.delete(self.table_url()))
            .query(&[("tenant_id", format!("eq.{}", tenant_id))])
            .send()
            .await
            .map_err(|e| self.store_err(format!("delete failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(self.store_err(format!("delete returned {}", resp.status())));
        }
        Ok(())
    }

    async fn count(&self) -> SwitchboardResult<u64> {
        // Exact count comes back in the Content-Range header; Range: 0-0
        // keeps the body to a single row.
        let resp = self
            .authed(self.client.get(self.table_url()))
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await
            .map_err(|e| self.store_err(format!("count failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(self.store_err(format!("count returned {}", resp.status())));
        }

        let range = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.store_err("count response missing Content-Range"))?;

        // Format: "0-0/42" or "*/0" when empty.
        range
            .rsplit('/')
            .next()
            .and_then(|total| total.parse::<u64>().ok())
            .ok_or_else(|| self.store_err(format!("unparseable Content-Range: {}", range)))
    }
}
