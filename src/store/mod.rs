//! Tiered tenant configuration storage.
//!
//! One [`TenantConfig`] exists per chat-workspace connection. Storage is a
//! strategy chain evaluated in fixed priority order: a relational service
//! backend (durable, shared across replicas), a shared KV cache (lower
//! latency), and a local disk-backed map (single-replica fallback). Writes
//! fall through on tier failure; reads return the first hit and never
//! backfill lower tiers.

pub mod file;
pub mod kv;
pub mod rest;
pub mod tokens;

pub use file::FileStore;
pub use kv::KvStore;
pub use rest::RestStore;
pub use tokens::TokenExchanger;

use crate::errors::{SwitchboardError, SwitchboardResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Response-behavior flags, persisted as a JSON blob in the durable tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBehavior {
    /// Stream partial output into the chat as live message edits.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Post a provisional "thinking" message immediately on receipt.
    #[serde(default = "default_true")]
    pub show_status: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ResponseBehavior {
    fn default() -> Self {
        Self {
            streaming: true,
            show_status: true,
        }
    }
}

/// One chat-workspace connection.
///
/// Bot credential and signing secret are mandatory; everything else is
/// optional until resolved. Writes replace the whole record — callers go
/// through [`TieredTenantStore::upsert`], which merges resolved fields from
/// the previous record before persisting.
#[derive(Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    /// Upstream model-backend base URL for this tenant, when it differs
    /// from the deployment default.
    #[serde(default)]
    pub api_base_url: Option<String>,
    pub bot_token: String,
    pub signing_secret: String,
    /// Resolved workspace id, populated lazily after the first successful
    /// credential use.
    #[serde(default)]
    pub team_id: Option<String>,
    /// Resolved bot-actor id, used to filter self-authored events.
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Short-lived token delivered with the configuration push; exchanged
    /// exactly once for `api_token` and never persisted afterwards.
    #[serde(default)]
    pub bootstrap_token: Option<String>,
    /// Persistent token for the model backend.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub behavior: ResponseBehavior,
    #[serde(default = "Utc::now")]
    pub configured_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TenantConfig {
    pub fn new(tenant_id: impl Into<String>, bot_token: impl Into<String>, signing_secret: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            org_id: None,
            api_base_url: None,
            bot_token: bot_token.into(),
            signing_secret: signing_secret.into(),
            team_id: None,
            bot_user_id: None,
            provider_id: None,
            model_id: None,
            agent_id: None,
            system_prompt: None,
            bootstrap_token: None,
            api_token: None,
            behavior: ResponseBehavior::default(),
            configured_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> SwitchboardResult<()> {
        if self.tenant_id.is_empty() {
            return Err(SwitchboardError::Config("tenant_id is required".into()));
        }
        if self.bot_token.is_empty() {
            return Err(SwitchboardError::Config("bot credential is required".into()));
        }
        if self.signing_secret.is_empty() {
            return Err(SwitchboardError::Config("signing secret is required".into()));
        }
        Ok(())
    }

    /// Merge lazily-resolved fields from a previous record into an incoming
    /// one. The incoming record wins everywhere it carries a value; fields
    /// the push channel never sets (resolved ids, the exchanged API token,
    /// original configuration time) carry over.
    pub fn merged_onto(mut self, existing: &TenantConfig) -> TenantConfig {
        if self.team_id.is_none() {
            self.team_id = existing.team_id.clone();
        }
        if self.bot_user_id.is_none() {
            self.bot_user_id = existing.bot_user_id.clone();
        }
        if self.api_token.is_none() {
            self.api_token = existing.api_token.clone();
        }
        self.configured_at = existing.configured_at;
        self.updated_at = Utc::now();
        self
    }
}

// Credentials never reach logs: Debug shows presence only.
impl std::fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(v: &str) -> &'static str {
            if v.is_empty() { "[empty]" } else { "[REDACTED]" }
        }
        f.debug_struct("TenantConfig")
            .field("tenant_id", &self.tenant_id)
            .field("org_id", &self.org_id)
            .field("api_base_url", &self.api_base_url)
            .field("bot_token", &redact(&self.bot_token))
            .field("signing_secret", &redact(&self.signing_secret))
            .field("team_id", &self.team_id)
            .field("bot_user_id", &self.bot_user_id)
            .field("provider_id", &self.provider_id)
            .field("model_id", &self.model_id)
            .field("agent_id", &self.agent_id)
            .field("bootstrap_token", &self.bootstrap_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("behavior", &self.behavior)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// Storage seam for tenant configurations; lets the tier chain be composed
/// from interchangeable backends (and fakes in tests).
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Short tier name for logs and error attribution.
    fn tier(&self) -> &'static str;

    async fn save(&self, config: &TenantConfig) -> SwitchboardResult<()>;

    async fn load(&self, tenant_id: &str) -> SwitchboardResult<Option<TenantConfig>>;

    /// Secondary lookup by resolved workspace id, used by the config push
    /// channel. Not on the webhook hot path.
    async fn load_by_team(&self, team_id: &str) -> SwitchboardResult<Option<TenantConfig>>;

    async fn delete(&self, tenant_id: &str) -> SwitchboardResult<()>;

    async fn count(&self) -> SwitchboardResult<u64>;
}

/// The strategy chain over the configured tiers.
pub struct TieredTenantStore {
    tiers: Vec<Arc<dyn TenantStore>>,
    /// Live-entry counter for health reporting. Seeded from the first tier
    /// that can answer authoritatively, grows incrementally thereafter.
    live: AtomicU64,
}

impl TieredTenantStore {
    pub fn new(tiers: Vec<Arc<dyn TenantStore>>) -> Self {
        Self {
            tiers,
            live: AtomicU64::new(0),
        }
    }

    /// Seed the live-entry counter from the first shared tier that answers.
    /// The disk tier is deliberately not authoritative for other replicas,
    /// so exhaustion falls back to zero.
    pub async fn init_count(&self) {
        for tier in &self.tiers {
            if tier.tier() == "file" {
                continue;
            }
            match tier.count().await {
                Ok(n) => {
                    self.live.store(n, Ordering::Relaxed);
                    info!("tenant count seeded from tier '{}': {}", tier.tier(), n);
                    return;
                }
                Err(e) => {
                    warn!("tenant count unavailable from tier '{}': {}", tier.tier(), e);
                }
            }
        }
        debug!("tenant count starting at 0 (no shared tier reachable)");
    }

    pub fn tenant_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Idempotent upsert: merge resolved fields from any existing record,
    /// exchange the bootstrap token for a persistent one when needed, then
    /// persist through the tier chain.
    pub async fn upsert(
        &self,
        incoming: TenantConfig,
        exchanger: Option<&TokenExchanger>,
    ) -> SwitchboardResult<()> {
        incoming.validate()?;

        let existing = self.load(&incoming.tenant_id).await?;
        let mut config = match &existing {
            Some(prev) => incoming.merged_onto(prev),
            None => incoming,
        };

        // Exchange exactly once; a persisted API token short-circuits.
        if config.api_token.is_none()
            && let Some(bootstrap) = config.bootstrap_token.take()
            && let Some(exchanger) = exchanger
        {
            match exchanger.exchange(&bootstrap).await {
                Ok(token) => config.api_token = Some(token),
                Err(e) => {
                    // The bootstrap token expires in minutes; losing this
                    // exchange means later webhooks cannot authenticate.
                    warn!(
                        "token exchange failed for tenant {}: {}",
                        config.tenant_id, e
                    );
                    return Err(e);
                }
            }
        }
        // Only the long-lived token is ever persisted.
        config.bootstrap_token = None;

        self.save(&config).await?;
        if existing.is_none() {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Write to the first tier that accepts, logging and falling through on
    /// failure. Exhausting every tier is the only hard failure.
    pub async fn save(&self, config: &TenantConfig) -> SwitchboardResult<()> {
        for tier in &self.tiers {
            match tier.save(config).await {
                Ok(()) => {
                    debug!(
                        "tenant {} saved via tier '{}'",
                        config.tenant_id,
                        tier.tier()
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "tier '{}' save failed for tenant {}: {}",
                        tier.tier(),
                        config.tenant_id,
                        e
                    );
                }
            }
        }
        Err(SwitchboardError::Store {
            tier: "all",
            message: format!("every tier rejected save of tenant {}", config.tenant_id),
        })
    }

    /// Read in priority order; first hit wins. No backfill of lower tiers —
    /// that would need a reconciliation policy and isn't attempted.
    pub async fn load(&self, tenant_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        for tier in &self.tiers {
            match tier.load(tenant_id).await {
                Ok(Some(config)) => {
                    debug!("tenant {} found in tier '{}'", tenant_id, tier.tier());
                    return Ok(Some(config));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "tier '{}' load failed for tenant {}: {}",
                        tier.tier(),
                        tenant_id,
                        e
                    );
                }
            }
        }
        Ok(None)
    }

    pub async fn load_by_team(&self, team_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        for tier in &self.tiers {
            match tier.load_by_team(team_id).await {
                Ok(Some(config)) => return Ok(Some(config)),
                Ok(None) => {}
                Err(e) => {
                    warn!("tier '{}' team lookup failed: {}", tier.tier(), e);
                }
            }
        }
        Ok(None)
    }

    pub async fn delete(&self, tenant_id: &str) -> SwitchboardResult<()> {
        let mut deleted = false;
        for tier in &self.tiers {
            match tier.delete(tenant_id).await {
                Ok(()) => deleted = true,
                Err(e) => {
                    warn!(
                        "tier '{}' delete failed for tenant {}: {}",
                        tier.tier(),
                        tenant_id,
                        e
                    );
                }
            }
        }
        if deleted {
            // Saturating: the counter is advisory, never below zero.
            let _ = self
                .live
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            Ok(())
        } else {
            Err(SwitchboardError::Store {
                tier: "all",
                message: format!("every tier rejected delete of tenant {}", tenant_id),
            })
        }
    }
}

#[cfg(test)]
mod tests;
